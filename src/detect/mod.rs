mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{DetectionCapability, DetectorBackend, InferenceParams};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::BackendRegistry;
pub use result::{BoundingBox, Detection, DetectionSet};
