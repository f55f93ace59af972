//! Frame scheduling.
//!
//! One inference per window of `skip_interval + 1` frames, always on the first
//! frame of the window. Deterministic and stateless.

/// True iff the frame at zero-based index `frame_counter` gets full inference.
pub fn should_infer(frame_counter: u64, skip_interval: u32) -> bool {
    frame_counter % (skip_interval as u64 + 1) == 0
}

/// What the pipeline does with a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Run the detector on this frame.
    Infer,
    /// Reuse the cached annotation and counts.
    Reuse,
}

/// Scheduler bound to a fixed skip interval for one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scheduler {
    skip_interval: u32,
}

impl Scheduler {
    pub fn new(skip_interval: u32) -> Self {
        Self { skip_interval }
    }

    pub fn skip_interval(&self) -> u32 {
        self.skip_interval
    }

    pub fn decide(&self, frame_counter: u64) -> Decision {
        if should_infer(frame_counter, self.skip_interval) {
            Decision::Infer
        } else {
            Decision::Reuse
        }
    }

    /// Number of inferences over a run of `frames` frames: `ceil(frames / (skip_interval + 1))`.
    pub fn inferences_for(&self, frames: u64) -> u64 {
        frames.div_ceil(self.skip_interval as u64 + 1)
    }
}
