//! Annotation cache.
//!
//! Holds exactly one generation: the freshest annotated frame and the counts that
//! belong to it. Both are swapped in a single assignment, so a reader can never
//! see a frame from one inference paired with counts from another.

use std::sync::Arc;

use crate::counts::{Categories, CountSnapshot};
use crate::frame::{AnnotatedFrame, Frame};

#[derive(Clone, Debug)]
struct CacheEntry {
    frame: Arc<AnnotatedFrame>,
    counts: Arc<CountSnapshot>,
}

/// Most recent inference output, reused on skipped frames.
#[derive(Clone, Debug)]
pub struct AnnotationCache {
    entry: Option<CacheEntry>,
    empty_counts: Arc<CountSnapshot>,
}

impl AnnotationCache {
    pub fn new(categories: &Categories) -> Self {
        Self {
            entry: None,
            empty_counts: Arc::new(CountSnapshot::zeroed(categories)),
        }
    }

    /// Replace the cached pair.
    pub fn update(&mut self, frame: Arc<AnnotatedFrame>, counts: Arc<CountSnapshot>) {
        self.entry = Some(CacheEntry { frame, counts });
    }

    /// Cached pair, or `raw` as a pass-through with all-zero counts if nothing
    /// has been cached yet.
    pub fn read(&self, raw: &Frame) -> (Arc<AnnotatedFrame>, Arc<CountSnapshot>) {
        match &self.entry {
            Some(entry) => (entry.frame.clone(), entry.counts.clone()),
            None => (
                Arc::new(AnnotatedFrame::passthrough(raw.clone())),
                self.empty_counts.clone(),
            ),
        }
    }

    pub fn has_inference(&self) -> bool {
        self.entry.is_some()
    }

    /// Sequence number of the frame the cached annotation came from.
    pub fn last_inferred_seq(&self) -> Option<u64> {
        self.entry.as_ref().map(|e| e.frame.source_seq())
    }

    /// Latest counts, if any inference has happened.
    pub fn last_counts(&self) -> Option<Arc<CountSnapshot>> {
        self.entry.as_ref().map(|e| e.counts.clone())
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}
