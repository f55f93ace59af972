//! Per-category counting.
//!
//! `aggregate` turns one inference result into a fresh `CountSnapshot`. Snapshots
//! are never edited after creation; the cache replaces them wholesale.

use anyhow::{anyhow, Result};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::detect::DetectionSet;

/// Vehicle classes of the reference deployment, in model label order.
pub const DEFAULT_CATEGORIES: [&str; 11] = [
    "Auto Rickshaw",
    "Cycle Rickshaw",
    "CNG / Tempo",
    "Bus",
    "Jeep / SUV",
    "Microbus",
    "Minibus",
    "Motorcycle",
    "Truck",
    "Private Sedan Car",
    "Trailer",
];

// -------------------- Categories --------------------

/// Ordered, non-empty list of category names. Index = model class id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Categories {
    names: Arc<[String]>,
}

impl Categories {
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(anyhow!("category list must not be empty"));
        }
        if let Some(blank) = names.iter().position(|n| n.trim().is_empty()) {
            return Err(anyhow!("category #{} has an empty name", blank));
        }
        Ok(Self {
            names: names.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl Default for Categories {
    fn default() -> Self {
        Self {
            names: DEFAULT_CATEGORIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

// -------------------- Count snapshots --------------------

/// Count per category for one inference frame, in declared category order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountSnapshot {
    categories: Categories,
    counts: Vec<u64>,
}

impl CountSnapshot {
    /// All categories at zero.
    pub fn zeroed(categories: &Categories) -> Self {
        Self {
            categories: categories.clone(),
            counts: vec![0; categories.len()],
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.categories.index_of(name).map(|idx| self.counts[idx])
    }

    pub fn get_index(&self, index: usize) -> Option<u64> {
        self.counts.get(index).copied()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn is_all_zero(&self) -> bool {
        self.counts.iter().all(|c| *c == 0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.categories.iter().zip(self.counts.iter().copied())
    }

    pub fn categories(&self) -> &Categories {
        &self.categories
    }
}

impl Serialize for CountSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.counts.len()))?;
        for (name, count) in self.iter() {
            map.serialize_entry(name, &count)?;
        }
        map.end()
    }
}

/// Which detections contribute to a count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountPolicy {
    /// Every detection with a known category.
    #[default]
    All,
    /// Only detections the tracker has given an identity.
    TrackedOnly,
}

/// Count detections per known category. Unknown category ids are ignored.
pub fn aggregate(detections: &DetectionSet, known_categories: &Categories) -> CountSnapshot {
    aggregate_with(detections, known_categories, CountPolicy::All)
}

pub fn aggregate_with(
    detections: &DetectionSet,
    known_categories: &Categories,
    policy: CountPolicy,
) -> CountSnapshot {
    let mut snapshot = CountSnapshot::zeroed(known_categories);
    for det in detections {
        if policy == CountPolicy::TrackedOnly && det.track_id.is_none() {
            continue;
        }
        if let Some(idx) = det.category_index(known_categories.len()) {
            snapshot.counts[idx] += 1;
        }
    }
    snapshot
}

// -------------------- Track tally --------------------

/// Distinct track ids seen per category over a run.
#[derive(Clone, Debug)]
pub struct TrackTally {
    categories: Categories,
    seen: HashSet<(usize, u64)>,
    totals: Vec<u64>,
}

impl TrackTally {
    pub fn new(categories: &Categories) -> Self {
        Self {
            categories: categories.clone(),
            seen: HashSet::new(),
            totals: vec![0; categories.len()],
        }
    }

    /// Record one inference result. Returns how many new tracks were seen.
    pub fn observe(&mut self, detections: &DetectionSet) -> u64 {
        let mut fresh = 0;
        for det in detections {
            let (Some(idx), Some(track)) =
                (det.category_index(self.categories.len()), det.track_id)
            else {
                continue;
            };
            if self.seen.insert((idx, track)) {
                self.totals[idx] += 1;
                fresh += 1;
            }
        }
        fresh
    }

    /// Cumulative distinct-track counts as a snapshot.
    pub fn snapshot(&self) -> CountSnapshot {
        CountSnapshot {
            categories: self.categories.clone(),
            counts: self.totals.clone(),
        }
    }

    pub fn total(&self) -> u64 {
        self.totals.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};

    fn det(category_id: i64) -> Detection {
        Detection::new(category_id, 0.9, BoundingBox::from_corners(0.0, 0.0, 4.0, 4.0))
    }

    fn five() -> Categories {
        Categories::new(["car", "bus", "truck", "bike", "van"]).unwrap()
    }

    #[test]
    fn counts_known_ids_and_drops_out_of_range() {
        let detections = DetectionSet::new(vec![det(2), det(2), det(99)]);
        let snapshot = aggregate(&detections, &five());
        assert_eq!(snapshot.get("truck"), Some(2));
        for name in ["car", "bus", "bike", "van"] {
            assert_eq!(snapshot.get(name), Some(0), "{name}");
        }
        assert_eq!(snapshot.total(), 2);
    }

    #[test]
    fn negative_ids_are_ignored() {
        let snapshot = aggregate(&DetectionSet::new(vec![det(-1), det(0)]), &five());
        assert_eq!(snapshot.get_index(0), Some(1));
        assert_eq!(snapshot.total(), 1);
    }

    #[test]
    fn snapshot_preserves_declared_order() {
        let snapshot = aggregate(&DetectionSet::default(), &five());
        let names: Vec<&str> = snapshot.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["car", "bus", "truck", "bike", "van"]);
        assert!(snapshot.is_all_zero());
    }

    #[test]
    fn snapshot_serializes_as_ordered_object() {
        let snapshot = aggregate(&DetectionSet::new(vec![det(4), det(0)]), &five());
        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(json, r#"{"car":1,"bus":0,"truck":0,"bike":0,"van":1}"#);
    }

    #[test]
    fn each_call_returns_a_new_snapshot() {
        let cats = five();
        let first = aggregate(&DetectionSet::new(vec![det(1)]), &cats);
        let second = aggregate(&DetectionSet::new(vec![det(3)]), &cats);
        assert_eq!(first.get("bus"), Some(1));
        assert_eq!(first.get("bike"), Some(0));
        assert_eq!(second.get("bus"), Some(0));
    }

    #[test]
    fn tracked_only_policy_skips_untracked_detections() {
        let detections = DetectionSet::new(vec![det(0), det(0).with_track(5), det(1)]);
        let snapshot = aggregate_with(&detections, &five(), CountPolicy::TrackedOnly);
        assert_eq!(snapshot.get("car"), Some(1));
        assert_eq!(snapshot.get("bus"), Some(0));
    }

    #[test]
    fn empty_and_blank_category_lists_are_rejected() {
        assert!(Categories::new(Vec::<String>::new()).is_err());
        assert!(Categories::new(["car", " "]).is_err());
        assert_eq!(Categories::default().len(), 11);
    }

    #[test]
    fn tally_counts_each_track_once() {
        let mut tally = TrackTally::new(&five());
        let first = DetectionSet::new(vec![det(0).with_track(1), det(2).with_track(2), det(3)]);
        let second = DetectionSet::new(vec![det(0).with_track(1), det(0).with_track(3)]);
        assert_eq!(tally.observe(&first), 2);
        assert_eq!(tally.observe(&second), 1);
        let totals = tally.snapshot();
        assert_eq!(totals.get("car"), Some(2));
        assert_eq!(totals.get("truck"), Some(1));
        assert_eq!(totals.get("bike"), Some(0));
        assert_eq!(tally.total(), 3);
    }
}
