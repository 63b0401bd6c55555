//! Itinerary version gap tracking.
//!
//! When edits arrive with a version beyond `latest + 1` the database applies
//! them speculatively and records the skipped versions here. Ranges are
//! inclusive, disjoint, and coalesced; a retransmission that lands inside a
//! range shrinks or splits it.

use std::collections::BTreeMap;

use crate::core::{InconsistencyRange, ItineraryVersion};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InconsistencyTracker {
    /// lower -> upper, both inclusive. Ranges never overlap and are never
    /// adjacent; a range spanning the wrap point is split at the boundary.
    ranges: BTreeMap<u64, u64>,
}

impl InconsistencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, version: ItineraryVersion) -> bool {
        let v = version.get();
        self.ranges
            .range(..=v)
            .next_back()
            .is_some_and(|(_, &upper)| upper >= v)
    }

    /// Record that every version in `(last_applied, incoming)` exclusive was
    /// skipped. No-op when `incoming` directly follows `last_applied`.
    pub fn record_gap(&mut self, last_applied: ItineraryVersion, incoming: ItineraryVersion) {
        if last_applied.is_followed_by(incoming) {
            return;
        }
        let lower = last_applied.get().wrapping_add(1);
        let upper = incoming.get().wrapping_sub(1);
        if lower <= upper {
            self.insert_range(lower, upper);
        } else {
            // The gap straddles the 64-bit wrap point.
            self.insert_range(lower, u64::MAX);
            self.insert_range(0, upper);
        }
    }

    /// Remove one version from the tracked ranges. Returns true when the
    /// version was inside a range (i.e. this edit fills a gap).
    pub fn fill(&mut self, version: ItineraryVersion) -> bool {
        let v = version.get();
        let Some((&lower, &upper)) = self.ranges.range(..=v).next_back() else {
            return false;
        };
        if upper < v {
            return false;
        }
        self.ranges.remove(&lower);
        if lower < v {
            self.ranges.insert(lower, v - 1);
        }
        if v < upper {
            self.ranges.insert(v + 1, upper);
        }
        true
    }

    pub fn ranges(&self) -> Vec<InconsistencyRange> {
        self.ranges
            .iter()
            .map(|(&lower, &upper)| InconsistencyRange {
                lower: ItineraryVersion::new(lower),
                upper: ItineraryVersion::new(upper),
            })
            .collect()
    }

    fn insert_range(&mut self, mut lower: u64, mut upper: u64) {
        // Merge with any range that overlaps or touches the new one.
        let mut doomed = Vec::new();
        for (&l, &u) in self.ranges.range(..=upper.saturating_add(1)) {
            if u.saturating_add(1) >= lower {
                doomed.push(l);
                lower = lower.min(l);
                upper = upper.max(u);
            }
        }
        for l in doomed {
            self.ranges.remove(&l);
        }
        self.ranges.insert(lower, upper);
    }
}
