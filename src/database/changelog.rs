//! Bounded change log backing mirror patches.

use std::collections::VecDeque;

use crate::core::{Change, ChangeAction, DatabaseVersion, Query};

/// Retains the most recent applied changes in version order. When a reader
/// asks for history that has been evicted, patch construction falls back to
/// a culled snapshot.
#[derive(Clone, Debug)]
pub struct ChangeLog {
    entries: VecDeque<Change>,
    capacity: usize,
    /// Highest version that has been evicted; entries cover `(floor, latest]`.
    floor: DatabaseVersion,
}

pub const DEFAULT_CHANGELOG_CAPACITY: usize = 16 * 1024;

impl ChangeLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            floor: DatabaseVersion::new(0),
        }
    }

    pub fn push(&mut self, change: Change) {
        self.entries.push_back(change);
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.floor = evicted.database_version;
            }
        }
    }

    /// All retained changes after `since`, filtered by `query`. Returns
    /// `None` when part of the requested span has been evicted.
    pub fn since(&self, query: &Query, since: DatabaseVersion) -> Option<Vec<Change>> {
        if since.precedes(self.floor) {
            return None;
        }
        let changes = self
            .entries
            .iter()
            .filter(|change| since.precedes(change.database_version))
            .filter_map(|change| filter_change(change, query))
            .collect();
        Some(changes)
    }

    /// Unfiltered changes after `since`; `None` when evicted.
    pub fn raw_since(&self, since: DatabaseVersion) -> Option<Vec<Change>> {
        if since.precedes(self.floor) {
            return None;
        }
        Some(
            self.entries
                .iter()
                .filter(|change| since.precedes(change.database_version))
                .cloned()
                .collect(),
        )
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGELOG_CAPACITY)
    }
}

/// Apply a query filter to a single change. Route-bearing actions have their
/// route lists narrowed by the map filter; a change whose participant is
/// filtered out disappears entirely.
fn filter_change(change: &Change, query: &Query) -> Option<Change> {
    if !query.matches_participant(change.participant) {
        return None;
    }
    let action = match &change.action {
        ChangeAction::Set {
            routes,
            itinerary_version,
        } => ChangeAction::Set {
            routes: routes
                .iter()
                .filter(|r| query.matches_map(&r.route.map))
                .cloned()
                .collect(),
            itinerary_version: *itinerary_version,
        },
        ChangeAction::Extend {
            routes,
            itinerary_version,
        } => {
            let routes: Vec<_> = routes
                .iter()
                .filter(|r| query.matches_map(&r.route.map))
                .cloned()
                .collect();
            if routes.is_empty() {
                return None;
            }
            ChangeAction::Extend {
                routes,
                itinerary_version: *itinerary_version,
            }
        }
        ChangeAction::Restore {
            routes,
            delay_ns,
            itinerary_version,
        } => ChangeAction::Restore {
            routes: routes
                .iter()
                .filter(|r| query.matches_map(&r.route.map))
                .cloned()
                .collect(),
            delay_ns: *delay_ns,
            itinerary_version: *itinerary_version,
        },
        other => other.clone(),
    };
    Some(Change {
        database_version: change.database_version,
        participant: change.participant,
        action,
    })
}
