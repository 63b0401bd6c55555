//! Mirror query filters.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{ParticipantId, Route};

/// Describes which slice of the schedule a mirror subscriber cares about.
///
/// An empty filter dimension means "everything". Two queries with the same
/// filters are the same query; the registry deduplicates on equality.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Restrict to these participants; `None` admits all.
    pub participants: Option<BTreeSet<ParticipantId>>,
    /// Restrict to routes on these maps; `None` admits all.
    pub maps: Option<BTreeSet<String>>,
}

impl Query {
    /// The query that matches the entire schedule.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_participants(participants: impl IntoIterator<Item = ParticipantId>) -> Self {
        Self {
            participants: Some(participants.into_iter().collect()),
            maps: None,
        }
    }

    pub fn for_maps<S: Into<String>>(maps: impl IntoIterator<Item = S>) -> Self {
        Self {
            participants: None,
            maps: Some(maps.into_iter().map(Into::into).collect()),
        }
    }

    pub fn matches_participant(&self, participant: ParticipantId) -> bool {
        match &self.participants {
            Some(set) => set.contains(&participant),
            None => true,
        }
    }

    pub fn matches_map(&self, map: &str) -> bool {
        match &self.maps {
            Some(set) => set.contains(map),
            None => true,
        }
    }

    pub fn matches_route(&self, participant: ParticipantId, route: &Route) -> bool {
        self.matches_participant(participant) && self.matches_map(&route.map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Trajectory;

    #[test]
    fn empty_query_matches_everything() {
        let q = Query::all();
        assert!(q.matches_participant(ParticipantId::new(3)));
        assert!(q.matches_map("anywhere"));
    }

    #[test]
    fn participant_filter_is_exact() {
        let q = Query::for_participants([ParticipantId::new(1), ParticipantId::new(2)]);
        assert!(q.matches_participant(ParticipantId::new(2)));
        assert!(!q.matches_participant(ParticipantId::new(3)));
    }

    #[test]
    fn map_filter_applies_to_routes() {
        let q = Query::for_maps(["mapA"]);
        let on_a = Route::new("mapA", Trajectory::new(0, 1));
        let on_b = Route::new("mapB", Trajectory::new(0, 1));
        assert!(q.matches_route(ParticipantId::new(1), &on_a));
        assert!(!q.matches_route(ParticipantId::new(1), &on_b));
    }
}
