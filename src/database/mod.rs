//! Authoritative versioned schedule state.
//!
//! The database owns one entry per registered participant and a bounded
//! change log. Every edit is atomic under the caller's lock: either the
//! entry, the change log, and the database version all advance together, or
//! nothing changes.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::core::{
    Change, ChangeAction, DatabaseVersion, InconsistencyRange, Itinerary, ItineraryVersion,
    ParticipantDescription, ParticipantId, ParticipantInfo, Patch, Query, Route, RouteId,
    StoredRoute,
};

pub mod changelog;
pub mod inconsistencies;
pub mod mirror;

pub use changelog::{ChangeLog, DEFAULT_CHANGELOG_CAPACITY};
pub use inconsistencies::InconsistencyTracker;
pub use mirror::Mirror;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("unknown participant [{0}]")]
    UnknownParticipant(ParticipantId),
}

/// What the database did with an edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditOutcome {
    /// The edit changed schedule state at this database version.
    Applied { database_version: DatabaseVersion },
    /// The edit was a duplicate, or a retransmission that only settled
    /// version bookkeeping; no schedule state changed.
    Ignored,
}

impl EditOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, EditOutcome::Applied { .. })
    }
}

/// How an incoming itinerary version relates to what was already applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    /// Exactly `latest + 1`.
    InOrder,
    /// Beyond `latest + 1`; the skipped versions became an inconsistency.
    Ahead,
    /// Inside a recorded inconsistency range; fills part of a gap.
    GapFill,
    /// At or below `latest` and not inside any gap.
    Duplicate,
}

/// State returned to a registering writer so it can resume its sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    pub id: ParticipantId,
    pub last_itinerary_version: ItineraryVersion,
    pub last_route_id: RouteId,
}

/// A route added or effectively moved since some database version, as seen
/// by the conflict detector.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewChange {
    pub participant: ParticipantId,
    pub route_id: RouteId,
    pub route: Route,
}

#[derive(Clone, Debug)]
pub struct ParticipantEntry {
    description: ParticipantDescription,
    routes: BTreeMap<RouteId, StoredRoute>,
    latest_version: ItineraryVersion,
    inconsistencies: InconsistencyTracker,
    last_route_id: RouteId,
    delay_ns: i64,
}

impl ParticipantEntry {
    fn new(description: ParticipantDescription) -> Self {
        Self {
            description,
            routes: BTreeMap::new(),
            latest_version: ItineraryVersion::new(0),
            inconsistencies: InconsistencyTracker::new(),
            last_route_id: RouteId::new(0),
            delay_ns: 0,
        }
    }

    pub fn description(&self) -> &ParticipantDescription {
        &self.description
    }

    pub fn latest_version(&self) -> ItineraryVersion {
        self.latest_version
    }

    pub fn last_route_id(&self) -> RouteId {
        self.last_route_id
    }

    pub fn delay_ns(&self) -> i64 {
        self.delay_ns
    }

    pub fn inconsistency_ranges(&self) -> Vec<InconsistencyRange> {
        self.inconsistencies.ranges()
    }

    pub fn has_inconsistencies(&self) -> bool {
        !self.inconsistencies.is_empty()
    }

    /// Current routes with the cumulative delay applied.
    pub fn effective_routes(&self) -> Vec<(RouteId, Route)> {
        self.routes
            .values()
            .map(|stored| (stored.id, stored.effective(self.delay_ns)))
            .collect()
    }

    pub fn stored_routes(&self) -> impl Iterator<Item = &StoredRoute> {
        self.routes.values()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    fn admit(&mut self, version: ItineraryVersion) -> Admission {
        if self.latest_version.is_followed_by(version) {
            self.latest_version = version;
            Admission::InOrder
        } else if self.latest_version.precedes(version) {
            self.inconsistencies.record_gap(self.latest_version, version);
            self.latest_version = version;
            Admission::Ahead
        } else if self.inconsistencies.fill(version) {
            Admission::GapFill
        } else {
            Admission::Duplicate
        }
    }

    fn assign_routes(&mut self, routes: Itinerary) -> Vec<StoredRoute> {
        routes
            .into_iter()
            .map(|route| {
                self.last_route_id = self.last_route_id.next();
                let stored = StoredRoute::new(self.last_route_id, route, self.delay_ns);
                self.routes.insert(stored.id, stored.clone());
                stored
            })
            .collect()
    }
}

pub struct ScheduleDatabase {
    entries: BTreeMap<ParticipantId, ParticipantEntry>,
    version: DatabaseVersion,
    changelog: ChangeLog,
    /// Bumped whenever the participant set or a description changes; the
    /// conflict detector compares it to refresh its mirror's participants.
    participants_version: u64,
}

impl ScheduleDatabase {
    pub fn new(changelog_capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            version: DatabaseVersion::new(0),
            changelog: ChangeLog::new(changelog_capacity),
            participants_version: 0,
        }
    }

    pub fn latest_version(&self) -> DatabaseVersion {
        self.version
    }

    pub fn participants_version(&self) -> u64 {
        self.participants_version
    }

    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.entries.keys().copied().collect()
    }

    pub fn get_participant(&self, id: ParticipantId) -> Option<&ParticipantDescription> {
        self.entries.get(&id).map(|entry| entry.description())
    }

    pub fn entry(&self, id: ParticipantId) -> Option<&ParticipantEntry> {
        self.entries.get(&id)
    }

    pub fn participants_info(&self) -> Vec<ParticipantInfo> {
        self.entries
            .iter()
            .map(|(&id, entry)| ParticipantInfo {
                id,
                description: entry.description.clone(),
            })
            .collect()
    }

    /// Create or refresh a participant entry under an externally assigned id.
    ///
    /// Re-registration keeps the existing itinerary and counters and only
    /// updates the description.
    pub fn register(
        &mut self,
        id: ParticipantId,
        description: ParticipantDescription,
    ) -> Registration {
        let entry = self
            .entries
            .entry(id)
            .and_modify(|entry| entry.description = description.clone())
            .or_insert_with(|| ParticipantEntry::new(description));
        self.participants_version = self.participants_version.wrapping_add(1);
        Registration {
            id,
            last_itinerary_version: entry.latest_version,
            last_route_id: entry.last_route_id,
        }
    }

    /// Remove a participant and its itinerary from the schedule.
    pub fn unregister(&mut self, id: ParticipantId) -> Result<(), DatabaseError> {
        if self.entries.remove(&id).is_none() {
            return Err(DatabaseError::UnknownParticipant(id));
        }
        self.participants_version = self.participants_version.wrapping_add(1);
        self.record(id, ChangeAction::Unregister);
        Ok(())
    }

    /// Replace the participant's itinerary. Resets the cumulative delay:
    /// a fresh itinerary is authored on the current time base.
    pub fn set(
        &mut self,
        participant: ParticipantId,
        itinerary: Itinerary,
        version: ItineraryVersion,
    ) -> Result<EditOutcome, DatabaseError> {
        let entry = self.entry_mut(participant)?;
        match entry.admit(version) {
            Admission::Duplicate | Admission::GapFill => Ok(EditOutcome::Ignored),
            Admission::InOrder | Admission::Ahead => {
                entry.routes.clear();
                entry.delay_ns = 0;
                let routes = entry.assign_routes(itinerary);
                Ok(self.applied(
                    participant,
                    ChangeAction::Set {
                        routes,
                        itinerary_version: version,
                    },
                ))
            }
        }
    }

    /// Append routes to the participant's itinerary.
    pub fn extend(
        &mut self,
        participant: ParticipantId,
        routes: Itinerary,
        version: ItineraryVersion,
    ) -> Result<EditOutcome, DatabaseError> {
        let entry = self.entry_mut(participant)?;
        match entry.admit(version) {
            Admission::Duplicate => Ok(EditOutcome::Ignored),
            Admission::InOrder | Admission::Ahead | Admission::GapFill => {
                let routes = entry.assign_routes(routes);
                Ok(self.applied(
                    participant,
                    ChangeAction::Extend {
                        routes,
                        itinerary_version: version,
                    },
                ))
            }
        }
    }

    /// Shift the participant's effective time base. Cumulative; never
    /// rewrites stored trajectories.
    pub fn delay(
        &mut self,
        participant: ParticipantId,
        delay_ns: i64,
        version: ItineraryVersion,
    ) -> Result<EditOutcome, DatabaseError> {
        let entry = self.entry_mut(participant)?;
        match entry.admit(version) {
            Admission::Duplicate => Ok(EditOutcome::Ignored),
            Admission::InOrder | Admission::Ahead | Admission::GapFill => {
                entry.delay_ns = entry.delay_ns.saturating_add(delay_ns);
                Ok(self.applied(
                    participant,
                    ChangeAction::Delay {
                        delay_ns,
                        itinerary_version: version,
                    },
                ))
            }
        }
    }

    /// Remove the listed routes. Unknown route ids are ignored.
    pub fn erase(
        &mut self,
        participant: ParticipantId,
        routes: Vec<RouteId>,
        version: ItineraryVersion,
    ) -> Result<EditOutcome, DatabaseError> {
        let entry = self.entry_mut(participant)?;
        match entry.admit(version) {
            Admission::Duplicate => Ok(EditOutcome::Ignored),
            Admission::InOrder | Admission::Ahead | Admission::GapFill => {
                for id in &routes {
                    entry.routes.remove(id);
                }
                Ok(self.applied(
                    participant,
                    ChangeAction::Erase {
                        routes,
                        itinerary_version: version,
                    },
                ))
            }
        }
    }

    /// Remove every route from the participant's itinerary.
    pub fn clear(
        &mut self,
        participant: ParticipantId,
        version: ItineraryVersion,
    ) -> Result<EditOutcome, DatabaseError> {
        let entry = self.entry_mut(participant)?;
        match entry.admit(version) {
            Admission::Duplicate | Admission::GapFill => Ok(EditOutcome::Ignored),
            Admission::InOrder | Admission::Ahead => {
                entry.routes.clear();
                Ok(self.applied(
                    participant,
                    ChangeAction::Clear {
                        itinerary_version: version,
                    },
                ))
            }
        }
    }

    /// Current inconsistency state for a participant, for publication after
    /// an edit.
    pub fn inconsistencies(
        &self,
        participant: ParticipantId,
    ) -> Option<(Vec<InconsistencyRange>, ItineraryVersion)> {
        self.entries
            .get(&participant)
            .map(|entry| (entry.inconsistency_ranges(), entry.latest_version))
    }

    /// Ordered changes after `since` filtered by `query`; a culled snapshot
    /// when `since` is absent or the requested history was evicted.
    pub fn changes(&self, query: &Query, since: Option<DatabaseVersion>) -> Patch {
        match since {
            Some(since) => match self.changelog.since(query, since) {
                Some(changes) => Patch {
                    changes,
                    cull: None,
                    latest_version: self.version,
                },
                None => self.snapshot(query),
            },
            None => self.snapshot(query),
        }
    }

    /// Routes added or effectively moved since `since`, resolved against
    /// current state. Falls back to every current route when the requested
    /// span was evicted from the change log.
    pub fn view_changes(&self, since: DatabaseVersion) -> Vec<ViewChange> {
        let Some(changes) = self.changelog.raw_since(since) else {
            return self.all_view_changes();
        };

        let mut touched: BTreeMap<ParticipantId, BTreeSet<RouteId>> = BTreeMap::new();
        let mut delayed: Vec<ParticipantId> = Vec::new();
        for change in &changes {
            match &change.action {
                ChangeAction::Set { routes, .. }
                | ChangeAction::Extend { routes, .. }
                | ChangeAction::Restore { routes, .. } => {
                    let slots = touched.entry(change.participant).or_default();
                    slots.extend(routes.iter().map(|route| route.id));
                }
                ChangeAction::Delay { .. } => delayed.push(change.participant),
                ChangeAction::Erase { .. }
                | ChangeAction::Clear { .. }
                | ChangeAction::Unregister => {}
            }
        }
        for participant in delayed {
            if let Some(entry) = self.entries.get(&participant) {
                touched
                    .entry(participant)
                    .or_default()
                    .extend(entry.routes.keys().copied());
            }
        }

        let mut view = Vec::new();
        for (participant, routes) in touched {
            let Some(entry) = self.entries.get(&participant) else {
                continue;
            };
            for route_id in routes {
                if let Some(stored) = entry.routes.get(&route_id) {
                    view.push(ViewChange {
                        participant,
                        route_id,
                        route: stored.effective(entry.delay_ns),
                    });
                }
            }
        }
        view
    }

    fn all_view_changes(&self) -> Vec<ViewChange> {
        let mut view = Vec::new();
        for (&participant, entry) in &self.entries {
            for (route_id, route) in entry.effective_routes() {
                view.push(ViewChange {
                    participant,
                    route_id,
                    route,
                });
            }
        }
        view
    }

    fn snapshot(&self, query: &Query) -> Patch {
        let mut changes = Vec::new();
        for (&id, entry) in &self.entries {
            if !query.matches_participant(id) {
                continue;
            }
            let routes = entry
                .routes
                .values()
                .filter(|stored| query.matches_map(&stored.route.map))
                .cloned()
                .collect();
            changes.push(Change {
                database_version: self.version,
                participant: id,
                action: ChangeAction::Restore {
                    routes,
                    delay_ns: entry.delay_ns,
                    itinerary_version: entry.latest_version,
                },
            });
        }
        Patch {
            changes,
            cull: Some(self.version),
            latest_version: self.version,
        }
    }

    fn entry_mut(
        &mut self,
        participant: ParticipantId,
    ) -> Result<&mut ParticipantEntry, DatabaseError> {
        self.entries
            .get_mut(&participant)
            .ok_or(DatabaseError::UnknownParticipant(participant))
    }

    fn applied(&mut self, participant: ParticipantId, action: ChangeAction) -> EditOutcome {
        let database_version = self.record(participant, action);
        EditOutcome::Applied { database_version }
    }

    fn record(&mut self, participant: ParticipantId, action: ChangeAction) -> DatabaseVersion {
        self.version = self.version.next();
        self.changelog.push(Change {
            database_version: self.version,
            participant,
            action,
        });
        self.version
    }
}

impl Default for ScheduleDatabase {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGELOG_CAPACITY)
    }
}
