//! Read-only schedule replica advanced by patches.
//!
//! Used by the conflict detector (in lockstep with the database) and by
//! mirror subscribers on the far side of the bus. A patch carrying a cull
//! marker resets route state before applying; participant descriptions
//! arrive out-of-band and are refreshed separately.

use std::collections::BTreeMap;

use crate::core::{
    ChangeAction, DatabaseVersion, ItineraryVersion, ParticipantDescription, ParticipantId,
    ParticipantInfo, Patch, Route, RouteId, StoredRoute,
};

#[derive(Clone, Debug, Default)]
struct MirrorEntry {
    routes: BTreeMap<RouteId, StoredRoute>,
    delay_ns: i64,
    itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, Default)]
pub struct Mirror {
    participants: BTreeMap<ParticipantId, ParticipantDescription>,
    entries: BTreeMap<ParticipantId, MirrorEntry>,
    latest_version: Option<DatabaseVersion>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_version(&self) -> Option<DatabaseVersion> {
        self.latest_version
    }

    pub fn update_participants(&mut self, participants: Vec<ParticipantInfo>) {
        self.participants = participants
            .into_iter()
            .map(|info| (info.id, info.description))
            .collect();
        let participants = &self.participants;
        self.entries.retain(|id, _| participants.contains_key(id));
    }

    pub fn participants(&self) -> impl Iterator<Item = (ParticipantId, &ParticipantDescription)> {
        self.participants.iter().map(|(&id, desc)| (id, desc))
    }

    pub fn get_participant(&self, id: ParticipantId) -> Option<&ParticipantDescription> {
        self.participants.get(&id)
    }

    pub fn apply(&mut self, patch: &Patch) {
        if patch.cull.is_some() {
            self.entries.clear();
        }
        for change in &patch.changes {
            self.apply_change(change.participant, &change.action);
        }
        self.latest_version = Some(patch.latest_version);
    }

    /// Current routes of one participant with its delay applied.
    pub fn effective_routes(&self, participant: ParticipantId) -> Vec<(RouteId, Route)> {
        self.entries
            .get(&participant)
            .map(|entry| {
                entry
                    .routes
                    .values()
                    .map(|stored| (stored.id, stored.effective(entry.delay_ns)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Full effective route state, keyed by participant. Mostly useful for
    /// comparing a caught-up mirror against the database.
    pub fn effective_state(&self) -> BTreeMap<ParticipantId, Vec<(RouteId, Route)>> {
        self.entries
            .keys()
            .map(|&id| (id, self.effective_routes(id)))
            .collect()
    }

    fn apply_change(&mut self, participant: ParticipantId, action: &ChangeAction) {
        match action {
            ChangeAction::Set {
                routes,
                itinerary_version,
            } => {
                let entry = self.entries.entry(participant).or_default();
                entry.routes = routes.iter().map(|r| (r.id, r.clone())).collect();
                entry.delay_ns = 0;
                entry.itinerary_version = *itinerary_version;
            }
            ChangeAction::Extend {
                routes,
                itinerary_version,
            } => {
                let entry = self.entries.entry(participant).or_default();
                for stored in routes {
                    entry.routes.insert(stored.id, stored.clone());
                }
                entry.itinerary_version = *itinerary_version;
            }
            ChangeAction::Delay {
                delay_ns,
                itinerary_version,
            } => {
                let entry = self.entries.entry(participant).or_default();
                entry.delay_ns = entry.delay_ns.saturating_add(*delay_ns);
                entry.itinerary_version = *itinerary_version;
            }
            ChangeAction::Erase {
                routes,
                itinerary_version,
            } => {
                let entry = self.entries.entry(participant).or_default();
                for id in routes {
                    entry.routes.remove(id);
                }
                entry.itinerary_version = *itinerary_version;
            }
            ChangeAction::Clear { itinerary_version } => {
                let entry = self.entries.entry(participant).or_default();
                entry.routes.clear();
                entry.itinerary_version = *itinerary_version;
            }
            ChangeAction::Unregister => {
                self.entries.remove(&participant);
                self.participants.remove(&participant);
            }
            ChangeAction::Restore {
                routes,
                delay_ns,
                itinerary_version,
            } => {
                self.entries.insert(
                    participant,
                    MirrorEntry {
                        routes: routes.iter().map(|r| (r.id, r.clone())).collect(),
                        delay_ns: *delay_ns,
                        itinerary_version: *itinerary_version,
                    },
                );
            }
        }
    }
}
