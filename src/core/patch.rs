//! Change-log entries and patches exchanged with mirrors.

use serde::{Deserialize, Serialize};

use super::{DatabaseVersion, ItineraryVersion, ParticipantId, RouteId, StoredRoute};

/// One applied edit, as recorded in the change log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub database_version: DatabaseVersion,
    pub participant: ParticipantId,
    pub action: ChangeAction,
}

/// What an edit did to a participant's entry.
///
/// Route trajectories are carried exactly as submitted; delays accumulate as
/// offsets on the receiving side, so a mirror replays the same arithmetic the
/// database performed instead of receiving rewritten trajectories.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChangeAction {
    Set {
        routes: Vec<StoredRoute>,
        itinerary_version: ItineraryVersion,
    },
    Extend {
        routes: Vec<StoredRoute>,
        itinerary_version: ItineraryVersion,
    },
    Delay {
        delay_ns: i64,
        itinerary_version: ItineraryVersion,
    },
    Erase {
        routes: Vec<RouteId>,
        itinerary_version: ItineraryVersion,
    },
    Clear {
        itinerary_version: ItineraryVersion,
    },
    /// The participant was unregistered; drop its entry.
    Unregister,
    /// Full entry state, used only inside snapshot (culled) patches.
    Restore {
        routes: Vec<StoredRoute>,
        delay_ns: i64,
        itinerary_version: ItineraryVersion,
    },
}

impl ChangeAction {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeAction::Set { .. } => "set",
            ChangeAction::Extend { .. } => "extend",
            ChangeAction::Delay { .. } => "delay",
            ChangeAction::Erase { .. } => "erase",
            ChangeAction::Clear { .. } => "clear",
            ChangeAction::Unregister => "unregister",
            ChangeAction::Restore { .. } => "restore",
        }
    }

    /// Route ids touched by this action.
    pub fn affected_routes(&self) -> Vec<RouteId> {
        match self {
            ChangeAction::Set { routes, .. }
            | ChangeAction::Extend { routes, .. }
            | ChangeAction::Restore { routes, .. } => routes.iter().map(|r| r.id).collect(),
            ChangeAction::Erase { routes, .. } => routes.clone(),
            ChangeAction::Delay { .. } | ChangeAction::Clear { .. } | ChangeAction::Unregister => {
                Vec::new()
            }
        }
    }
}

/// Ordered changes between two database versions, filtered by a query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub changes: Vec<Change>,
    /// When set, history before this version was unavailable and the patch
    /// carries a full snapshot base: the receiver must reset before applying.
    pub cull: Option<DatabaseVersion>,
    /// Database version the receiver reaches after applying this patch.
    pub latest_version: DatabaseVersion,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}
