//! Conflict detection thread.
//!
//! Keeps a private mirror advanced in lockstep with the database and asks
//! the oracle about every route that was added or effectively moved. The
//! loop blocks on a condition variable with a 100 ms floor so it also
//! notices shutdown; the database lock is held only while snapshotting.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::core::{ConflictNotice, DatabaseVersion, Message, ParticipantId, Query, topics};
use crate::database::{Mirror, ViewChange};
use crate::oracle::ConflictOracle;

use super::{NodeState, lock};

const WAKE_FLOOR: Duration = Duration::from_millis(100);

pub(crate) fn run(state: &Arc<NodeState>) {
    let mut mirror = Mirror::new();
    let query_all = Query::all();
    let mut last_checked = DatabaseVersion::new(0);
    let mut known_participants_version: Option<u64> = None;

    while !state.is_shutdown() {
        let mut refreshed_participants = None;
        let (patch, view_changes) = {
            let Some(db) = lock(&state.database) else {
                return;
            };
            let Ok((db, _)) = state.conflict_cv.wait_timeout_while(db, WAKE_FLOOR, |db| {
                db.latest_version() == last_checked
                    && Some(db.participants_version()) == known_participants_version
                    && !state.is_shutdown()
            }) else {
                return;
            };
            if state.is_shutdown() {
                return;
            }
            if db.latest_version() == last_checked
                && Some(db.participants_version()) == known_participants_version
            {
                // Casual wakeup; nothing to check yet.
                continue;
            }

            if Some(db.participants_version()) != known_participants_version {
                known_participants_version = Some(db.participants_version());
                refreshed_participants = Some(db.participants_info());
            }
            (
                db.changes(&query_all, Some(last_checked)),
                db.view_changes(last_checked),
            )
        };

        if let Some(participants) = refreshed_participants {
            mirror.update_participants(participants);
        }
        last_checked = patch.latest_version;
        mirror.apply(&patch);

        let pairs = find_conflicts(&mirror, &view_changes, state.oracle.as_ref());
        if pairs.is_empty() {
            continue;
        }

        let mut notices = Vec::new();
        {
            let Some(mut conflicts) = lock(&state.conflicts) else {
                return;
            };
            for (a, b) in pairs {
                if let Some((version, participants)) = conflicts.insert_conflict(a, b) {
                    notices.push(ConflictNotice {
                        conflict_version: version,
                        participants,
                    });
                }
            }
        }
        for notice in notices {
            info!(
                conflict = %notice.conflict_version,
                participants = ?notice.participants,
                "conflict detected"
            );
            if let Err(err) = state
                .bus
                .publish(topics::CONFLICT_NOTICE, Message::ConflictNotice(notice))
            {
                tracing::error!("failed to publish conflict notice: {err}");
            }
        }
    }
}

/// Compare every changed route against every other participant's itinerary.
fn find_conflicts(
    mirror: &Mirror,
    view_changes: &[ViewChange],
    oracle: &dyn ConflictOracle,
) -> Vec<(ParticipantId, ParticipantId)> {
    let mut pairs = Vec::new();
    for (participant, description) in mirror.participants() {
        for change in view_changes {
            if change.participant == participant {
                // No need to check a participant against itself.
                continue;
            }
            let Some(change_description) = mirror.get_participant(change.participant) else {
                continue;
            };
            if description.responsiveness.is_unresponsive()
                && change_description.responsiveness.is_unresponsive()
            {
                // Neither side could negotiate a resolution.
                continue;
            }
            for (_, route) in mirror.effective_routes(participant) {
                if route.map != change.route.map {
                    continue;
                }
                if oracle.conflicts(
                    &change_description.profile,
                    &change.route.trajectory,
                    &description.profile,
                    &route.trajectory,
                ) {
                    pairs.push((participant, change.participant));
                }
            }
        }
    }
    pairs
}
