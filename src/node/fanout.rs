//! Mirror update fan-out.
//!
//! Runs on a timer thread. Each tick serves every registered query: pending
//! remediation requests first (full snapshots or stale-version patches),
//! then one incremental patch if the database moved since the last send.
//! Patches are computed under the database lock and published after both
//! locks are released.

use crate::core::{Message, MirrorUpdate, topics};

use super::{NodeState, lock};

pub(crate) fn update_mirrors(state: &NodeState) {
    let mut updates: Vec<(String, MirrorUpdate)> = Vec::new();
    {
        let Some(mut registry) = lock(&state.registry) else {
            return;
        };
        let Some(db) = lock(&state.database) else {
            return;
        };
        let current = db.latest_version();

        for (id, record) in registry.iter_mut() {
            let topic = topics::query_update(id);

            for request in std::mem::take(&mut record.remediation) {
                let patch = db.changes(&record.query, request);
                updates.push((
                    topic.clone(),
                    MirrorUpdate {
                        node_version: state.node_version,
                        database_version: current,
                        patch,
                        is_remedial_update: true,
                    },
                ));
            }

            if record.last_sent_version == Some(current) {
                continue;
            }
            let patch = db.changes(&record.query, record.last_sent_version);
            record.last_sent_version = Some(current);
            // Empty incremental patches with nothing culled carry no news.
            if patch.is_empty() && patch.cull.is_none() {
                continue;
            }
            updates.push((
                topic,
                MirrorUpdate {
                    node_version: state.node_version,
                    database_version: current,
                    patch,
                    is_remedial_update: false,
                },
            ));
        }
    }

    for (topic, update) in updates {
        if let Err(err) = state
            .bus
            .publish(&topic, Message::MirrorUpdate(Box::new(update)))
        {
            tracing::error!(%topic, "failed to publish mirror update: {err}");
        }
    }
}
