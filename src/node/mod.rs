//! The schedule coordinator node.
//!
//! Owns the database, the query registry, and the negotiation engine, and
//! runs the threads that connect them: bus intake, RPC executor, mirror
//! fan-out tick, query cleanup sweep, conflict detector, and heartbeat.
//!
//! Locking discipline: the database lock covers every edit, patch
//! computation, and view-change snapshot; the conflicts lock covers the
//! negotiation engine. Registry before database where both are needed, and
//! every publish happens after all locks are released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::config::Config;
use crate::core::{
    ConflictAck, ConflictConclusion, ConflictForfeit, ConflictProposal, ConflictRefusal,
    ConflictRejection, DatabaseVersion, InconsistencyRange, ItineraryClear, ItineraryDelay,
    ItineraryErase, ItineraryExtend, ItinerarySet, ItineraryVersion, Message, NegotiationVersion,
    ParticipantDescription, ParticipantId, ParticipantInfo, ParticipantsInfo, Query, QueryId,
    RouteId, ScheduleInconsistency, ScheduleQueries, topics,
};
use crate::database::{DatabaseError, EditOutcome, ScheduleDatabase};
use crate::negotiation::{ActiveConflicts, Evaluator, QuickestFinishEvaluator};
use crate::oracle::{ConflictOracle, IntervalOverlapOracle};

pub mod detector;
pub mod fanout;
pub mod registry;
pub mod rpc;
pub mod store;

use registry::QueryRegistry;
use rpc::{
    RequestChangesResult, RpcClient, RpcEnvelope, RpcRequest, RpcResponse,
};
use store::{JsonFileStore, ParticipantStore, StoreError};

/// Poll interval for shutdown checks in blocking loops.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub(crate) struct NodeState {
    pub node_version: u64,
    pub database: Mutex<ScheduleDatabase>,
    /// Paired with the database mutex; signalled on applied edits and
    /// participant-set changes.
    pub conflict_cv: Condvar,
    pub registry: Mutex<QueryRegistry>,
    pub conflicts: Mutex<ActiveConflicts>,
    pub bus: Arc<dyn MessageBus>,
    pub store: Mutex<Box<dyn ParticipantStore>>,
    pub oracle: Box<dyn ConflictOracle>,
    pub evaluator: Box<dyn Evaluator>,
    pub shutdown: AtomicBool,
}

impl NodeState {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Lock helper that survives a poisoned mutex by bailing out of the caller.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.lock() {
        Ok(guard) => Some(guard),
        Err(_) => {
            error!("schedule node lock poisoned");
            None
        }
    }
}

pub struct ScheduleNode {
    state: Arc<NodeState>,
    rpc_tx: Sender<RpcEnvelope>,
    threads: Vec<JoinHandle<()>>,
}

impl ScheduleNode {
    /// Build a node with the default oracle, evaluator, and the persistent
    /// registry named by the config. Registry load failure is fatal.
    pub fn new(config: &Config, bus: Arc<dyn MessageBus>) -> Result<Self, StoreError> {
        let store = JsonFileStore::open(&config.registry_path)?;
        info!(
            path = %store.path().display(),
            participants = store.len(),
            "loaded participant registry"
        );
        Ok(Self::with_dependencies(
            config,
            bus,
            Box::new(store),
            Box::new(IntervalOverlapOracle),
            Box::new(QuickestFinishEvaluator),
        ))
    }

    pub fn with_dependencies(
        config: &Config,
        bus: Arc<dyn MessageBus>,
        store: Box<dyn ParticipantStore>,
        oracle: Box<dyn ConflictOracle>,
        evaluator: Box<dyn Evaluator>,
    ) -> Self {
        let state = Arc::new(NodeState {
            node_version: config.node_version,
            database: Mutex::new(ScheduleDatabase::new(config.changelog_capacity)),
            conflict_cv: Condvar::new(),
            registry: Mutex::new(QueryRegistry::new()),
            conflicts: Mutex::new(ActiveConflicts::new()),
            bus,
            store: Mutex::new(store),
            oracle,
            evaluator,
            shutdown: AtomicBool::new(false),
        });

        let (rpc_tx, rpc_rx) = crossbeam::channel::unbounded();
        let mut threads = Vec::new();

        {
            let state = Arc::clone(&state);
            let intake = state
                .bus
                .subscribe(&[
                    topics::ITINERARY_SET,
                    topics::ITINERARY_EXTEND,
                    topics::ITINERARY_DELAY,
                    topics::ITINERARY_ERASE,
                    topics::ITINERARY_CLEAR,
                    topics::CONFLICT_PROPOSAL,
                    topics::CONFLICT_REJECTION,
                    topics::CONFLICT_FORFEIT,
                    topics::CONFLICT_REFUSAL,
                    topics::CONFLICT_ACK,
                ])
                .ok();
            threads.push(std::thread::spawn(move || {
                let Some(intake) = intake else {
                    error!("failed to subscribe schedule intake topics");
                    return;
                };
                run_intake(&state, &intake);
            }));
        }
        {
            let state = Arc::clone(&state);
            threads.push(std::thread::spawn(move || run_rpc_executor(&state, &rpc_rx)));
        }
        {
            let state = Arc::clone(&state);
            let period = config.mirror_update_period();
            threads.push(std::thread::spawn(move || {
                run_timer(&state, period, fanout::update_mirrors);
            }));
        }
        {
            let state = Arc::clone(&state);
            let period = config.query_cleanup_period();
            let grace = config.query_grace_period();
            threads.push(std::thread::spawn(move || {
                run_timer(&state, period, |state| cleanup_queries(state, grace));
            }));
        }
        {
            let state = Arc::clone(&state);
            threads.push(std::thread::spawn(move || detector::run(&state)));
        }
        {
            let state = Arc::clone(&state);
            let period = config.heartbeat_period();
            threads.push(std::thread::spawn(move || {
                run_timer(&state, period, |state| {
                    if let Err(err) = state.bus.publish(topics::HEARTBEAT, Message::Heartbeat) {
                        error!("failed to publish heartbeat: {err}");
                    }
                });
            }));
        }

        Self {
            state,
            rpc_tx,
            threads,
        }
    }

    pub fn rpc_client(&self) -> RpcClient {
        RpcClient::new(self.rpc_tx.clone())
    }

    pub fn node_version(&self) -> u64 {
        self.state.node_version
    }

    /// Current database version; handy for tests and monitoring.
    pub fn latest_version(&self) -> DatabaseVersion {
        lock(&self.state.database)
            .map(|db| db.latest_version())
            .unwrap_or_default()
    }

    /// Outstanding inconsistency ranges for a participant.
    pub fn inconsistencies(&self, participant: ParticipantId) -> Vec<InconsistencyRange> {
        lock(&self.state.database)
            .and_then(|db| db.inconsistencies(participant).map(|(ranges, _)| ranges))
            .unwrap_or_default()
    }

    /// Counts of live negotiations and concluded ones awaiting
    /// acknowledgement.
    pub fn negotiation_counts(&self) -> (usize, usize) {
        lock(&self.state.conflicts)
            .map(|conflicts| (conflicts.live_count(), conflicts.awaiting_count()))
            .unwrap_or((0, 0))
    }

    pub fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::Release);
        // Wake the detector so it can observe the flag.
        self.state.conflict_cv.notify_all();
    }
}

impl Drop for ScheduleNode {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Sleep in small chunks so shutdown is observed promptly. Returns true
/// when shutdown was signalled.
fn sleep_with_shutdown(state: &NodeState, period: Duration) -> bool {
    let deadline = Instant::now() + period;
    loop {
        if state.is_shutdown() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

fn run_timer(state: &Arc<NodeState>, period: Duration, tick: impl Fn(&NodeState)) {
    loop {
        if sleep_with_shutdown(state, period) {
            return;
        }
        tick(state);
    }
}

fn run_intake(state: &Arc<NodeState>, intake: &crate::bus::BusSubscription) {
    loop {
        match intake.recv_timeout(SHUTDOWN_POLL) {
            Ok(message) => dispatch(state, message),
            Err(RecvTimeoutError::Timeout) => {
                if state.is_shutdown() {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn dispatch(state: &Arc<NodeState>, message: Message) {
    match message {
        Message::ItinerarySet(msg) => itinerary_set(state, msg),
        Message::ItineraryExtend(msg) => itinerary_extend(state, msg),
        Message::ItineraryDelay(msg) => itinerary_delay(state, msg),
        Message::ItineraryErase(msg) => itinerary_erase(state, msg),
        Message::ItineraryClear(msg) => itinerary_clear(state, msg),
        Message::ConflictProposal(msg) => receive_proposal(state, msg),
        Message::ConflictRejection(msg) => receive_rejection(state, msg),
        Message::ConflictForfeit(msg) => receive_forfeit(state, msg),
        Message::ConflictRefusal(msg) => receive_refusal(state, msg),
        Message::ConflictAck(msg) => receive_conclusion_ack(state, msg),
        other => warn!(kind = other.kind(), "unexpected message on intake"),
    }
}

/// Outcome of one edit while the database lock was held.
struct EditReport {
    applied: bool,
    inconsistency: Option<ScheduleInconsistency>,
    latest_version: ItineraryVersion,
    participant: ParticipantId,
}

fn finish_edit(
    state: &NodeState,
    participant: ParticipantId,
    result: Result<EditOutcome, DatabaseError>,
    db: MutexGuard<'_, ScheduleDatabase>,
) {
    let report = match result {
        Err(DatabaseError::UnknownParticipant(id)) => {
            drop(db);
            warn!(participant = %id, "edit for unknown participant");
            return;
        }
        Ok(outcome) => {
            let (ranges, latest_version) = db
                .inconsistencies(participant)
                .unwrap_or((Vec::new(), ItineraryVersion::new(0)));
            let inconsistency = (!ranges.is_empty()).then(|| ScheduleInconsistency {
                participant,
                ranges,
                last_known_version: latest_version,
            });
            EditReport {
                applied: outcome.is_applied(),
                inconsistency,
                latest_version,
                participant,
            }
        }
    };
    drop(db);

    if report.applied {
        state.conflict_cv.notify_all();
    }
    if let Some(inconsistency) = report.inconsistency {
        if let Err(err) = state.bus.publish(
            topics::INCONSISTENCY,
            Message::ScheduleInconsistency(inconsistency),
        ) {
            error!("failed to publish inconsistency notice: {err}");
        }
    }

    if let Some(mut conflicts) = lock(&state.conflicts) {
        conflicts.check(report.participant, report.latest_version);
    }
}

fn itinerary_set(state: &Arc<NodeState>, msg: ItinerarySet) {
    let Some(mut db) = lock(&state.database) else {
        return;
    };
    let result = db.set(msg.participant, msg.itinerary, msg.itinerary_version);
    finish_edit(state, msg.participant, result, db);
}

fn itinerary_extend(state: &Arc<NodeState>, msg: ItineraryExtend) {
    let Some(mut db) = lock(&state.database) else {
        return;
    };
    let result = db.extend(msg.participant, msg.routes, msg.itinerary_version);
    finish_edit(state, msg.participant, result, db);
}

fn itinerary_delay(state: &Arc<NodeState>, msg: ItineraryDelay) {
    let Some(mut db) = lock(&state.database) else {
        return;
    };
    let result = db.delay(msg.participant, msg.delay_ns, msg.itinerary_version);
    finish_edit(state, msg.participant, result, db);
}

fn itinerary_erase(state: &Arc<NodeState>, msg: ItineraryErase) {
    let Some(mut db) = lock(&state.database) else {
        return;
    };
    let result = db.erase(msg.participant, msg.routes, msg.itinerary_version);
    finish_edit(state, msg.participant, result, db);
}

fn itinerary_clear(state: &Arc<NodeState>, msg: ItineraryClear) {
    let Some(mut db) = lock(&state.database) else {
        return;
    };
    let result = db.clear(msg.participant, msg.itinerary_version);
    finish_edit(state, msg.participant, result, db);
}

/// Check a negotiation for readiness or completion after it advanced, and
/// conclude it if so. Returns the conclusion to publish.
fn maybe_conclude(
    state: &NodeState,
    conflicts: &mut ActiveConflicts,
    version: NegotiationVersion,
) -> Option<ConflictConclusion> {
    let (chosen, complete) = {
        let room = conflicts.room_mut(version)?;
        if room.negotiation.ready() {
            (room.negotiation.evaluate(state.evaluator.as_ref()), false)
        } else {
            (None, room.negotiation.complete())
        }
    };

    if let Some(table) = chosen {
        conflicts.conclude(version)?;
        info!(conflict = %version, table = ?table, "resolved negotiation");
        Some(ConflictConclusion {
            conflict_version: version,
            resolved: true,
            table,
        })
    } else if complete {
        conflicts.conclude(version)?;
        info!(conflict = %version, "negotiation ended with all branches forfeited");
        Some(ConflictConclusion {
            conflict_version: version,
            resolved: false,
            table: Vec::new(),
        })
    } else {
        None
    }
}

fn publish_conclusion(state: &NodeState, conclusion: ConflictConclusion) {
    if let Err(err) = state.bus.publish(
        topics::CONFLICT_CONCLUSION,
        Message::ConflictConclusion(conclusion),
    ) {
        error!("failed to publish conflict conclusion: {err}");
    }
}

fn receive_proposal(state: &Arc<NodeState>, msg: ConflictProposal) {
    let version = msg.conflict_version;
    let conclusion = {
        let Some(mut conflicts) = lock(&state.conflicts) else {
            return;
        };
        let Some(room) = conflicts.room_mut(version) else {
            return;
        };
        if room.receive_proposal(msg) {
            maybe_conclude(state, &mut conflicts, version)
        } else {
            None
        }
    };
    if let Some(conclusion) = conclusion {
        publish_conclusion(state, conclusion);
    }
}

fn receive_rejection(state: &Arc<NodeState>, msg: ConflictRejection) {
    let version = msg.conflict_version;
    let conclusion = {
        let Some(mut conflicts) = lock(&state.conflicts) else {
            return;
        };
        let Some(room) = conflicts.room_mut(version) else {
            return;
        };
        if room.receive_rejection(msg) {
            maybe_conclude(state, &mut conflicts, version)
        } else {
            None
        }
    };
    if let Some(conclusion) = conclusion {
        publish_conclusion(state, conclusion);
    }
}

fn receive_forfeit(state: &Arc<NodeState>, msg: ConflictForfeit) {
    let version = msg.conflict_version;
    let conclusion = {
        let Some(mut conflicts) = lock(&state.conflicts) else {
            return;
        };
        let Some(room) = conflicts.room_mut(version) else {
            return;
        };
        if room.receive_forfeit(msg) {
            maybe_conclude(state, &mut conflicts, version)
        } else {
            None
        }
    };
    if let Some(conclusion) = conclusion {
        publish_conclusion(state, conclusion);
    }
}

fn receive_refusal(state: &Arc<NodeState>, msg: ConflictRefusal) {
    let refused = {
        let Some(mut conflicts) = lock(&state.conflicts) else {
            return;
        };
        conflicts.refuse(msg.conflict_version)
    };
    if refused {
        info!(conflict = %msg.conflict_version, "negotiation refused");
        publish_conclusion(
            state,
            ConflictConclusion {
                conflict_version: msg.conflict_version,
                resolved: false,
                table: Vec::new(),
            },
        );
    }
}

fn receive_conclusion_ack(state: &Arc<NodeState>, msg: ConflictAck) {
    let Some(mut conflicts) = lock(&state.conflicts) else {
        return;
    };
    for ack in msg.acknowledgments {
        let updating = ack.updating.then_some(ack.itinerary_version);
        conflicts.acknowledge(msg.conflict_version, ack.participant, updating);
    }
}

fn run_rpc_executor(state: &Arc<NodeState>, requests: &Receiver<RpcEnvelope>) {
    loop {
        match requests.recv_timeout(SHUTDOWN_POLL) {
            Ok(envelope) => handle_rpc(state, envelope),
            Err(RecvTimeoutError::Timeout) => {
                if state.is_shutdown() {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn handle_rpc(state: &Arc<NodeState>, envelope: RpcEnvelope) {
    let response = match envelope.request {
        RpcRequest::RegisterParticipant(description) => register_participant(state, description),
        RpcRequest::UnregisterParticipant(id) => unregister_participant(state, id),
        RpcRequest::RegisterQuery(query) => register_query(state, query),
        RpcRequest::RequestChanges {
            query_id,
            version,
            full_update,
        } => request_changes(state, query_id, version, full_update),
    };
    let _ = envelope.respond.send(response);
}

fn register_participant(
    state: &NodeState,
    description: ParticipantDescription,
) -> RpcResponse {
    let assigned = match lock(&state.store) {
        Some(mut store) => store.add_or_retrieve(&description),
        None => {
            return registration_error("participant registry unavailable");
        }
    };
    let id = match assigned {
        Ok(id) => id,
        Err(err) => {
            error!(
                owner = %description.owner,
                name = %description.name,
                "failed to register participant: {err}"
            );
            return registration_error(&err.to_string());
        }
    };

    let (registration, participants) = {
        let Some(mut db) = lock(&state.database) else {
            return registration_error("schedule database unavailable");
        };
        let registration = db.register(id, description.clone());
        (registration, db.participants_info())
    };
    state.conflict_cv.notify_all();
    broadcast_participants(state, participants);
    info!(
        participant = %id,
        name = %description.name,
        owner = %description.owner,
        "registered participant"
    );

    RpcResponse::Registration {
        participant_id: registration.id,
        last_itinerary_version: registration.last_itinerary_version,
        last_route_id: registration.last_route_id,
        error: String::new(),
    }
}

fn registration_error(error: &str) -> RpcResponse {
    RpcResponse::Registration {
        participant_id: ParticipantId::new(0),
        last_itinerary_version: ItineraryVersion::new(0),
        last_route_id: RouteId::new(0),
        error: error.to_string(),
    }
}

fn unregister_participant(state: &NodeState, id: ParticipantId) -> RpcResponse {
    let result = {
        let Some(mut db) = lock(&state.database) else {
            return RpcResponse::Unregistration {
                confirmation: false,
                error: "schedule database unavailable".to_string(),
            };
        };
        db.unregister(id).map(|()| db.participants_info())
    };
    match result {
        Ok(participants) => {
            state.conflict_cv.notify_all();
            broadcast_participants(state, participants);
            if let Some(mut store) = lock(&state.store)
                && let Err(err) = store.remove(id)
            {
                error!(participant = %id, "failed to prune participant registry: {err}");
            }
            info!(participant = %id, "unregistered participant");
            RpcResponse::Unregistration {
                confirmation: true,
                error: String::new(),
            }
        }
        Err(err) => {
            error!(participant = %id, "failed to unregister: {err}");
            RpcResponse::Unregistration {
                confirmation: false,
                error: err.to_string(),
            }
        }
    }
}

fn broadcast_participants(state: &NodeState, participants: Vec<ParticipantInfo>) {
    if let Err(err) = state.bus.publish_retained(
        topics::PARTICIPANTS_INFO,
        Message::ParticipantsInfo(ParticipantsInfo { participants }),
    ) {
        error!("failed to broadcast participants: {err}");
    }
}

fn register_query(state: &NodeState, query: Query) -> RpcResponse {
    let registered = {
        let Some(mut registry) = lock(&state.registry) else {
            return RpcResponse::QueryRegistration {
                query_id: QueryId::new(0),
                node_version: state.node_version,
                error: "query registry unavailable".to_string(),
            };
        };
        registry
            .register(query, Instant::now())
            .map(|id| (id, registry.announce()))
    };
    match registered {
        Ok((query_id, announce)) => {
            broadcast_queries(state, announce);
            info!(query = %query_id, "registered query");
            RpcResponse::QueryRegistration {
                query_id,
                node_version: state.node_version,
                error: String::new(),
            }
        }
        Err(err) => {
            error!("failed to register query: {err}");
            RpcResponse::QueryRegistration {
                query_id: QueryId::new(0),
                node_version: state.node_version,
                error: err.to_string(),
            }
        }
    }
}

fn broadcast_queries(state: &NodeState, (ids, queries): (Vec<QueryId>, Vec<Query>)) {
    if let Err(err) = state.bus.publish_retained(
        topics::QUERIES_INFO,
        Message::ScheduleQueries(ScheduleQueries {
            node_version: state.node_version,
            ids,
            queries,
        }),
    ) {
        error!("failed to broadcast queries: {err}");
    }
}

fn request_changes(
    state: &NodeState,
    query_id: QueryId,
    version: DatabaseVersion,
    full_update: bool,
) -> RpcResponse {
    let Some(mut registry) = lock(&state.registry) else {
        return RpcResponse::ChangesRequested {
            result: RequestChangesResult::UnknownQueryId,
        };
    };
    let result = match registry.request_changes(query_id, version, full_update) {
        Ok(()) => RequestChangesResult::RequestAccepted,
        Err(err) => {
            warn!(query = %query_id, "change request rejected: {err}");
            RequestChangesResult::UnknownQueryId
        }
    };
    RpcResponse::ChangesRequested { result }
}

fn cleanup_queries(state: &NodeState, grace_period: Duration) {
    let removed_announce = {
        let Some(mut registry) = lock(&state.registry) else {
            return;
        };
        let removed = registry.cleanup(Instant::now(), grace_period, |id| {
            state
                .bus
                .subscriber_count(&topics::query_update(id))
                .unwrap_or(0)
        });
        if removed.is_empty() {
            None
        } else {
            info!(removed = removed.len(), "dropped idle queries");
            Some(registry.announce())
        }
    };
    if let Some(announce) = removed_announce {
        broadcast_queries(state, announce);
    }
}
