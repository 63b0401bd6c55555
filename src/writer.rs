//! Client-side writer facade.
//!
//! A [`Writer`] owns the transport plumbing shared by all of a process's
//! participants: the RPC client (reopened on fail-over), and a dispatcher
//! thread that routes inconsistency notices to the right participant by a
//! weak lookup table, upgrading or dropping each entry on dispatch.
//!
//! Each [`Participant`] stamps its edits with a locally incremented
//! itinerary version and keeps an outbound log; when the schedule node
//! reports missed versions the covering edits are retransmitted verbatim,
//! never re-versioned.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{BusError, BusSubscription, MessageBus};
use crate::core::{
    Itinerary, ItineraryClear, ItineraryDelay, ItineraryErase, ItineraryExtend, ItinerarySet,
    ItineraryVersion, Message, ParticipantDescription, ParticipantId, Route, RouteId,
    ScheduleInconsistency, topics,
};
use crate::node::rpc::{RpcClient, RpcConnector, RpcError, RpcRequest, RpcResponse};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Retained outbound edits per participant; older entries cannot be
/// retransmitted and force the node to keep its inconsistency ranges.
const OUTBOUND_LOG_CAPACITY: usize = 4_096;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("unregistration failed: {0}")]
    Unregistration(String),
    #[error("unexpected RPC response")]
    UnexpectedResponse,
    #[error("writer state lock poisoned")]
    LockPoisoned,
}

#[derive(Clone, Debug)]
enum OutboundEdit {
    Set(Itinerary),
    Extend(Itinerary),
    Delay(i64),
    Erase(Vec<RouteId>),
    Clear,
}

struct ParticipantState {
    id: ParticipantId,
    version: ItineraryVersion,
    last_route_id: RouteId,
    /// Local prediction of the scheduled itinerary, for erase targeting.
    itinerary: Vec<(RouteId, Route)>,
    log: BTreeMap<u64, OutboundEdit>,
}

impl ParticipantState {
    fn record(&mut self, edit: OutboundEdit) -> ItineraryVersion {
        self.version = self.version.next();
        self.log.insert(self.version.get(), edit);
        while self.log.len() > OUTBOUND_LOG_CAPACITY {
            self.log.pop_first();
        }
        self.version
    }

    fn message_for(&self, version: ItineraryVersion, edit: &OutboundEdit) -> Message {
        match edit {
            OutboundEdit::Set(itinerary) => Message::ItinerarySet(ItinerarySet {
                participant: self.id,
                itinerary: itinerary.clone(),
                itinerary_version: version,
            }),
            OutboundEdit::Extend(routes) => Message::ItineraryExtend(ItineraryExtend {
                participant: self.id,
                routes: routes.clone(),
                itinerary_version: version,
            }),
            OutboundEdit::Delay(delay_ns) => Message::ItineraryDelay(ItineraryDelay {
                participant: self.id,
                delay_ns: *delay_ns,
                itinerary_version: version,
            }),
            OutboundEdit::Erase(routes) => Message::ItineraryErase(ItineraryErase {
                participant: self.id,
                routes: routes.clone(),
                itinerary_version: version,
            }),
            OutboundEdit::Clear => Message::ItineraryClear(ItineraryClear {
                participant: self.id,
                itinerary_version: version,
            }),
        }
    }
}

type RectifierMap = HashMap<ParticipantId, Weak<Mutex<ParticipantState>>>;

pub struct Writer {
    bus: Arc<dyn MessageBus>,
    client: Arc<Mutex<RpcClient>>,
    rectifiers: Arc<Mutex<RectifierMap>>,
    shutdown: Arc<AtomicBool>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Writer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        connector: Arc<dyn RpcConnector>,
    ) -> Result<Self, WriterError> {
        let client = Arc::new(Mutex::new(connector.connect()));
        let rectifiers: Arc<Mutex<RectifierMap>> = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let subscription = bus.subscribe(&[topics::INCONSISTENCY, topics::FAIL_OVER])?;
        let dispatcher = {
            let bus = Arc::clone(&bus);
            let connector = Arc::clone(&connector);
            let client = Arc::clone(&client);
            let rectifiers = Arc::clone(&rectifiers);
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                run_dispatcher(&bus, &connector, &client, &rectifiers, &shutdown, &subscription);
            })
        };

        Ok(Self {
            bus,
            client,
            rectifiers,
            shutdown,
            dispatcher: Some(dispatcher),
        })
    }

    /// Register (or re-retrieve) a participant and return its edit handle.
    ///
    /// Blocks until the node responds, polling the shutdown flag every
    /// 100 ms.
    pub fn make_participant(
        &self,
        description: ParticipantDescription,
    ) -> Result<Participant, WriterError> {
        let client = self
            .client
            .lock()
            .map_err(|_| WriterError::LockPoisoned)?
            .clone();
        let pending = client.call(RpcRequest::RegisterParticipant(description.clone()))?;
        let response = pending.wait(&self.shutdown, SHUTDOWN_POLL)?;

        let RpcResponse::Registration {
            participant_id,
            last_itinerary_version,
            last_route_id,
            error,
        } = response
        else {
            return Err(WriterError::UnexpectedResponse);
        };
        if !error.is_empty() {
            return Err(WriterError::Registration(error));
        }

        let state = Arc::new(Mutex::new(ParticipantState {
            id: participant_id,
            version: last_itinerary_version,
            last_route_id,
            itinerary: Vec::new(),
            log: BTreeMap::new(),
        }));
        self.rectifiers
            .lock()
            .map_err(|_| WriterError::LockPoisoned)?
            .insert(participant_id, Arc::downgrade(&state));
        debug!(participant = %participant_id, "participant handle created");

        Ok(Participant {
            id: participant_id,
            description,
            bus: Arc::clone(&self.bus),
            client: Arc::clone(&self.client),
            shutdown: Arc::clone(&self.shutdown),
            state,
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

fn run_dispatcher(
    bus: &Arc<dyn MessageBus>,
    connector: &Arc<dyn RpcConnector>,
    client: &Arc<Mutex<RpcClient>>,
    rectifiers: &Arc<Mutex<RectifierMap>>,
    shutdown: &Arc<AtomicBool>,
    subscription: &BusSubscription,
) {
    loop {
        match subscription.recv_timeout(SHUTDOWN_POLL) {
            Ok(Message::ScheduleInconsistency(notice)) => {
                dispatch_inconsistency(bus, rectifiers, notice);
            }
            Ok(Message::FailOverEvent) => {
                info!("fail-over event: reopening schedule RPC clients");
                if let Ok(mut guard) = client.lock() {
                    *guard = connector.connect();
                }
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn dispatch_inconsistency(
    bus: &Arc<dyn MessageBus>,
    rectifiers: &Arc<Mutex<RectifierMap>>,
    notice: ScheduleInconsistency,
) {
    if notice.ranges.is_empty() {
        // Empty ranges should not be published; ignore them regardless.
        return;
    }
    let state = {
        let Ok(mut map) = rectifiers.lock() else {
            return;
        };
        match map.get(&notice.participant) {
            Some(weak) => match weak.upgrade() {
                Some(state) => state,
                None => {
                    // The participant handle is gone; drop the entry.
                    map.remove(&notice.participant);
                    return;
                }
            },
            None => return,
        }
    };
    let Ok(state) = state.lock() else {
        return;
    };
    retransmit(bus, &state, &notice);
}

/// Republish logged edits covering the reported ranges, then any tail the
/// node has not seen. Retransmissions reuse the original versions.
fn retransmit(
    bus: &Arc<dyn MessageBus>,
    state: &ParticipantState,
    notice: &ScheduleInconsistency,
) {
    let mut resent = 0usize;
    let mut send = |version: ItineraryVersion| {
        if let Some(edit) = state.log.get(&version.get()) {
            let (topic, message) = edit_topic(state, version, edit);
            if bus.publish(topic, message).is_ok() {
                resent += 1;
            }
        }
    };

    for range in &notice.ranges {
        let mut version = range.lower;
        loop {
            send(version);
            if version == range.upper {
                break;
            }
            version = version.next();
        }
    }

    if notice.last_known_version.precedes(state.version) {
        let mut version = notice.last_known_version.next();
        loop {
            send(version);
            if version == state.version {
                break;
            }
            version = version.next();
        }
    }

    if resent > 0 {
        warn!(
            participant = %state.id,
            resent,
            last_known = %notice.last_known_version,
            "retransmitted itinerary edits"
        );
    }
}

fn edit_topic(
    state: &ParticipantState,
    version: ItineraryVersion,
    edit: &OutboundEdit,
) -> (&'static str, Message) {
    let topic = match edit {
        OutboundEdit::Set(_) => topics::ITINERARY_SET,
        OutboundEdit::Extend(_) => topics::ITINERARY_EXTEND,
        OutboundEdit::Delay(_) => topics::ITINERARY_DELAY,
        OutboundEdit::Erase(_) => topics::ITINERARY_ERASE,
        OutboundEdit::Clear => topics::ITINERARY_CLEAR,
    };
    (topic, state.message_for(version, edit))
}

/// Edit handle for one registered participant.
pub struct Participant {
    id: ParticipantId,
    description: ParticipantDescription,
    bus: Arc<dyn MessageBus>,
    client: Arc<Mutex<RpcClient>>,
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<ParticipantState>>,
}

impl Participant {
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn description(&self) -> &ParticipantDescription {
        &self.description
    }

    pub fn current_version(&self) -> Result<ItineraryVersion, WriterError> {
        Ok(self.state()?.version)
    }

    /// The locally predicted itinerary with the route ids this writer
    /// assigned.
    pub fn itinerary(&self) -> Result<Vec<(RouteId, Route)>, WriterError> {
        Ok(self.state()?.itinerary.clone())
    }

    /// Replace the whole itinerary.
    pub fn set(&self, itinerary: Itinerary) -> Result<ItineraryVersion, WriterError> {
        let mut state = self.state()?;
        let mut next = state.last_route_id;
        let predicted: Vec<(RouteId, Route)> = itinerary
            .iter()
            .map(|route| {
                next = next.next();
                (next, route.clone())
            })
            .collect();
        state.last_route_id = next;
        state.itinerary = predicted;
        let version = state.record(OutboundEdit::Set(itinerary.clone()));
        let message = state.message_for(version, &OutboundEdit::Set(itinerary));
        drop(state);
        self.bus.publish(topics::ITINERARY_SET, message)?;
        Ok(version)
    }

    /// Append routes; returns the ids assigned to them.
    pub fn extend(&self, routes: Itinerary) -> Result<Vec<RouteId>, WriterError> {
        let mut state = self.state()?;
        let mut next = state.last_route_id;
        let mut ids = Vec::with_capacity(routes.len());
        for route in &routes {
            next = next.next();
            ids.push(next);
            state.itinerary.push((next, route.clone()));
        }
        state.last_route_id = next;
        let version = state.record(OutboundEdit::Extend(routes.clone()));
        let message = state.message_for(version, &OutboundEdit::Extend(routes));
        drop(state);
        self.bus.publish(topics::ITINERARY_EXTEND, message)?;
        Ok(ids)
    }

    /// Shift the whole itinerary in time.
    pub fn delay(&self, delay_ns: i64) -> Result<ItineraryVersion, WriterError> {
        let mut state = self.state()?;
        let version = state.record(OutboundEdit::Delay(delay_ns));
        let message = state.message_for(version, &OutboundEdit::Delay(delay_ns));
        drop(state);
        self.bus.publish(topics::ITINERARY_DELAY, message)?;
        Ok(version)
    }

    /// Remove the listed routes.
    pub fn erase(&self, routes: Vec<RouteId>) -> Result<ItineraryVersion, WriterError> {
        let mut state = self.state()?;
        state.itinerary.retain(|(id, _)| !routes.contains(id));
        let version = state.record(OutboundEdit::Erase(routes.clone()));
        let message = state.message_for(version, &OutboundEdit::Erase(routes));
        drop(state);
        self.bus.publish(topics::ITINERARY_ERASE, message)?;
        Ok(version)
    }

    /// Remove every route.
    pub fn clear(&self) -> Result<ItineraryVersion, WriterError> {
        let mut state = self.state()?;
        state.itinerary.clear();
        let version = state.record(OutboundEdit::Clear);
        let message = state.message_for(version, &OutboundEdit::Clear);
        drop(state);
        self.bus.publish(topics::ITINERARY_CLEAR, message)?;
        Ok(version)
    }

    /// Unregister from the schedule. Blocks like registration does.
    pub fn unregister(self) -> Result<(), WriterError> {
        let client = self
            .client
            .lock()
            .map_err(|_| WriterError::LockPoisoned)?
            .clone();
        let pending = client.call(RpcRequest::UnregisterParticipant(self.id))?;
        let response = pending.wait(&self.shutdown, SHUTDOWN_POLL)?;
        match response {
            RpcResponse::Unregistration { confirmation, error } => {
                if confirmation {
                    Ok(())
                } else {
                    Err(WriterError::Unregistration(error))
                }
            }
            _ => Err(WriterError::UnexpectedResponse),
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, ParticipantState>, WriterError> {
        self.state.lock().map_err(|_| WriterError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelBus;
    use crate::core::{InconsistencyRange, Profile, Responsiveness, Trajectory};
    use crate::node::rpc::RpcEnvelope;

    /// A fake schedule node answering registration RPCs.
    fn fake_node() -> (Arc<dyn RpcConnector>, std::thread::JoinHandle<()>) {
        let (tx, rx) = crossbeam::channel::unbounded::<RpcEnvelope>();
        let handle = std::thread::spawn(move || {
            let mut next_id = 1u64;
            while let Ok(envelope) = rx.recv() {
                match envelope.request {
                    RpcRequest::RegisterParticipant(_) => {
                        let _ = envelope.respond.send(RpcResponse::Registration {
                            participant_id: ParticipantId::new(next_id),
                            last_itinerary_version: ItineraryVersion::new(0),
                            last_route_id: RouteId::new(0),
                            error: String::new(),
                        });
                        next_id += 1;
                    }
                    RpcRequest::UnregisterParticipant(_) => {
                        let _ = envelope.respond.send(RpcResponse::Unregistration {
                            confirmation: true,
                            error: String::new(),
                        });
                    }
                    _ => {}
                }
            }
        });
        let client = RpcClient::new(tx);
        let connector = Arc::new(move || client.clone()) as Arc<dyn RpcConnector>;
        (connector, handle)
    }

    fn description(name: &str) -> ParticipantDescription {
        ParticipantDescription::new(name, "fleet", Responsiveness::Responsive, Profile::default())
    }

    fn route(start: i64, finish: i64) -> Route {
        Route::new("mapA", Trajectory::new(start, finish))
    }

    #[test]
    fn edits_are_stamped_with_increasing_versions() {
        let bus = Arc::new(ChannelBus::new());
        let (connector, _node) = fake_node();
        let writer = Writer::new(bus.clone(), connector).unwrap();
        let sub = bus.subscribe(&[topics::ITINERARY_SET, topics::ITINERARY_DELAY]).unwrap();

        let participant = writer.make_participant(description("cart")).unwrap();
        participant.set(vec![route(0, 1_000)]).unwrap();
        participant.delay(500).unwrap();

        let Message::ItinerarySet(set) = sub.recv_timeout(Duration::from_secs(1)).unwrap() else {
            panic!("expected set message");
        };
        assert_eq!(set.itinerary_version, ItineraryVersion::new(1));
        let Message::ItineraryDelay(delay) = sub.recv_timeout(Duration::from_secs(1)).unwrap()
        else {
            panic!("expected delay message");
        };
        assert_eq!(delay.itinerary_version, ItineraryVersion::new(2));
        assert_eq!(delay.delay_ns, 500);
    }

    #[test]
    fn extend_predicts_route_ids_from_registration() {
        let bus = Arc::new(ChannelBus::new());
        let (connector, _node) = fake_node();
        let writer = Writer::new(bus.clone(), connector).unwrap();
        let participant = writer.make_participant(description("cart")).unwrap();

        let ids = participant.extend(vec![route(0, 1_000), route(2_000, 3_000)]).unwrap();
        assert_eq!(ids, vec![RouteId::new(1), RouteId::new(2)]);
        assert_eq!(participant.itinerary().unwrap().len(), 2);

        participant.erase(vec![RouteId::new(1)]).unwrap();
        assert_eq!(participant.itinerary().unwrap().len(), 1);
    }

    #[test]
    fn inconsistency_notice_triggers_retransmission() {
        let bus = Arc::new(ChannelBus::new());
        let (connector, _node) = fake_node();
        let writer = Writer::new(bus.clone(), connector).unwrap();
        let participant = writer.make_participant(description("cart")).unwrap();

        participant.set(vec![route(0, 1_000)]).unwrap();
        participant.extend(vec![route(2_000, 3_000)]).unwrap();
        participant.delay(100).unwrap();

        // Subscribe after the original sends so only retransmissions arrive.
        let sub = bus
            .subscribe(&[topics::ITINERARY_EXTEND, topics::ITINERARY_DELAY])
            .unwrap();
        bus.publish(
            topics::INCONSISTENCY,
            Message::ScheduleInconsistency(ScheduleInconsistency {
                participant: participant.id(),
                ranges: vec![InconsistencyRange {
                    lower: ItineraryVersion::new(2),
                    upper: ItineraryVersion::new(2),
                }],
                last_known_version: ItineraryVersion::new(2),
            }),
        )
        .unwrap();

        let Message::ItineraryExtend(extend) = sub.recv_timeout(Duration::from_secs(1)).unwrap()
        else {
            panic!("expected retransmitted extend");
        };
        assert_eq!(extend.itinerary_version, ItineraryVersion::new(2));

        // last_known=2 trails the writer's version 3, so the tail follows.
        let Message::ItineraryDelay(delay) = sub.recv_timeout(Duration::from_secs(1)).unwrap()
        else {
            panic!("expected retransmitted delay");
        };
        assert_eq!(delay.itinerary_version, ItineraryVersion::new(3));
    }

    #[test]
    fn dropped_participants_stop_receiving_rectifications() {
        let bus = Arc::new(ChannelBus::new());
        let (connector, _node) = fake_node();
        let writer = Writer::new(bus.clone(), connector).unwrap();
        let participant = writer.make_participant(description("cart")).unwrap();
        let id = participant.id();
        participant.set(vec![route(0, 1_000)]).unwrap();
        drop(participant);

        let sub = bus.subscribe(&[topics::ITINERARY_SET]).unwrap();
        bus.publish(
            topics::INCONSISTENCY,
            Message::ScheduleInconsistency(ScheduleInconsistency {
                participant: id,
                ranges: vec![InconsistencyRange {
                    lower: ItineraryVersion::new(1),
                    upper: ItineraryVersion::new(1),
                }],
                last_known_version: ItineraryVersion::new(1),
            }),
        )
        .unwrap();

        assert!(sub.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn unregister_round_trips() {
        let bus = Arc::new(ChannelBus::new());
        let (connector, _node) = fake_node();
        let writer = Writer::new(bus, connector).unwrap();
        let participant = writer.make_participant(description("cart")).unwrap();
        participant.unregister().unwrap();
    }
}
