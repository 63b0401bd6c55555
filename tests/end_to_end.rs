//! End-to-end scenarios exercising the node, writers, and mirrors over the
//! in-process bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use junction::bus::{BusSubscription, ChannelBus, MessageBus};
use junction::config::Config;
use junction::core::{
    InconsistencyRange, ItineraryExtend, ItineraryVersion, Message, ParticipantDescription,
    ParticipantId, Profile, Query, QueryId, Responsiveness, Route, Trajectory, topics,
};
use junction::database::Mirror;
use junction::node::ScheduleNode;
use junction::node::rpc::{RequestChangesResult, RpcConnector, RpcRequest, RpcResponse};
use junction::writer::{Participant, Writer};

struct Fixture {
    bus: Arc<ChannelBus>,
    node: ScheduleNode,
    writer: Writer,
    _registry_dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let registry_dir = TempDir::new().expect("create registry dir");
        let mut config = Config::default();
        config.registry_path = registry_dir.path().join("registry.json");
        config.mirror_update_period_ms = 5;
        config.heartbeat_period_ms = 100;

        let bus = Arc::new(ChannelBus::new());
        let node = ScheduleNode::new(&config, bus.clone() as Arc<dyn MessageBus>)
            .expect("start schedule node");
        let client = node.rpc_client();
        let connector = Arc::new(move || client.clone()) as Arc<dyn RpcConnector>;
        let writer =
            Writer::new(bus.clone() as Arc<dyn MessageBus>, connector).expect("start writer");

        Self {
            bus,
            node,
            writer,
            _registry_dir: registry_dir,
        }
    }

    fn make_participant(&self, name: &str, responsiveness: Responsiveness) -> Participant {
        self.writer
            .make_participant(ParticipantDescription::new(
                name,
                "fleet",
                responsiveness,
                Profile::default(),
            ))
            .expect("register participant")
    }

    fn register_query(&self, query: Query) -> QueryId {
        let pending = self
            .node
            .rpc_client()
            .call(RpcRequest::RegisterQuery(query))
            .expect("send query registration");
        match pending
            .recv_timeout(Duration::from_secs(2))
            .expect("query registration response")
        {
            RpcResponse::QueryRegistration {
                query_id, error, ..
            } => {
                assert!(error.is_empty(), "query registration failed: {error}");
                query_id
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    fn request_changes(&self, query_id: QueryId, full_update: bool) {
        let pending = self
            .node
            .rpc_client()
            .call(RpcRequest::RequestChanges {
                query_id,
                version: junction::core::DatabaseVersion::new(0),
                full_update,
            })
            .expect("send change request");
        match pending
            .recv_timeout(Duration::from_secs(2))
            .expect("change request response")
        {
            RpcResponse::ChangesRequested { result } => {
                assert_eq!(result, RequestChangesResult::RequestAccepted);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }
}

fn route(map: &str, start_ms: i64, finish_ms: i64) -> Route {
    Route::new(
        map,
        Trajectory::new(start_ms * 1_000_000, finish_ms * 1_000_000),
    )
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Drain mirror updates until one satisfies the predicate.
fn expect_mirror_update(
    sub: &BusSubscription,
    timeout: Duration,
    mut predicate: impl FnMut(&junction::core::MirrorUpdate) -> bool,
) -> junction::core::MirrorUpdate {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(Message::MirrorUpdate(update)) = sub.recv_timeout(Duration::from_millis(50))
            && predicate(&update)
        {
            return *update;
        }
    }
    panic!("no matching mirror update arrived");
}

#[test]
fn solo_edit_reaches_a_mirror() {
    let fixture = Fixture::new();
    let participant = fixture.make_participant("cart_1", Responsiveness::Responsive);

    let query_id = fixture.register_query(Query::all());
    let sub = fixture
        .bus
        .subscribe(&[&topics::query_update(query_id)])
        .unwrap();
    let inconsistency_sub = fixture.bus.subscribe(&[topics::INCONSISTENCY]).unwrap();

    participant.set(vec![route("mapA", 0, 5_000)]).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        fixture.node.latest_version() == junction::core::DatabaseVersion::new(1)
    }));

    let update = expect_mirror_update(&sub, Duration::from_secs(2), |update| {
        update.patch.changes.iter().any(|change| {
            change.participant == participant.id()
                && !change.action.affected_routes().is_empty()
        })
    });
    assert_eq!(
        update.database_version,
        junction::core::DatabaseVersion::new(1)
    );

    // A clean in-order edit produces no inconsistency notice.
    assert!(
        inconsistency_sub
            .recv_timeout(Duration::from_millis(200))
            .is_err()
    );
    assert!(fixture.node.inconsistencies(participant.id()).is_empty());
}

#[test]
fn version_gap_is_reported_and_filled() {
    let fixture = Fixture::new();
    let participant = fixture.make_participant("cart_1", Responsiveness::Responsive);
    let id = participant.id();
    let sub = fixture.bus.subscribe(&[topics::INCONSISTENCY]).unwrap();

    let publish_extend = |version: u64, start_ms: i64| {
        fixture
            .bus
            .publish(
                topics::ITINERARY_EXTEND,
                Message::ItineraryExtend(ItineraryExtend {
                    participant: id,
                    routes: vec![route("mapA", start_ms, start_ms + 1_000)],
                    itinerary_version: ItineraryVersion::new(version),
                }),
            )
            .unwrap();
    };

    // Jump straight to version 3: versions 1 and 2 are missing.
    publish_extend(3, 0);
    let Ok(Message::ScheduleInconsistency(notice)) = sub.recv_timeout(Duration::from_secs(2))
    else {
        panic!("expected an inconsistency notice");
    };
    assert_eq!(notice.participant, id);
    assert_eq!(
        notice.ranges,
        vec![InconsistencyRange {
            lower: ItineraryVersion::new(1),
            upper: ItineraryVersion::new(2),
        }]
    );
    assert_eq!(notice.last_known_version, ItineraryVersion::new(3));

    // Fill the gap; the range shrinks, then disappears.
    publish_extend(1, 10_000);
    let Ok(Message::ScheduleInconsistency(notice)) = sub.recv_timeout(Duration::from_secs(2))
    else {
        panic!("expected a narrowed inconsistency notice");
    };
    assert_eq!(
        notice.ranges,
        vec![InconsistencyRange {
            lower: ItineraryVersion::new(2),
            upper: ItineraryVersion::new(2),
        }]
    );

    publish_extend(2, 20_000);
    assert!(wait_until(Duration::from_secs(2), || {
        fixture.node.inconsistencies(id).is_empty()
    }));
    // No further notices once consistent.
    assert!(sub.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn overlapping_responsive_participants_raise_a_conflict() {
    let fixture = Fixture::new();
    let notice_sub = fixture.bus.subscribe(&[topics::CONFLICT_NOTICE]).unwrap();

    let p1 = fixture.make_participant("cart_1", Responsiveness::Responsive);
    let p2 = fixture.make_participant("cart_2", Responsiveness::Responsive);
    p1.set(vec![route("mapA", 0, 5_000)]).unwrap();
    p2.set(vec![route("mapA", 0, 5_000)]).unwrap();

    let Ok(Message::ConflictNotice(notice)) = notice_sub.recv_timeout(Duration::from_secs(2))
    else {
        panic!("expected a conflict notice");
    };
    let mut participants = notice.participants.clone();
    participants.sort();
    assert_eq!(participants, vec![p1.id(), p2.id()]);
}

#[test]
fn unresponsive_pairs_are_suppressed() {
    let fixture = Fixture::new();
    let notice_sub = fixture.bus.subscribe(&[topics::CONFLICT_NOTICE]).unwrap();

    let p1 = fixture.make_participant("door_1", Responsiveness::Unresponsive);
    let p2 = fixture.make_participant("door_2", Responsiveness::Unresponsive);
    p1.set(vec![route("mapA", 0, 5_000)]).unwrap();
    p2.set(vec![route("mapA", 0, 5_000)]).unwrap();

    assert!(notice_sub.recv_timeout(Duration::from_millis(500)).is_err());
}

#[test]
fn negotiation_resolves_with_the_quickest_finish() {
    let fixture = Fixture::new();
    let notice_sub = fixture.bus.subscribe(&[topics::CONFLICT_NOTICE]).unwrap();
    let conclusion_sub = fixture
        .bus
        .subscribe(&[topics::CONFLICT_CONCLUSION])
        .unwrap();

    let p1 = fixture.make_participant("cart_1", Responsiveness::Responsive);
    let p2 = fixture.make_participant("cart_2", Responsiveness::Responsive);
    p1.set(vec![route("mapA", 0, 5_000)]).unwrap();
    p2.set(vec![route("mapA", 0, 5_000)]).unwrap();

    let Ok(Message::ConflictNotice(notice)) = notice_sub.recv_timeout(Duration::from_secs(2))
    else {
        panic!("expected a conflict notice");
    };
    let conflict = notice.conflict_version;

    // p1 proposes first; p2 accommodates it.
    fixture
        .bus
        .publish(
            topics::CONFLICT_PROPOSAL,
            Message::ConflictProposal(junction::core::ConflictProposal {
                conflict_version: conflict,
                for_participant: p1.id(),
                to_accommodate: vec![],
                itinerary: vec![route("mapA", 0, 5_000)],
                proposal_version: junction::core::ProposalVersion::new(1),
            }),
        )
        .unwrap();
    fixture
        .bus
        .publish(
            topics::CONFLICT_PROPOSAL,
            Message::ConflictProposal(junction::core::ConflictProposal {
                conflict_version: conflict,
                for_participant: p2.id(),
                to_accommodate: vec![junction::core::TableStep::new(
                    p1.id(),
                    junction::core::ProposalVersion::new(1),
                )],
                itinerary: vec![route("mapA", 6_000, 11_000)],
                proposal_version: junction::core::ProposalVersion::new(1),
            }),
        )
        .unwrap();

    let Ok(Message::ConflictConclusion(conclusion)) =
        conclusion_sub.recv_timeout(Duration::from_secs(2))
    else {
        panic!("expected a conclusion");
    };
    assert_eq!(conclusion.conflict_version, conflict);
    assert!(conclusion.resolved);
    assert_eq!(
        conclusion.table,
        vec![
            junction::core::TableStep::new(p1.id(), junction::core::ProposalVersion::new(1)),
            junction::core::TableStep::new(p2.id(), junction::core::ProposalVersion::new(1)),
        ]
    );

    // Conclusions are published exactly once per negotiation.
    assert!(
        conclusion_sub
            .recv_timeout(Duration::from_millis(300))
            .is_err()
    );

    // Acks with promised revisions dispose the negotiation once the edits
    // arrive.
    let (live, awaiting) = fixture.node.negotiation_counts();
    assert_eq!((live, awaiting), (0, 1));
    fixture
        .bus
        .publish(
            topics::CONFLICT_ACK,
            Message::ConflictAck(junction::core::ConflictAck {
                conflict_version: conflict,
                acknowledgments: vec![
                    junction::core::Acknowledgment {
                        participant: p1.id(),
                        updating: false,
                        itinerary_version: ItineraryVersion::new(0),
                    },
                    junction::core::Acknowledgment {
                        participant: p2.id(),
                        updating: true,
                        itinerary_version: ItineraryVersion::new(2),
                    },
                ],
            }),
        )
        .unwrap();
    p2.set(vec![route("mapA", 6_000, 11_000)]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        fixture.node.negotiation_counts() == (0, 0)
    }));
}

#[test]
fn full_update_rebuilds_a_mirror() {
    let fixture = Fixture::new();
    let p1 = fixture.make_participant("cart_1", Responsiveness::Responsive);
    let p2 = fixture.make_participant("cart_2", Responsiveness::Responsive);
    p1.set(vec![route("mapA", 0, 5_000)]).unwrap();
    p1.delay(1_000_000).unwrap();
    p2.set(vec![route("mapB", 0, 2_000), route("mapC", 3_000, 4_000)])
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        fixture.node.latest_version() == junction::core::DatabaseVersion::new(3)
    }));

    let query_id = fixture.register_query(Query::all());
    let sub = fixture
        .bus
        .subscribe(&[&topics::query_update(query_id)])
        .unwrap();
    fixture.request_changes(query_id, true);

    let update = expect_mirror_update(&sub, Duration::from_secs(2), |update| {
        update.is_remedial_update && update.patch.cull.is_some()
    });

    let mut mirror = Mirror::new();
    mirror.apply(&update.patch);
    let state = mirror.effective_state();

    let p1_routes = &state[&p1.id()];
    assert_eq!(p1_routes.len(), 1);
    assert_eq!(p1_routes[0].1.trajectory.start_ns, 1_000_000);

    let p2_routes = &state[&p2.id()];
    assert_eq!(p2_routes.len(), 2);
    assert_eq!(mirror.latest_version(), Some(fixture.node.latest_version()));
}

#[test]
fn reregistration_returns_the_same_identity() {
    let fixture = Fixture::new();
    let p1 = fixture.make_participant("cart_1", Responsiveness::Responsive);
    p1.set(vec![route("mapA", 0, 5_000)]).unwrap();
    let first_id = p1.id();
    assert!(wait_until(Duration::from_secs(2), || {
        fixture.node.latest_version() == junction::core::DatabaseVersion::new(1)
    }));

    let again = fixture.make_participant("cart_1", Responsiveness::Responsive);
    assert_eq!(again.id(), first_id);
    // The writer resumes from the schedule's version counter.
    assert_eq!(
        again.current_version().unwrap(),
        ItineraryVersion::new(1)
    );
}

#[test]
fn unknown_participant_edits_are_ignored() {
    let fixture = Fixture::new();
    let sub = fixture.bus.subscribe(&[topics::INCONSISTENCY]).unwrap();
    fixture
        .bus
        .publish(
            topics::ITINERARY_EXTEND,
            Message::ItineraryExtend(ItineraryExtend {
                participant: ParticipantId::new(404),
                routes: vec![route("mapA", 0, 1_000)],
                itinerary_version: ItineraryVersion::new(1),
            }),
        )
        .unwrap();

    assert!(sub.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(
        fixture.node.latest_version(),
        junction::core::DatabaseVersion::new(0)
    );
}
