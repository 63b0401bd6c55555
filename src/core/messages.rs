//! Wire messages and topic names.
//!
//! Field layouts follow the schedule protocol exactly; peers built against
//! other implementations of the same protocol depend on them.

use serde::{Deserialize, Serialize};

use super::{
    DatabaseVersion, Itinerary, ItineraryVersion, NegotiationVersion, ParticipantId,
    ParticipantInfo, Patch, ProposalVersion, Query, QueryId, RouteId,
};

/// Topic names used on the message bus.
pub mod topics {
    use crate::core::QueryId;

    pub const ITINERARY_SET: &str = "schedule/itinerary_set";
    pub const ITINERARY_EXTEND: &str = "schedule/itinerary_extend";
    pub const ITINERARY_DELAY: &str = "schedule/itinerary_delay";
    pub const ITINERARY_ERASE: &str = "schedule/itinerary_erase";
    pub const ITINERARY_CLEAR: &str = "schedule/itinerary_clear";
    pub const INCONSISTENCY: &str = "schedule/inconsistency";
    pub const PARTICIPANTS_INFO: &str = "schedule/participants";
    pub const QUERIES_INFO: &str = "schedule/queries";
    pub const CONFLICT_NOTICE: &str = "negotiation/notice";
    pub const CONFLICT_PROPOSAL: &str = "negotiation/proposal";
    pub const CONFLICT_REJECTION: &str = "negotiation/rejection";
    pub const CONFLICT_FORFEIT: &str = "negotiation/forfeit";
    pub const CONFLICT_REFUSAL: &str = "negotiation/refusal";
    pub const CONFLICT_CONCLUSION: &str = "negotiation/conclusion";
    pub const CONFLICT_ACK: &str = "negotiation/ack";
    pub const FAIL_OVER: &str = "schedule/fail_over";
    pub const HEARTBEAT: &str = "schedule/heartbeat";

    /// Per-query mirror update topic.
    pub fn query_update(query: QueryId) -> String {
        format!("schedule/query_update/{}", query.get())
    }
}

/// One step in a negotiation table sequence: a participant and the proposal
/// version it submitted at that depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableStep {
    pub participant: ParticipantId,
    pub version: ProposalVersion,
}

impl TableStep {
    pub fn new(participant: ParticipantId, version: ProposalVersion) -> Self {
        Self {
            participant,
            version,
        }
    }
}

/// A contiguous range of itinerary versions the database never received.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistencyRange {
    pub lower: ItineraryVersion,
    pub upper: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItinerarySet {
    pub participant: ParticipantId,
    pub itinerary: Itinerary,
    pub itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItineraryExtend {
    pub participant: ParticipantId,
    pub routes: Itinerary,
    pub itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItineraryDelay {
    pub participant: ParticipantId,
    pub delay_ns: i64,
    pub itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItineraryErase {
    pub participant: ParticipantId,
    pub routes: Vec<RouteId>,
    pub itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItineraryClear {
    pub participant: ParticipantId,
    pub itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInconsistency {
    pub participant: ParticipantId,
    pub ranges: Vec<InconsistencyRange>,
    /// Latest itinerary version the database has observed for the participant.
    pub last_known_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MirrorUpdate {
    pub node_version: u64,
    pub database_version: DatabaseVersion,
    pub patch: Patch,
    pub is_remedial_update: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantsInfo {
    pub participants: Vec<ParticipantInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleQueries {
    pub node_version: u64,
    pub ids: Vec<QueryId>,
    pub queries: Vec<Query>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictNotice {
    pub conflict_version: NegotiationVersion,
    pub participants: Vec<ParticipantId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictProposal {
    pub conflict_version: NegotiationVersion,
    pub for_participant: ParticipantId,
    /// The already-proposing participants this submission accommodates.
    pub to_accommodate: Vec<TableStep>,
    pub itinerary: Itinerary,
    pub proposal_version: ProposalVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictRejection {
    pub conflict_version: NegotiationVersion,
    /// Full sequence of the rejected table, proposer last.
    pub table: Vec<TableStep>,
    pub rejected_by: ParticipantId,
    /// Itineraries the rejecter could have accommodated instead.
    pub alternatives: Vec<Itinerary>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictForfeit {
    pub conflict_version: NegotiationVersion,
    pub table: Vec<TableStep>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRefusal {
    pub conflict_version: NegotiationVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictConclusion {
    pub conflict_version: NegotiationVersion,
    pub resolved: bool,
    /// The chosen table sequence when `resolved`; empty otherwise.
    pub table: Vec<TableStep>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub participant: ParticipantId,
    /// True when the participant will revise its itinerary in response.
    pub updating: bool,
    /// The version at which the revision will arrive; meaningful only when
    /// `updating` is set.
    pub itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictAck {
    pub conflict_version: NegotiationVersion,
    pub acknowledgments: Vec<Acknowledgment>,
}

/// Everything that can travel over the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    ItinerarySet(ItinerarySet),
    ItineraryExtend(ItineraryExtend),
    ItineraryDelay(ItineraryDelay),
    ItineraryErase(ItineraryErase),
    ItineraryClear(ItineraryClear),
    ScheduleInconsistency(ScheduleInconsistency),
    MirrorUpdate(Box<MirrorUpdate>),
    ParticipantsInfo(ParticipantsInfo),
    ScheduleQueries(ScheduleQueries),
    ConflictNotice(ConflictNotice),
    ConflictProposal(ConflictProposal),
    ConflictRejection(ConflictRejection),
    ConflictForfeit(ConflictForfeit),
    ConflictRefusal(ConflictRefusal),
    ConflictConclusion(ConflictConclusion),
    ConflictAck(ConflictAck),
    FailOverEvent,
    Heartbeat,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ItinerarySet(_) => "itinerary_set",
            Message::ItineraryExtend(_) => "itinerary_extend",
            Message::ItineraryDelay(_) => "itinerary_delay",
            Message::ItineraryErase(_) => "itinerary_erase",
            Message::ItineraryClear(_) => "itinerary_clear",
            Message::ScheduleInconsistency(_) => "schedule_inconsistency",
            Message::MirrorUpdate(_) => "mirror_update",
            Message::ParticipantsInfo(_) => "participants_info",
            Message::ScheduleQueries(_) => "schedule_queries",
            Message::ConflictNotice(_) => "conflict_notice",
            Message::ConflictProposal(_) => "conflict_proposal",
            Message::ConflictRejection(_) => "conflict_rejection",
            Message::ConflictForfeit(_) => "conflict_forfeit",
            Message::ConflictRefusal(_) => "conflict_refusal",
            Message::ConflictConclusion(_) => "conflict_conclusion",
            Message::ConflictAck(_) => "conflict_ack",
            Message::FailOverEvent => "fail_over_event",
            Message::Heartbeat => "heartbeat",
        }
    }
}
