//! Data model shared by the schedule node, mirrors, and writers.

pub mod itinerary;
pub mod messages;
pub mod participant;
pub mod patch;
pub mod query;
pub mod version;

pub use itinerary::{Itinerary, Route, StoredRoute, Trajectory, itinerary_finish_ns};
pub use messages::{
    Acknowledgment, ConflictAck, ConflictConclusion, ConflictForfeit, ConflictNotice,
    ConflictProposal, ConflictRefusal, ConflictRejection, InconsistencyRange, ItineraryClear,
    ItineraryDelay, ItineraryErase, ItineraryExtend, ItinerarySet, Message, MirrorUpdate,
    ParticipantsInfo, ScheduleInconsistency, ScheduleQueries, TableStep, topics,
};
pub use participant::{ParticipantDescription, ParticipantInfo, Profile, Responsiveness};
pub use patch::{Change, ChangeAction, Patch};
pub use query::Query;
pub use version::{
    DatabaseVersion, ItineraryVersion, NegotiationVersion, ParticipantId, ProposalVersion, QueryId,
    RouteId, modular_lt,
};
