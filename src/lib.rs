#![forbid(unsafe_code)]

//! Traffic schedule coordinator for robot fleets sharing physical space.
//!
//! Participants publish versioned itineraries; the schedule node stores
//! them, fans filtered patches out to mirror subscribers, detects
//! spatio-temporal conflicts, and mediates the negotiation that resolves
//! them.

pub mod bus;
pub mod config;
pub mod core;
pub mod database;
pub mod error;
pub mod negotiation;
pub mod node;
pub mod oracle;
pub mod telemetry;
pub mod writer;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers touch at the crate root.
pub use crate::bus::{ChannelBus, MessageBus};
pub use crate::config::Config;
pub use crate::core::{
    DatabaseVersion, Itinerary, ItineraryVersion, NegotiationVersion, ParticipantDescription,
    ParticipantId, Patch, Profile, ProposalVersion, Query, QueryId, Responsiveness, Route, RouteId,
    Trajectory,
};
pub use crate::database::{Mirror, ScheduleDatabase};
pub use crate::negotiation::{Evaluator, Negotiation, QuickestFinishEvaluator};
pub use crate::node::ScheduleNode;
pub use crate::oracle::{ConflictOracle, IntervalOverlapOracle};
pub use crate::writer::{Participant, Writer};
