//! Modular version counters shared across the schedule protocol.
//!
//! Every counter in the protocol is a 64-bit value compared with modular
//! arithmetic: `a` precedes `b` iff `b - a`, interpreted as a signed 64-bit
//! integer, is positive. This keeps orderings meaningful across counter
//! rollover and out-of-order delivery.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Modular less-than over raw 64-bit counters.
pub fn modular_lt(a: u64, b: u64) -> bool {
    (b.wrapping_sub(a) as i64) > 0
}

macro_rules! counter_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            /// The successor, wrapping at the 64-bit boundary.
            pub const fn next(self) -> Self {
                Self(self.0.wrapping_add(1))
            }

            /// Modular strict ordering: true iff `self` comes before `other`.
            pub fn precedes(self, other: Self) -> bool {
                modular_lt(self.0, other.0)
            }

            /// True iff `other` is exactly `self + 1` in the modular space.
            pub fn is_followed_by(self, other: Self) -> bool {
                self.0.wrapping_add(1) == other.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> u64 {
                value.0
            }
        }
    };
}

counter_type! {
    /// Per-participant itinerary edit counter.
    ItineraryVersion
}

counter_type! {
    /// Global database counter, bumped on every applied edit.
    DatabaseVersion
}

counter_type! {
    /// Identifier for one negotiation episode.
    NegotiationVersion
}

counter_type! {
    /// Counter for proposals submitted to a single negotiation table.
    ProposalVersion
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            pub const fn next(self) -> Self {
                Self(self.0.wrapping_add(1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> u64 {
                value.0
            }
        }
    };
}

id_type! {
    /// Identity of a schedule participant (robot, door, lift).
    ParticipantId
}

id_type! {
    /// Identity of a single route within the schedule.
    RouteId
}

id_type! {
    /// Identity of a registered mirror query.
    QueryId
}
