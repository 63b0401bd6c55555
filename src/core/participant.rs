//! Participant identity and description.

use serde::{Deserialize, Serialize};

use super::ParticipantId;

/// Whether a participant can take part in negotiations.
///
/// Unresponsive participants still publish itineraries, but a conflict
/// between two unresponsive participants is never raised since neither
/// side could resolve it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Responsiveness {
    Responsive,
    Unresponsive,
}

impl Responsiveness {
    pub fn is_unresponsive(self) -> bool {
        matches!(self, Responsiveness::Unresponsive)
    }
}

/// Geometric footprint of a participant.
///
/// The schedule core never interprets this; it is carried through to the
/// conflict oracle, which decides whether two trajectories with these
/// footprints can collide.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Footprint radius in meters.
    pub footprint: f64,
}

impl Profile {
    pub fn new(footprint: f64) -> Self {
        Self { footprint }
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self { footprint: 0.5 }
    }
}

/// Everything a participant declares about itself at registration.
///
/// The pair `(owner, name)` is the persistent identity key: re-registering
/// with the same pair yields the same [`ParticipantId`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDescription {
    pub name: String,
    pub owner: String,
    pub responsiveness: Responsiveness,
    pub profile: Profile,
}

impl ParticipantDescription {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        responsiveness: Responsiveness,
        profile: Profile,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            responsiveness,
            profile,
        }
    }

    /// The persistent identity key.
    pub fn key(&self) -> (String, String) {
        (self.owner.clone(), self.name.clone())
    }
}

/// A registered participant as seen by mirrors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub description: ParticipantDescription,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_owner_then_name() {
        let desc = ParticipantDescription::new(
            "cart_07",
            "warehouse",
            Responsiveness::Responsive,
            Profile::default(),
        );
        assert_eq!(desc.key(), ("warehouse".to_string(), "cart_07".to_string()));
    }
}
