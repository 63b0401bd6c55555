//! Live negotiation rooms and conclusion acknowledgement tracking.
//!
//! A room wraps one negotiation with caches for messages that arrived ahead
//! of the submission creating their table. After any successful mutation the
//! caches are replayed until they stop making progress.

use std::collections::BTreeMap;

use tracing::debug;

use crate::core::{
    ConflictForfeit, ConflictProposal, ConflictRejection, ItineraryVersion, NegotiationVersion,
    ParticipantId,
};

use super::{Negotiation, TableOutcome};

#[derive(Debug)]
pub struct NegotiationRoom {
    pub negotiation: Negotiation,
    cached_proposals: Vec<ConflictProposal>,
    cached_rejections: Vec<ConflictRejection>,
    cached_forfeits: Vec<ConflictForfeit>,
}

impl NegotiationRoom {
    pub fn new(negotiation: Negotiation) -> Self {
        Self {
            negotiation,
            cached_proposals: Vec::new(),
            cached_rejections: Vec::new(),
            cached_forfeits: Vec::new(),
        }
    }

    /// Apply a proposal, caching it when its table is not known yet.
    /// Returns true when the negotiation advanced.
    pub fn receive_proposal(&mut self, msg: ConflictProposal) -> bool {
        match self.negotiation.submit(
            msg.for_participant,
            &msg.to_accommodate,
            msg.itinerary.clone(),
            msg.proposal_version,
        ) {
            TableOutcome::Applied => {
                self.check_cache();
                true
            }
            TableOutcome::Deprecated => false,
            TableOutcome::Unknown => {
                debug!(
                    conflict = %self.negotiation.version(),
                    participant = %msg.for_participant,
                    "caching proposal for unknown table"
                );
                self.cached_proposals.push(msg);
                false
            }
        }
    }

    pub fn receive_rejection(&mut self, msg: ConflictRejection) -> bool {
        match self
            .negotiation
            .reject(&msg.table, msg.rejected_by, msg.alternatives.clone())
        {
            TableOutcome::Applied => {
                self.check_cache();
                true
            }
            TableOutcome::Deprecated => false,
            TableOutcome::Unknown => {
                debug!(
                    conflict = %self.negotiation.version(),
                    rejected_by = %msg.rejected_by,
                    "caching rejection for unknown table"
                );
                self.cached_rejections.push(msg);
                false
            }
        }
    }

    pub fn receive_forfeit(&mut self, msg: ConflictForfeit) -> bool {
        match self.negotiation.forfeit(&msg.table) {
            TableOutcome::Applied => {
                self.check_cache();
                true
            }
            TableOutcome::Deprecated => false,
            TableOutcome::Unknown => {
                debug!(
                    conflict = %self.negotiation.version(),
                    "caching forfeit for unknown table"
                );
                self.cached_forfeits.push(msg);
                false
            }
        }
    }

    /// Replay cached messages until none of them lands.
    pub fn check_cache(&mut self) {
        loop {
            let mut progressed = false;

            for msg in std::mem::take(&mut self.cached_proposals) {
                match self.negotiation.submit(
                    msg.for_participant,
                    &msg.to_accommodate,
                    msg.itinerary.clone(),
                    msg.proposal_version,
                ) {
                    TableOutcome::Applied => progressed = true,
                    TableOutcome::Deprecated => {}
                    TableOutcome::Unknown => self.cached_proposals.push(msg),
                }
            }
            for msg in std::mem::take(&mut self.cached_rejections) {
                match self
                    .negotiation
                    .reject(&msg.table, msg.rejected_by, msg.alternatives.clone())
                {
                    TableOutcome::Applied => progressed = true,
                    TableOutcome::Deprecated => {}
                    TableOutcome::Unknown => self.cached_rejections.push(msg),
                }
            }
            for msg in std::mem::take(&mut self.cached_forfeits) {
                match self.negotiation.forfeit(&msg.table) {
                    TableOutcome::Applied => progressed = true,
                    TableOutcome::Deprecated => {}
                    TableOutcome::Unknown => self.cached_forfeits.push(msg),
                }
            }

            if !progressed {
                return;
            }
        }
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cached_proposals.len() + self.cached_rejections.len() + self.cached_forfeits.len()
    }
}

/// Acknowledgement state for one participant of a concluded negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckStatus {
    /// No acknowledgement received yet.
    Pending,
    /// Acknowledged with `updating = true`; disposal waits for an itinerary
    /// edit at or beyond this version.
    AwaitingEdit(ItineraryVersion),
    /// Fully acknowledged.
    Done,
}

/// All live negotiations plus concluded ones still awaiting acknowledgement.
#[derive(Debug, Default)]
pub struct ActiveConflicts {
    next_version: NegotiationVersion,
    rooms: BTreeMap<NegotiationVersion, NegotiationRoom>,
    awaiting: BTreeMap<NegotiationVersion, BTreeMap<ParticipantId, AckStatus>>,
}

impl ActiveConflicts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a detected conflict pair. Returns the version and member set
    /// of a freshly opened negotiation, or `None` when a live negotiation
    /// already covers both participants.
    pub fn insert_conflict(
        &mut self,
        a: ParticipantId,
        b: ParticipantId,
    ) -> Option<(NegotiationVersion, Vec<ParticipantId>)> {
        if a == b {
            return None;
        }
        let covered = self
            .rooms
            .values()
            .any(|room| room.negotiation.covers(a) && room.negotiation.covers(b));
        if covered {
            return None;
        }

        self.next_version = self.next_version.next();
        let version = self.next_version;
        let negotiation = Negotiation::new(version, [a, b]);
        let participants: Vec<ParticipantId> = negotiation.participants().collect();
        self.rooms.insert(version, NegotiationRoom::new(negotiation));
        Some((version, participants))
    }

    pub fn room_mut(&mut self, version: NegotiationVersion) -> Option<&mut NegotiationRoom> {
        self.rooms.get_mut(&version)
    }

    pub fn live_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn awaiting_count(&self) -> usize {
        self.awaiting.len()
    }

    /// Conclude a live negotiation, moving it to the acknowledgement table.
    /// Returns its participants, or `None` when it was already concluded.
    pub fn conclude(&mut self, version: NegotiationVersion) -> Option<Vec<ParticipantId>> {
        let room = self.rooms.remove(&version)?;
        let participants: Vec<ParticipantId> = room.negotiation.participants().collect();
        self.awaiting.insert(
            version,
            participants
                .iter()
                .map(|&p| (p, AckStatus::Pending))
                .collect(),
        );
        Some(participants)
    }

    /// Drop a negotiation outright in response to a refusal. No
    /// acknowledgements are expected afterwards.
    pub fn refuse(&mut self, version: NegotiationVersion) -> bool {
        self.rooms.remove(&version).is_some()
    }

    /// Record one participant's acknowledgement of a conclusion.
    pub fn acknowledge(
        &mut self,
        version: NegotiationVersion,
        participant: ParticipantId,
        updating: Option<ItineraryVersion>,
    ) {
        if let Some(acks) = self.awaiting.get_mut(&version) {
            if let Some(status) = acks.get_mut(&participant) {
                // An obligation already satisfied by an edit stays satisfied.
                if *status == AckStatus::Pending {
                    *status = match updating {
                        Some(expected) => AckStatus::AwaitingEdit(expected),
                        None => AckStatus::Done,
                    };
                }
            }
        }
        self.dispose_if_settled(version);
    }

    /// Called on every itinerary edit: an edit at or beyond the expected
    /// version satisfies the participant's update obligation.
    pub fn check(&mut self, participant: ParticipantId, version: ItineraryVersion) {
        let mut settled = Vec::new();
        for (&negotiation_version, acks) in &mut self.awaiting {
            if let Some(status) = acks.get_mut(&participant)
                && let AckStatus::AwaitingEdit(expected) = *status
                && !version.precedes(expected)
            {
                *status = AckStatus::Done;
                settled.push(negotiation_version);
            }
        }
        for negotiation_version in settled {
            self.dispose_if_settled(negotiation_version);
        }
    }

    pub fn ack_status(
        &self,
        version: NegotiationVersion,
        participant: ParticipantId,
    ) -> Option<AckStatus> {
        self.awaiting
            .get(&version)
            .and_then(|acks| acks.get(&participant))
            .copied()
    }

    fn dispose_if_settled(&mut self, version: NegotiationVersion) {
        let settled = self
            .awaiting
            .get(&version)
            .is_some_and(|acks| acks.values().all(|status| *status == AckStatus::Done));
        if settled {
            self.awaiting.remove(&version);
            debug!(conflict = %version, "negotiation fully acknowledged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ProposalVersion, Route, TableStep, Trajectory};

    fn p(id: u64) -> ParticipantId {
        ParticipantId::new(id)
    }

    fn pv(version: u64) -> ProposalVersion {
        ProposalVersion::new(version)
    }

    fn itinerary(finish_ns: i64) -> Vec<Route> {
        vec![Route::new("mapA", Trajectory::new(0, finish_ns))]
    }

    fn proposal(
        version: NegotiationVersion,
        for_participant: ParticipantId,
        to_accommodate: Vec<TableStep>,
        proposal_version: u64,
    ) -> ConflictProposal {
        ConflictProposal {
            conflict_version: version,
            for_participant,
            to_accommodate,
            itinerary: itinerary(5_000),
            proposal_version: pv(proposal_version),
        }
    }

    #[test]
    fn duplicate_pair_does_not_open_a_second_negotiation() {
        let mut conflicts = ActiveConflicts::new();
        let first = conflicts.insert_conflict(p(1), p(2));
        assert!(first.is_some());
        assert!(conflicts.insert_conflict(p(2), p(1)).is_none());
        assert_eq!(conflicts.live_count(), 1);
    }

    #[test]
    fn out_of_order_proposal_is_cached_and_replayed() {
        let mut conflicts = ActiveConflicts::new();
        let (version, _) = conflicts.insert_conflict(p(1), p(2)).unwrap();
        let room = conflicts.room_mut(version).unwrap();

        // p2's accommodation arrives before p1's root proposal.
        let advanced = room.receive_proposal(proposal(
            version,
            p(2),
            vec![TableStep::new(p(1), pv(1))],
            1,
        ));
        assert!(!advanced);
        assert_eq!(room.cached_len(), 1);

        let advanced = room.receive_proposal(proposal(version, p(1), vec![], 1));
        assert!(advanced);
        assert_eq!(room.cached_len(), 0);
        assert!(room.negotiation.ready());
    }

    #[test]
    fn conclude_moves_to_awaiting_and_acks_dispose() {
        let mut conflicts = ActiveConflicts::new();
        let (version, participants) = conflicts.insert_conflict(p(1), p(2)).unwrap();
        assert_eq!(conflicts.conclude(version).unwrap(), participants);
        assert_eq!(conflicts.live_count(), 0);
        assert_eq!(conflicts.awaiting_count(), 1);

        conflicts.acknowledge(version, p(1), None);
        assert_eq!(conflicts.awaiting_count(), 1);
        conflicts.acknowledge(version, p(2), None);
        assert_eq!(conflicts.awaiting_count(), 0);
    }

    #[test]
    fn update_obligation_is_satisfied_by_a_later_edit() {
        let mut conflicts = ActiveConflicts::new();
        let (version, _) = conflicts.insert_conflict(p(1), p(2)).unwrap();
        conflicts.conclude(version).unwrap();

        conflicts.acknowledge(version, p(1), Some(ItineraryVersion::new(5)));
        conflicts.acknowledge(version, p(2), None);
        assert_eq!(
            conflicts.ack_status(version, p(1)),
            Some(AckStatus::AwaitingEdit(ItineraryVersion::new(5)))
        );

        // An edit below the promised version does not settle it.
        conflicts.check(p(1), ItineraryVersion::new(4));
        assert_eq!(conflicts.awaiting_count(), 1);

        conflicts.check(p(1), ItineraryVersion::new(5));
        assert_eq!(conflicts.awaiting_count(), 0);
    }

    #[test]
    fn concluding_twice_is_inert() {
        let mut conflicts = ActiveConflicts::new();
        let (version, _) = conflicts.insert_conflict(p(1), p(2)).unwrap();
        assert!(conflicts.conclude(version).is_some());
        assert!(conflicts.conclude(version).is_none());
    }

    #[test]
    fn refusal_discards_the_room() {
        let mut conflicts = ActiveConflicts::new();
        let (version, _) = conflicts.insert_conflict(p(1), p(2)).unwrap();
        assert!(conflicts.refuse(version));
        assert!(!conflicts.refuse(version));
        assert_eq!(conflicts.awaiting_count(), 0);
    }

    #[test]
    fn a_new_conflict_can_open_while_acks_are_pending() {
        let mut conflicts = ActiveConflicts::new();
        let (version, _) = conflicts.insert_conflict(p(1), p(2)).unwrap();
        conflicts.conclude(version).unwrap();
        // The same pair conflicting again is a fresh negotiation.
        assert!(conflicts.insert_conflict(p(1), p(2)).is_some());
    }
}
