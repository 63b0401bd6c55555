//! Multi-party negotiation tables.
//!
//! A negotiation over participants `P` is a forest of tables. Each table
//! belongs to one participant and is addressed by the sequence of
//! `(participant, proposal_version)` pairs it accommodates; the roots are
//! the tables where each participant proposes first. Submitting at a table
//! spawns child tables for the remaining participants, so a root-to-leaf
//! path where every table holds a submission is a fully accommodated plan.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::{
    Itinerary, NegotiationVersion, ParticipantId, ProposalVersion, TableStep, itinerary_finish_ns,
};

pub mod room;

pub use room::{AckStatus, ActiveConflicts, NegotiationRoom};

/// How a table mutation landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableOutcome {
    /// The mutation advanced the negotiation.
    Applied,
    /// The mutation referred to a superseded or already-settled proposal
    /// and was discarded.
    Deprecated,
    /// The referenced table does not exist yet; the message arrived ahead
    /// of the submission that creates it and should be cached.
    Unknown,
}

impl TableOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, TableOutcome::Applied)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TableStatus {
    Open,
    Rejected,
    Forfeited,
}

#[derive(Clone, Debug)]
struct Table {
    /// Latest proposal version seen at this table.
    version: Option<ProposalVersion>,
    itinerary: Option<Itinerary>,
    status: TableStatus,
    /// Alternatives offered by the last rejecter, kept for the proposer's
    /// next attempt.
    alternatives: Vec<Itinerary>,
    rejected_by: Option<ParticipantId>,
    children: BTreeMap<ParticipantId, Table>,
}

impl Table {
    fn new() -> Self {
        Self {
            version: None,
            itinerary: None,
            status: TableStatus::Open,
            alternatives: Vec::new(),
            rejected_by: None,
            children: BTreeMap::new(),
        }
    }

    fn is_submitted(&self) -> bool {
        self.status == TableStatus::Open && self.itinerary.is_some()
    }
}

/// A fully submitted root-to-leaf path, as handed to evaluators.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadyBranch {
    pub sequence: Vec<TableStep>,
    /// Submitted itineraries, aligned with `sequence`.
    pub itineraries: Vec<Itinerary>,
}

impl ReadyBranch {
    /// Latest trajectory end across every submission in the branch.
    pub fn finish_ns(&self) -> Option<i64> {
        self.itineraries
            .iter()
            .filter_map(|itinerary| itinerary_finish_ns(itinerary))
            .max()
    }
}

#[derive(Clone, Debug)]
pub struct Negotiation {
    version: NegotiationVersion,
    participants: BTreeSet<ParticipantId>,
    tables: BTreeMap<ParticipantId, Table>,
}

enum Locate<'a> {
    Found(&'a mut BTreeMap<ParticipantId, Table>),
    Deprecated,
    Unknown,
}

impl Negotiation {
    pub fn new(
        version: NegotiationVersion,
        participants: impl IntoIterator<Item = ParticipantId>,
    ) -> Self {
        let participants: BTreeSet<ParticipantId> = participants.into_iter().collect();
        let tables = participants.iter().map(|&p| (p, Table::new())).collect();
        Self {
            version,
            participants,
            tables,
        }
    }

    pub fn version(&self) -> NegotiationVersion {
        self.version
    }

    pub fn participants(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.participants.iter().copied()
    }

    pub fn covers(&self, participant: ParticipantId) -> bool {
        self.participants.contains(&participant)
    }

    /// Submit an itinerary for `for_participant` at the table accommodating
    /// `to_accommodate`.
    pub fn submit(
        &mut self,
        for_participant: ParticipantId,
        to_accommodate: &[TableStep],
        itinerary: Itinerary,
        proposal_version: ProposalVersion,
    ) -> TableOutcome {
        if !self.participants.contains(&for_participant) {
            return TableOutcome::Deprecated;
        }
        let remaining: Vec<ParticipantId> = self
            .participants
            .iter()
            .copied()
            .filter(|p| {
                *p != for_participant && !to_accommodate.iter().any(|step| step.participant == *p)
            })
            .collect();

        let children = match self.locate_children(to_accommodate) {
            Locate::Found(children) => children,
            Locate::Deprecated => return TableOutcome::Deprecated,
            Locate::Unknown => return TableOutcome::Unknown,
        };
        let Some(table) = children.get_mut(&for_participant) else {
            return TableOutcome::Unknown;
        };
        if let Some(version) = table.version
            && !version.precedes(proposal_version)
        {
            return TableOutcome::Deprecated;
        }
        if table.status == TableStatus::Forfeited {
            return TableOutcome::Deprecated;
        }

        table.version = Some(proposal_version);
        table.itinerary = Some(itinerary);
        table.status = TableStatus::Open;
        table.alternatives.clear();
        table.rejected_by = None;
        table.children = remaining.into_iter().map(|p| (p, Table::new())).collect();
        TableOutcome::Applied
    }

    /// Reject the submission identified by `table` (proposer last), offering
    /// alternative itineraries the rejecter could accommodate.
    pub fn reject(
        &mut self,
        table: &[TableStep],
        rejected_by: ParticipantId,
        alternatives: Vec<Itinerary>,
    ) -> TableOutcome {
        let Some((last, prefix)) = table.split_last() else {
            return TableOutcome::Deprecated;
        };
        let children = match self.locate_children(prefix) {
            Locate::Found(children) => children,
            Locate::Deprecated => return TableOutcome::Deprecated,
            Locate::Unknown => return TableOutcome::Unknown,
        };
        let Some(target) = children.get_mut(&last.participant) else {
            return TableOutcome::Unknown;
        };
        let Some(version) = target.version else {
            // A rejection targets a submission; none has been seen yet.
            return TableOutcome::Unknown;
        };
        if last.version.precedes(version) {
            return TableOutcome::Deprecated;
        }
        if version.precedes(last.version) {
            return TableOutcome::Unknown;
        }
        if target.status != TableStatus::Open || target.itinerary.is_none() {
            return TableOutcome::Deprecated;
        }

        target.status = TableStatus::Rejected;
        target.itinerary = None;
        target.children.clear();
        target.rejected_by = Some(rejected_by);
        target.alternatives = alternatives;
        TableOutcome::Applied
    }

    /// Give up the branch identified by `table` (proposer last). Valid even
    /// before the proposer has submitted anything.
    pub fn forfeit(&mut self, table: &[TableStep]) -> TableOutcome {
        let Some((last, prefix)) = table.split_last() else {
            return TableOutcome::Deprecated;
        };
        let children = match self.locate_children(prefix) {
            Locate::Found(children) => children,
            Locate::Deprecated => return TableOutcome::Deprecated,
            Locate::Unknown => return TableOutcome::Unknown,
        };
        let Some(target) = children.get_mut(&last.participant) else {
            return TableOutcome::Unknown;
        };
        if let Some(version) = target.version
            && last.version.precedes(version)
        {
            return TableOutcome::Deprecated;
        }
        if target.status == TableStatus::Forfeited {
            return TableOutcome::Deprecated;
        }

        target.version = Some(last.version);
        target.status = TableStatus::Forfeited;
        target.itinerary = None;
        target.children.clear();
        TableOutcome::Applied
    }

    /// The alternatives offered against the table's last rejected proposal.
    pub fn alternatives(&self, table: &[TableStep]) -> Option<&[Itinerary]> {
        self.table_at(table).map(|t| t.alternatives.as_slice())
    }

    /// Who rejected the table's last proposal, if anyone has.
    pub fn rejected_by(&self, table: &[TableStep]) -> Option<ParticipantId> {
        self.table_at(table).and_then(|t| t.rejected_by)
    }

    fn table_at(&self, table: &[TableStep]) -> Option<&Table> {
        let (last, prefix) = table.split_last()?;
        let mut current = &self.tables;
        for step in prefix {
            current = &current.get(&step.participant)?.children;
        }
        current.get(&last.participant)
    }

    /// True when some root-to-leaf path holds a valid submission at every
    /// step.
    pub fn ready(&self) -> bool {
        let depth_target = self.participants.len();
        self.tables
            .values()
            .any(|table| Self::branch_ready(table, 1, depth_target))
    }

    /// True when every branch has terminated: each path ends in a submitted
    /// leaf or a forfeit. A rejected table awaiting resubmission keeps the
    /// negotiation incomplete.
    pub fn complete(&self) -> bool {
        let depth_target = self.participants.len();
        self.tables
            .values()
            .all(|table| Self::branch_settled(table, 1, depth_target))
    }

    /// Every fully submitted branch, for evaluation.
    pub fn ready_branches(&self) -> Vec<ReadyBranch> {
        let mut branches = Vec::new();
        let mut stack = Vec::new();
        for (&participant, table) in &self.tables {
            Self::collect_branches(
                participant,
                table,
                self.participants.len(),
                &mut stack,
                &mut branches,
            );
        }
        branches
    }

    /// Run the evaluator once the negotiation is ready or complete.
    pub fn evaluate(&self, evaluator: &dyn Evaluator) -> Option<Vec<TableStep>> {
        evaluator.choose(self)
    }

    fn branch_ready(table: &Table, depth: usize, target: usize) -> bool {
        if !table.is_submitted() {
            return false;
        }
        if depth == target {
            return true;
        }
        table
            .children
            .values()
            .any(|child| Self::branch_ready(child, depth + 1, target))
    }

    fn branch_settled(table: &Table, depth: usize, target: usize) -> bool {
        match table.status {
            TableStatus::Forfeited => true,
            TableStatus::Rejected => false,
            TableStatus::Open => {
                if table.itinerary.is_none() {
                    return false;
                }
                if depth == target {
                    return true;
                }
                table
                    .children
                    .values()
                    .all(|child| Self::branch_settled(child, depth + 1, target))
            }
        }
    }

    fn collect_branches(
        participant: ParticipantId,
        table: &Table,
        target: usize,
        stack: &mut Vec<(TableStep, Itinerary)>,
        branches: &mut Vec<ReadyBranch>,
    ) {
        if !table.is_submitted() {
            return;
        }
        let (Some(version), Some(itinerary)) = (table.version, &table.itinerary) else {
            return;
        };
        stack.push((TableStep::new(participant, version), itinerary.clone()));
        if stack.len() == target {
            branches.push(ReadyBranch {
                sequence: stack.iter().map(|(step, _)| *step).collect(),
                itineraries: stack.iter().map(|(_, itinerary)| itinerary.clone()).collect(),
            });
        } else {
            for (&child_participant, child) in &table.children {
                Self::collect_branches(child_participant, child, target, stack, branches);
            }
        }
        stack.pop();
    }

    fn locate_children(&mut self, steps: &[TableStep]) -> Locate<'_> {
        let mut current = &mut self.tables;
        for step in steps {
            let Some(table) = current.get_mut(&step.participant) else {
                return Locate::Unknown;
            };
            let Some(version) = table.version else {
                return Locate::Unknown;
            };
            if step.version.precedes(version) {
                return Locate::Deprecated;
            }
            if version.precedes(step.version) {
                return Locate::Unknown;
            }
            if !table.is_submitted() {
                // The accommodated proposal was rejected or forfeited.
                return Locate::Deprecated;
            }
            current = &mut table.children;
        }
        Locate::Found(current)
    }
}

/// Chooses the winning branch of a ready (or complete) negotiation.
pub trait Evaluator: Send + Sync {
    fn choose(&self, negotiation: &Negotiation) -> Option<Vec<TableStep>>;
}

/// Default evaluator: the branch whose latest trajectory end is earliest
/// wins; ties break on the lexicographically smallest participant-id
/// sequence.
#[derive(Clone, Copy, Debug, Default)]
pub struct QuickestFinishEvaluator;

impl Evaluator for QuickestFinishEvaluator {
    fn choose(&self, negotiation: &Negotiation) -> Option<Vec<TableStep>> {
        negotiation
            .ready_branches()
            .into_iter()
            .min_by_key(|branch| {
                (
                    branch.finish_ns().unwrap_or(i64::MIN),
                    branch
                        .sequence
                        .iter()
                        .map(|step| step.participant)
                        .collect::<Vec<_>>(),
                )
            })
            .map(|branch| branch.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Route, Trajectory};

    fn p(id: u64) -> ParticipantId {
        ParticipantId::new(id)
    }

    fn pv(version: u64) -> ProposalVersion {
        ProposalVersion::new(version)
    }

    fn itinerary(finish_ns: i64) -> Itinerary {
        vec![Route::new("mapA", Trajectory::new(0, finish_ns))]
    }

    fn two_party() -> Negotiation {
        Negotiation::new(NegotiationVersion::new(1), [p(1), p(2)])
    }

    #[test]
    fn first_submissions_land_on_root_tables() {
        let mut n = two_party();
        assert!(n.submit(p(1), &[], itinerary(5_000), pv(1)).is_applied());
        assert!(!n.ready());
        assert!(!n.complete());
    }

    #[test]
    fn accommodating_submission_completes_a_branch() {
        let mut n = two_party();
        n.submit(p(1), &[], itinerary(5_000), pv(1));
        let outcome = n.submit(
            p(2),
            &[TableStep::new(p(1), pv(1))],
            itinerary(7_000),
            pv(1),
        );
        assert!(outcome.is_applied());
        assert!(n.ready());
    }

    #[test]
    fn duplicate_submission_is_deprecated() {
        let mut n = two_party();
        n.submit(p(1), &[], itinerary(5_000), pv(1));
        let outcome = n.submit(p(1), &[], itinerary(5_000), pv(1));
        assert_eq!(outcome, TableOutcome::Deprecated);
    }

    #[test]
    fn proposal_for_unknown_table_is_cached_by_caller() {
        let mut n = two_party();
        // p2 accommodates a p1 submission that has not arrived yet.
        let outcome = n.submit(
            p(2),
            &[TableStep::new(p(1), pv(1))],
            itinerary(7_000),
            pv(1),
        );
        assert_eq!(outcome, TableOutcome::Unknown);
    }

    #[test]
    fn resubmission_supersedes_and_invalidates_descendants() {
        let mut n = two_party();
        n.submit(p(1), &[], itinerary(5_000), pv(1));
        n.submit(
            p(2),
            &[TableStep::new(p(1), pv(1))],
            itinerary(7_000),
            pv(1),
        );
        assert!(n.ready());

        // p1 revises its first proposal; the old accommodation is stale.
        assert!(n.submit(p(1), &[], itinerary(4_000), pv(2)).is_applied());
        assert!(!n.ready());

        let stale = n.submit(
            p(2),
            &[TableStep::new(p(1), pv(1))],
            itinerary(7_000),
            pv(2),
        );
        assert_eq!(stale, TableOutcome::Deprecated);
    }

    #[test]
    fn rejection_reopens_the_table_for_a_newer_version() {
        let mut n = two_party();
        n.submit(p(1), &[], itinerary(5_000), pv(1));
        let outcome = n.reject(
            &[TableStep::new(p(1), pv(1))],
            p(2),
            vec![itinerary(6_000)],
        );
        assert!(outcome.is_applied());
        assert!(!n.ready());
        assert!(!n.complete());
        assert_eq!(
            n.alternatives(&[TableStep::new(p(1), pv(1))]).unwrap().len(),
            1
        );
        assert_eq!(n.rejected_by(&[TableStep::new(p(1), pv(1))]), Some(p(2)));

        // The same proposal version can no longer be submitted.
        let stale = n.submit(p(1), &[], itinerary(5_000), pv(1));
        assert_eq!(stale, TableOutcome::Deprecated);
        assert!(n.submit(p(1), &[], itinerary(6_000), pv(2)).is_applied());
    }

    #[test]
    fn forfeiting_every_root_completes_without_ready() {
        let mut n = two_party();
        assert!(n.forfeit(&[TableStep::new(p(1), pv(1))]).is_applied());
        assert!(n.forfeit(&[TableStep::new(p(2), pv(1))]).is_applied());
        assert!(n.complete());
        assert!(!n.ready());
        assert!(n.ready_branches().is_empty());
    }

    #[test]
    fn duplicate_forfeit_is_deprecated() {
        let mut n = two_party();
        n.forfeit(&[TableStep::new(p(1), pv(1))]);
        assert_eq!(
            n.forfeit(&[TableStep::new(p(1), pv(1))]),
            TableOutcome::Deprecated
        );
    }

    #[test]
    fn quickest_finish_prefers_the_earlier_branch() {
        let mut n = two_party();
        // Branch rooted at p1 finishes at 7000; branch rooted at p2 at 9000.
        n.submit(p(1), &[], itinerary(5_000), pv(1));
        n.submit(
            p(2),
            &[TableStep::new(p(1), pv(1))],
            itinerary(7_000),
            pv(1),
        );
        n.submit(p(2), &[], itinerary(9_000), pv(2));
        n.submit(
            p(1),
            &[TableStep::new(p(2), pv(2))],
            itinerary(6_000),
            pv(2),
        );

        let chosen = n.evaluate(&QuickestFinishEvaluator).unwrap();
        assert_eq!(
            chosen,
            vec![TableStep::new(p(1), pv(1)), TableStep::new(p(2), pv(1))]
        );
    }

    #[test]
    fn quickest_finish_ties_break_on_participant_order() {
        let mut n = two_party();
        n.submit(p(1), &[], itinerary(5_000), pv(1));
        n.submit(
            p(2),
            &[TableStep::new(p(1), pv(1))],
            itinerary(7_000),
            pv(1),
        );
        n.submit(p(2), &[], itinerary(5_000), pv(2));
        n.submit(
            p(1),
            &[TableStep::new(p(2), pv(2))],
            itinerary(7_000),
            pv(2),
        );

        let chosen = n.evaluate(&QuickestFinishEvaluator).unwrap();
        assert_eq!(chosen[0].participant, p(1));
    }

    #[test]
    fn three_party_negotiation_requires_full_depth() {
        let mut n = Negotiation::new(NegotiationVersion::new(2), [p(1), p(2), p(3)]);
        n.submit(p(1), &[], itinerary(5_000), pv(1));
        n.submit(
            p(2),
            &[TableStep::new(p(1), pv(1))],
            itinerary(6_000),
            pv(1),
        );
        assert!(!n.ready());
        n.submit(
            p(3),
            &[TableStep::new(p(1), pv(1)), TableStep::new(p(2), pv(1))],
            itinerary(7_000),
            pv(1),
        );
        assert!(n.ready());
        let branch = &n.ready_branches()[0];
        assert_eq!(branch.sequence.len(), 3);
        assert_eq!(branch.finish_ns(), Some(7_000));
    }
}
