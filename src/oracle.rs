//! Conflict detection seam.

use crate::core::{Profile, Trajectory};

/// Decides whether two motions on the same map collide in space-time.
///
/// Injected into the conflict detector at construction; the schedule core
/// never interprets trajectories or profiles itself.
pub trait ConflictOracle: Send + Sync {
    fn conflicts(
        &self,
        profile_a: &Profile,
        trajectory_a: &Trajectory,
        profile_b: &Profile,
        trajectory_b: &Trajectory,
    ) -> bool;
}

impl<F> ConflictOracle for F
where
    F: Fn(&Profile, &Trajectory, &Profile, &Trajectory) -> bool + Send + Sync,
{
    fn conflicts(
        &self,
        profile_a: &Profile,
        trajectory_a: &Trajectory,
        profile_b: &Profile,
        trajectory_b: &Trajectory,
    ) -> bool {
        self(profile_a, trajectory_a, profile_b, trajectory_b)
    }
}

/// Conservative oracle: any overlap in time on a shared map is a conflict.
///
/// Suitable for single-corridor maps and for exercising the negotiation
/// machinery; geometry-aware deployments inject their own implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntervalOverlapOracle;

impl ConflictOracle for IntervalOverlapOracle {
    fn conflicts(
        &self,
        _profile_a: &Profile,
        trajectory_a: &Trajectory,
        _profile_b: &Profile,
        trajectory_b: &Trajectory,
    ) -> bool {
        trajectory_a.start_ns < trajectory_b.finish_ns
            && trajectory_b.start_ns < trajectory_a.finish_ns
    }
}
