//! Routes, trajectories, and itineraries.

use serde::{Deserialize, Serialize};

use super::RouteId;

/// A motion through space over a span of time.
///
/// The schedule core treats the interior of a trajectory as opaque: only the
/// time bounds are inspected (for delay accounting and the quickest-finish
/// evaluator). Spatial overlap is decided by the conflict oracle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Start of the motion, nanoseconds on the schedule time base.
    pub start_ns: i64,
    /// End of the motion, nanoseconds on the schedule time base.
    pub finish_ns: i64,
}

impl Trajectory {
    pub fn new(start_ns: i64, finish_ns: i64) -> Self {
        Self {
            start_ns,
            finish_ns,
        }
    }

    /// The same trajectory with its time base shifted by `delay_ns`.
    pub fn shifted(self, delay_ns: i64) -> Self {
        Self {
            start_ns: self.start_ns.saturating_add(delay_ns),
            finish_ns: self.finish_ns.saturating_add(delay_ns),
        }
    }
}

/// A trajectory bound to a named map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub map: String,
    pub trajectory: Trajectory,
}

impl Route {
    pub fn new(map: impl Into<String>, trajectory: Trajectory) -> Self {
        Self {
            map: map.into(),
            trajectory,
        }
    }
}

/// An ordered sequence of routes belonging to one participant.
pub type Itinerary = Vec<Route>;

/// A route that has been admitted to the schedule and assigned an id.
///
/// Trajectories are stored exactly as submitted. A participant's delay is an
/// accumulated offset on its entry; `baseline_delay_ns` records the offset in
/// effect when this route was admitted, so the effective shift of the route
/// is the participant delay minus the baseline. Routes admitted after a
/// delay are therefore not shifted by it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredRoute {
    pub id: RouteId,
    pub route: Route,
    pub baseline_delay_ns: i64,
}

impl StoredRoute {
    pub fn new(id: RouteId, route: Route, baseline_delay_ns: i64) -> Self {
        Self {
            id,
            route,
            baseline_delay_ns,
        }
    }

    /// The route as it effectively stands under the participant's current
    /// cumulative delay.
    pub fn effective(&self, participant_delay_ns: i64) -> Route {
        let shift = participant_delay_ns - self.baseline_delay_ns;
        Route {
            map: self.route.map.clone(),
            trajectory: self.route.trajectory.shifted(shift),
        }
    }
}

/// The latest finish time across an itinerary, if it has any routes.
pub fn itinerary_finish_ns(itinerary: &Itinerary) -> Option<i64> {
    itinerary.iter().map(|r| r.trajectory.finish_ns).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_moves_both_bounds() {
        let t = Trajectory::new(1_000, 5_000);
        let shifted = t.shifted(-400);
        assert_eq!(shifted.start_ns, 600);
        assert_eq!(shifted.finish_ns, 4_600);
    }

    #[test]
    fn effective_route_subtracts_the_baseline() {
        let stored = StoredRoute::new(
            RouteId::new(1),
            Route::new("mapA", Trajectory::new(0, 1_000)),
            500,
        );
        // Admitted while the participant was already delayed by 500ns: a
        // current delay of 800ns shifts this route by only 300ns.
        let effective = stored.effective(800);
        assert_eq!(effective.trajectory.start_ns, 300);
        assert_eq!(effective.trajectory.finish_ns, 1_300);
    }

    #[test]
    fn finish_is_latest_across_routes() {
        let itinerary = vec![
            Route::new("mapA", Trajectory::new(0, 9_000)),
            Route::new("mapB", Trajectory::new(2_000, 4_000)),
        ];
        assert_eq!(itinerary_finish_ns(&itinerary), Some(9_000));
        assert_eq!(itinerary_finish_ns(&Vec::new()), None);
    }
}
