use std::collections::HashMap;

use tracing::debug;

use crate::common::geo::{Position, Velocity};
use crate::neighbors::NeighborRecord;
use crate::telemetry::EventReporter;
use crate::VehicleId;

/// LET value standing in for "effectively infinite" when two vehicles
/// keep a constant separation.
pub const LET_SENTINEL: f64 = 9999.0;

/// A node whose topology stability score exceeds this may act as cluster
/// head (proposer) if its integrity is honest.
pub const CLUSTER_HEAD_THRESHOLD: f64 = 80.0;

/// Heuristic upper bound used to normalize LET into a 0-100 score.
const MAX_EXPECTED_LET: f64 = 20.0;

const EPS: f64 = 1e-9;

/// Role derived from the stability score each LET cycle; never persisted.
///
/// Cluster-head election is a purely local heuristic, so the role starts
/// uncorroborated and is only confirmed once a peer votes on a round this
/// node originated.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeRole {
    Replica,
    ClusterHead { corroborated: bool },
}

impl NodeRole {
    pub fn is_cluster_head(&self) -> bool {
        matches!(self, NodeRole::ClusterHead { .. })
    }
}

/// Predicted time until two moving vehicles leave each other's
/// communication range, from current relative position and velocity.
///
/// Solves |d + t*v|^2 = R^2 for the smallest non-negative t. Pairs moving
/// in lockstep never separate (sentinel); pairs whose paths never meet the
/// radius boundary in the future score zero, the conservative floor.
pub fn link_expiration_time(
    self_pos: &Position,
    self_vel: &Velocity,
    peer_pos: &Position,
    peer_vel: &Velocity,
    comm_radius: f64,
) -> f64 {
    let dx = peer_pos.x - self_pos.x;
    let dy = peer_pos.y - self_pos.y;
    let dvx = peer_vel.vx - self_vel.vx;
    let dvy = peer_vel.vy - self_vel.vy;

    let a = dvx * dvx + dvy * dvy;
    let b = 2.0 * (dx * dvx + dy * dvy);
    let c = dx * dx + dy * dy - comm_radius * comm_radius;

    if a.abs() < EPS {
        if b.abs() < EPS {
            // parallel, equal speed: constant separation
            return LET_SENTINEL;
        }
        return (-c / b).max(0.0);
    }

    let discriminant = b * b - 4.0 * a * c;
    if discriminant < 0.0 {
        return 0.0;
    }

    let sqrt_d = discriminant.sqrt();
    let lower = (-b - sqrt_d) / (2.0 * a);
    let upper = (-b + sqrt_d) / (2.0 * a);

    // smallest non-negative root; both in the past means the boundary is
    // never crossed again
    if upper < 0.0 {
        0.0
    } else if lower >= 0.0 {
        lower
    } else {
        upper
    }
}

/// Scores every in-range neighbor link and averages the scores into the
/// node's topology stability.
pub struct LinkStabilityEstimator {
    comm_radius: f64,
    scores: HashMap<VehicleId, f64>,
    stability: f64,
}

impl LinkStabilityEstimator {
    pub fn new(comm_radius: f64) -> Self {
        LinkStabilityEstimator {
            comm_radius,
            scores: HashMap::new(),
            stability: 0.0,
        }
    }

    /// Recompute all link scores from scratch and emit the topology
    /// snapshot. Returns the new stability score.
    pub fn update(
        &mut self,
        self_pos: &Position,
        self_vel: &Velocity,
        neighbors: &[NeighborRecord],
        now: f64,
        reporter: &mut EventReporter,
    ) -> f64 {
        self.scores.clear();
        let mut links = Vec::new();

        for neighbor in neighbors {
            if neighbor.position.distance(self_pos) > self.comm_radius {
                continue;
            }
            let let_time = link_expiration_time(
                self_pos,
                self_vel,
                &neighbor.position,
                &neighbor.velocity,
                self.comm_radius,
            );
            let score = (let_time / MAX_EXPECTED_LET * 100.0).min(100.0);
            self.scores.insert(neighbor.id, score);
            links.push((neighbor.id, score / 100.0));
        }

        self.stability = if self.scores.is_empty() {
            0.0
        } else {
            self.scores.values().sum::<f64>() / self.scores.len() as f64
        };
        debug!(
            links = self.scores.len(),
            stability = self.stability,
            "link scores updated"
        );

        reporter.topology_update(now, &links);
        self.stability
    }

    pub fn stability(&self) -> f64 {
        self.stability
    }

    pub fn score(&self, id: VehicleId) -> Option<f64> {
        self.scores.get(&id).copied()
    }
}
