use tracing::info;

use crate::common::geo::Position;
use crate::neighbors::NeighborRecord;
use crate::telemetry::EventReporter;

/// A vehicle this close to the stop line (and cleared) commits to passing.
const PASSING_WINDOW: f64 = 10.0;

/// Below this speed a neighbor counts as stopped for priority purposes.
const MOVING_THRESHOLD: f64 = 0.5;

/// Extra margin around the conflict zone inside which an occupied
/// intersection blocks entry.
const SAFETY_MARGIN: f64 = 5.0;

/// Where the vehicle is in its crossing. EXITED is absorbing; a vehicle
/// leaves the simulation after reaching it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VehicleState {
    Approaching,
    Waiting,
    Passing,
    Exited,
}

impl VehicleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleState::Approaching => "approaching",
            VehicleState::Waiting => "waiting",
            VehicleState::Passing => "passing",
            VehicleState::Exited => "exited",
        }
    }
}

/// Longitudinal control decision for one tick.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VehicleAction {
    /// No command; the motion model evolves naturally.
    KeepSpeed,
    SlowDown,
    Stop,
    Accelerate,
}

impl VehicleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleAction::KeepSpeed => "KEEP_SPEED",
            VehicleAction::SlowDown => "SLOW_DOWN",
            VehicleAction::Stop => "STOP",
            VehicleAction::Accelerate => "ACCELERATE",
        }
    }
}

/// Everything the state machine looks at for one decision. Recomputed
/// every tick, never persisted.
#[derive(Clone, Copy, Debug)]
pub struct Observation {
    pub speed: f64,
    /// Negative once the stop line is behind the vehicle.
    pub dist_to_stop_line: f64,
    pub has_priority_conflict: bool,
    pub safe_to_proceed: bool,
    pub green_light: bool,
}

/// Deterministic crossing state machine.
///
/// APPROACHING -> WAITING when not cleared; APPROACHING/WAITING -> PASSING
/// when cleared; PASSING -> EXITED once the conflict zone is behind.
pub struct IntersectionFsm {
    state: VehicleState,
    intersection_radius: f64,
    state_transitions: u32,
    total_waiting_time: f64,
    waiting_since: Option<f64>,
}

impl IntersectionFsm {
    pub fn new(intersection_radius: f64) -> Self {
        IntersectionFsm {
            state: VehicleState::Approaching,
            intersection_radius,
            state_transitions: 0,
            total_waiting_time: 0.0,
            waiting_since: None,
        }
    }

    pub fn state(&self) -> VehicleState {
        self.state
    }

    pub fn state_transitions(&self) -> u32 {
        self.state_transitions
    }

    /// Accumulated seconds spent in WAITING, counted on each exit from it.
    pub fn total_waiting_time(&self) -> f64 {
        self.total_waiting_time
    }

    /// Evaluate one row of the transition table and return the action to
    /// apply this tick.
    pub fn decide(
        &mut self,
        obs: &Observation,
        now: f64,
        reporter: &mut EventReporter,
    ) -> VehicleAction {
        let previous = self.state;

        let action = match self.state {
            VehicleState::Approaching => {
                if !obs.green_light || obs.has_priority_conflict {
                    self.state = VehicleState::Waiting;
                    VehicleAction::SlowDown
                } else if obs.safe_to_proceed
                    && obs.dist_to_stop_line > 0.0
                    && obs.dist_to_stop_line < PASSING_WINDOW
                {
                    self.state = VehicleState::Passing;
                    VehicleAction::KeepSpeed
                } else {
                    VehicleAction::KeepSpeed
                }
            }
            VehicleState::Waiting => {
                if obs.green_light && obs.safe_to_proceed && !obs.has_priority_conflict {
                    self.state = VehicleState::Passing;
                    VehicleAction::Accelerate
                } else {
                    VehicleAction::Stop
                }
            }
            VehicleState::Passing => {
                if obs.dist_to_stop_line < -self.intersection_radius {
                    self.state = VehicleState::Exited;
                }
                VehicleAction::KeepSpeed
            }
            VehicleState::Exited => VehicleAction::KeepSpeed,
        };

        if self.state != previous {
            self.state_transitions += 1;
            if previous == VehicleState::Waiting {
                if let Some(since) = self.waiting_since.take() {
                    self.total_waiting_time += now - since;
                }
            }
            if self.state == VehicleState::Waiting {
                self.waiting_since = Some(now);
            }
            info!(
                from = previous.as_str(),
                to = self.state.as_str(),
                "crossing state transition"
            );
            reporter.state_change(now, self.state.as_str());
        }

        action
    }
}

/// True when some neighbor is strictly closer to the intersection, inside
/// the conflict zone's double radius, and actually moving. That neighbor
/// goes first.
pub fn has_priority_conflict(
    self_pos: &Position,
    center: &Position,
    intersection_radius: f64,
    neighbors: &[NeighborRecord],
) -> bool {
    let my_dist = self_pos.distance(center);
    neighbors.iter().any(|n| {
        let neighbor_dist = n.position.distance(center);
        neighbor_dist < my_dist
            && neighbor_dist < intersection_radius * 2.0
            && n.velocity.speed() > MOVING_THRESHOLD
    })
}

/// False when the intersection is occupied while this vehicle is close
/// enough to matter.
pub fn is_safe_to_proceed(
    self_pos: &Position,
    center: &Position,
    intersection_radius: f64,
    neighbors: &[NeighborRecord],
) -> bool {
    let my_dist = self_pos.distance(center);
    for neighbor in neighbors {
        if neighbor.position.distance(center) < intersection_radius
            && my_dist < intersection_radius + SAFETY_MARGIN
        {
            return false;
        }
    }
    true
}
