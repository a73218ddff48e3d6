use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::common::geo::{Position, Velocity};
use crate::config::{MaliciousConfig, SimConfig};
use crate::consensus::engine::{ConsensusEngine, PbftPhase};
use crate::consensus::message::{Beacon, ConsensusMsg, WireMessage};
use crate::fsm::{self, IntersectionFsm, Observation, VehicleAction, VehicleState};
use crate::link::{LinkStabilityEstimator, NodeRole, CLUSTER_HEAD_THRESHOLD};
use crate::neighbors::NeighborTable;
use crate::network::{Broadcast, Envelope};
use crate::telemetry::EventReporter;
use crate::VehicleId;

/// A proposer only engages the consensus machinery once a traffic signal
/// is this close.
const SIGNAL_ENGAGE_DISTANCE: f64 = 20.0;

/// Read-only kinematic state supplied by the mobility collaborator. The
/// core never mutates it.
pub trait Mobility {
    fn position(&self) -> Position;
    fn velocity(&self) -> Velocity;
    fn speed(&self) -> f64;
    /// Distance to the next traffic signal ahead, if any is known.
    fn next_traffic_signal_distance(&self) -> Option<f64>;
}

/// Longitudinal control handle of the motion collaborator. Best-effort: a
/// rejected command simply does not take effect this tick.
pub trait MotionControl {
    fn set_target_speed(&mut self, speed: f64) -> Result<(), MotionError>;
}

#[derive(Debug, Error)]
#[error("motion command rejected: {0}")]
pub struct MotionError(pub String);

/// Fixed at creation, never changes. Malicious vehicles participate
/// normally but are barred from the proposer role; everything else is a
/// hook point for fault injection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeIntegrity {
    Honest,
    Malicious,
}

impl NodeIntegrity {
    pub fn draw(cfg: &MaliciousConfig, rng: &mut impl Rng) -> Self {
        if cfg.enabled && rng.gen::<f64>() < cfg.probability {
            NodeIntegrity::Malicious
        } else {
            NodeIntegrity::Honest
        }
    }
}

/// Inbound message handlers, decoupled from any simulation framework
/// lifecycle. The vehicle actor is the only implementor; tests can drive
/// the handlers directly.
pub trait NetHandlers {
    fn on_beacon(&mut self, beacon: Beacon, now: f64);
    fn on_data(&mut self, msg: ConsensusMsg, now: f64);
}

/// Final statistics reported when a vehicle leaves the simulation.
#[derive(Debug, Clone)]
pub struct VehicleSummary {
    pub id: VehicleId,
    pub final_state: VehicleState,
    pub state_transitions: u32,
    pub total_waiting_time: f64,
    pub final_phase: PbftPhase,
    pub integrity: NodeIntegrity,
}

/// One vehicle: a single-threaded actor owning its crossing state
/// machine, neighbor table, link estimator and consensus engine. All
/// inter-vehicle interaction goes through the broadcast medium; no state
/// is shared with other vehicles.
pub struct Vehicle<M, C, B> {
    id: VehicleId,
    cfg: SimConfig,
    integrity: NodeIntegrity,
    role: NodeRole,
    fsm: IntersectionFsm,
    neighbors: NeighborTable,
    link: LinkStabilityEstimator,
    engine: ConsensusEngine,
    reporter: EventReporter,
    net: B,
    mobility: Option<M>,
    motion: Option<C>,
    epoch: Instant,
}

impl<M, C, B> Vehicle<M, C, B>
where
    M: Mobility,
    C: MotionControl,
    B: Broadcast,
{
    pub fn new(
        id: VehicleId,
        cfg: SimConfig,
        net: B,
        reporter: EventReporter,
        rng: &mut impl Rng,
    ) -> Self {
        let integrity = NodeIntegrity::draw(&cfg.malicious, rng);
        if integrity == NodeIntegrity::Malicious {
            info!(vehicle = id, "spawned with malicious integrity");
        }
        Vehicle {
            id,
            fsm: IntersectionFsm::new(cfg.intersection_radius),
            neighbors: NeighborTable::new(cfg.neighbor_timeout),
            link: LinkStabilityEstimator::new(cfg.comm_radius),
            engine: ConsensusEngine::new(id, cfg.quorum()),
            cfg,
            integrity,
            role: NodeRole::Replica,
            reporter,
            net,
            mobility: None,
            motion: None,
            epoch: Instant::now(),
        }
    }

    /// Wire up the mobility and motion collaborators. Until both are
    /// present, decision steps are silently skipped.
    pub fn attach(&mut self, mobility: M, motion: C) {
        self.mobility = Some(mobility);
        self.motion = Some(motion);
    }

    pub fn id(&self) -> VehicleId {
        self.id
    }

    pub fn state(&self) -> VehicleState {
        self.fsm.state()
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn integrity(&self) -> NodeIntegrity {
        self.integrity
    }

    pub fn phase(&self) -> PbftPhase {
        self.engine.phase()
    }

    /// Event loop: decision tick, link-stability tick, beaconing, the
    /// consensus engine's self-advance and inbound messages, multiplexed
    /// until the vehicle has crossed and its last round is finished.
    pub async fn run(mut self, mut rx: UnboundedReceiver<Envelope>) -> VehicleSummary {
        let mut decision = time::interval(Duration::from_secs_f64(self.cfg.decision_interval));
        let mut let_tick = time::interval(Duration::from_secs_f64(self.cfg.let_interval));
        let mut beacon = time::interval(Duration::from_secs_f64(self.cfg.beacon_interval));
        for tick in [&mut decision, &mut let_tick, &mut beacon] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            let step_at = self.engine.step_due();
            let now = self.now();
            let step_sleep = async move {
                match step_at {
                    Some(at) => time::sleep(Duration::from_secs_f64((at - now).max(0.0))).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = decision.tick() => {
                    let now = self.now();
                    self.decision_step(now);
                }
                _ = let_tick.tick() => {
                    let now = self.now();
                    self.let_step(now);
                }
                _ = beacon.tick() => {
                    let now = self.now();
                    self.send_beacon(now);
                }
                _ = step_sleep => {
                    let now = self.now();
                    self.engine.step(now, &self.net, &mut self.reporter);
                }
                envelope = rx.recv() => {
                    match envelope {
                        Some(envelope) => {
                            let now = self.now();
                            self.dispatch(envelope, now);
                        }
                        // medium gone; nothing more can happen
                        None => break,
                    }
                }
            }

            if self.fsm.state() == VehicleState::Exited && self.engine.is_idle() {
                break;
            }
        }

        info!(
            vehicle = self.id,
            transitions = self.fsm.state_transitions(),
            waiting_time = self.fsm.total_waiting_time(),
            "vehicle leaving simulation"
        );
        VehicleSummary {
            id: self.id,
            final_state: self.fsm.state(),
            state_transitions: self.fsm.state_transitions(),
            total_waiting_time: self.fsm.total_waiting_time(),
            final_phase: self.engine.phase(),
            integrity: self.integrity,
        }
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// One decision tick: observe, decide, actuate, and hand the
    /// consensus engine its trigger if this vehicle should propose.
    fn decision_step(&mut self, now: f64) {
        // collaborators may lag vehicle creation; not an error
        let Some(mobility) = self.mobility.as_ref() else {
            return;
        };
        if self.motion.is_none() {
            return;
        }
        let position = mobility.position();
        let speed = mobility.speed();
        let signal_distance = mobility.next_traffic_signal_distance();

        self.neighbors.prune(now);

        let dist_to_stop_line =
            position.distance(&self.cfg.intersection_center) - self.cfg.stop_line_offset;
        let obs = Observation {
            speed,
            dist_to_stop_line,
            has_priority_conflict: fsm::has_priority_conflict(
                &position,
                &self.cfg.intersection_center,
                self.cfg.intersection_radius,
                self.neighbors.records(),
            ),
            safe_to_proceed: fsm::is_safe_to_proceed(
                &position,
                &self.cfg.intersection_center,
                self.cfg.intersection_radius,
                self.neighbors.records(),
            ),
            // signal phase is not part of the perception interface
            green_light: true,
        };

        let action = self.fsm.decide(&obs, now, &mut self.reporter);
        debug!(
            vehicle = self.id,
            state = self.fsm.state().as_str(),
            action = action.as_str(),
            speed = obs.speed,
            dist = obs.dist_to_stop_line,
            "decision"
        );
        self.apply_action(action, speed);

        // a waiting cluster head with a signal ahead proposes right-of-way
        let engaged = signal_distance.map_or(true, |d| d < SIGNAL_ENGAGE_DISTANCE);
        if engaged
            && self.role.is_cluster_head()
            && self.fsm.state() == VehicleState::Waiting
            && self.engine.is_idle()
        {
            self.engine.initiate(
                &position,
                &self.cfg.intersection_center,
                now,
                &self.net,
                &mut self.reporter,
            );
        }

        if let NodeRole::ClusterHead { corroborated: false } = self.role {
            if self.engine.peer_corroborated() {
                self.role = NodeRole::ClusterHead { corroborated: true };
                info!(vehicle = self.id, "cluster-head role corroborated by a peer vote");
            }
        }
    }

    fn apply_action(&mut self, action: VehicleAction, current_speed: f64) {
        let target = match action {
            // no command; the motion model evolves naturally
            VehicleAction::KeepSpeed => return,
            VehicleAction::SlowDown => current_speed - self.cfg.slow_down_delta,
            VehicleAction::Stop => 0.0,
            VehicleAction::Accelerate => current_speed + self.cfg.accelerate_delta,
        };
        let target = target.clamp(self.cfg.min_speed, self.cfg.max_speed);

        let Some(motion) = self.motion.as_mut() else {
            return;
        };
        if let Err(e) = motion.set_target_speed(target) {
            warn!(vehicle = self.id, error = %e, "failed to set target speed");
        }
    }

    /// Slow periodic pass: rescore links, re-derive the role and give the
    /// engine a chance to hand off the proposer role.
    fn let_step(&mut self, now: f64) {
        let Some(mobility) = self.mobility.as_ref() else {
            return;
        };
        let position = mobility.position();
        let velocity = mobility.velocity();

        let stability = self.link.update(
            &position,
            &velocity,
            self.neighbors.records(),
            now,
            &mut self.reporter,
        );
        self.engine.set_topology_stability(stability);

        if stability > CLUSTER_HEAD_THRESHOLD && self.integrity == NodeIntegrity::Honest {
            if !self.role.is_cluster_head() {
                info!(vehicle = self.id, stability, "assuming cluster-head role");
                self.role = NodeRole::ClusterHead {
                    corroborated: false,
                };
            }
            if self.engine.primary().is_none() {
                self.engine.record_primary(self.id);
            }
        } else {
            if self.role.is_cluster_head() {
                debug!(vehicle = self.id, stability, "dropping cluster-head role");
            }
            self.role = NodeRole::Replica;
        }

        let dist_to_stop_line =
            position.distance(&self.cfg.intersection_center) - self.cfg.stop_line_offset;
        self.engine.check_view_change(
            dist_to_stop_line,
            self.cfg.intersection_radius,
            now,
            &mut self.reporter,
        );
    }

    fn send_beacon(&mut self, _now: f64) {
        let Some(mobility) = self.mobility.as_ref() else {
            return;
        };
        let beacon = Beacon {
            position: mobility.position(),
            velocity: mobility.velocity(),
        };
        self.net.broadcast(WireMessage::Beacon(beacon), 0.0);
    }

    fn dispatch(&mut self, envelope: Envelope, now: f64) {
        match envelope.msg {
            WireMessage::Beacon(beacon) => self.on_beacon(beacon, now),
            WireMessage::Consensus(msg) => self.on_data(msg, now),
        }
    }
}

impl<M, C, B> NetHandlers for Vehicle<M, C, B>
where
    M: Mobility,
    C: MotionControl,
    B: Broadcast,
{
    fn on_beacon(&mut self, beacon: Beacon, now: f64) {
        self.neighbors.on_beacon(beacon.position, beacon.velocity, now);
    }

    fn on_data(&mut self, msg: ConsensusMsg, now: f64) {
        self.engine.on_message(&msg, now, &self.net, &mut self.reporter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::message::MsgKind;
    use crate::telemetry::NullSink;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct StubMobility {
        position: Position,
        velocity: Velocity,
        signal_distance: Option<f64>,
    }

    impl Mobility for StubMobility {
        fn position(&self) -> Position {
            self.position
        }
        fn velocity(&self) -> Velocity {
            self.velocity
        }
        fn speed(&self) -> f64 {
            self.velocity.speed()
        }
        fn next_traffic_signal_distance(&self) -> Option<f64> {
            self.signal_distance
        }
    }

    #[derive(Clone, Default)]
    struct RecordingMotion {
        commands: Rc<RefCell<Vec<f64>>>,
    }

    impl MotionControl for RecordingMotion {
        fn set_target_speed(&mut self, speed: f64) -> Result<(), MotionError> {
            self.commands.borrow_mut().push(speed);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNet {
        sent: Rc<RefCell<Vec<(WireMessage, f64)>>>,
    }

    impl RecordingNet {
        fn consensus_kinds(&self) -> Vec<MsgKind> {
            self.sent
                .borrow()
                .iter()
                .filter_map(|(m, _)| match m {
                    WireMessage::Consensus(c) => Some(c.kind),
                    _ => None,
                })
                .collect()
        }
    }

    impl Broadcast for RecordingNet {
        fn broadcast(&self, msg: WireMessage, delay: f64) {
            self.sent.borrow_mut().push((msg, delay));
        }
    }

    fn vehicle(
        id: VehicleId,
        net: RecordingNet,
    ) -> Vehicle<StubMobility, RecordingMotion, RecordingNet> {
        let cfg = SimConfig::default();
        let reporter = EventReporter::new(id, Box::new(NullSink));
        Vehicle::new(id, cfg, net, reporter, &mut rand::thread_rng())
    }

    fn stub(x: f64, y: f64, vx: f64) -> StubMobility {
        StubMobility {
            position: Position::new(x, y),
            velocity: Velocity::new(vx, 0.0),
            signal_distance: Some(10.0),
        }
    }

    #[test]
    fn test_decision_step_without_collaborators_is_a_noop() {
        let net = RecordingNet::default();
        let mut v = vehicle(1, net.clone());

        v.decision_step(0.0);

        assert_eq!(v.state(), VehicleState::Approaching);
        assert!(net.sent.borrow().is_empty());
    }

    #[test]
    fn test_conflict_slows_the_vehicle_down() {
        let net = RecordingNet::default();
        let mut v = vehicle(1, net.clone());
        let motion = RecordingMotion::default();
        // 30 units out, approaching at 10; stop line is at 15 from center
        v.attach(stub(30.0, 0.0, 10.0), motion.clone());

        // a moving neighbor closer to the center forces a yield
        v.on_beacon(
            Beacon {
                position: Position::new(0.0, 16.0),
                velocity: Velocity::new(0.0, -5.0),
            },
            0.0,
        );
        v.decision_step(0.1);

        assert_eq!(v.state(), VehicleState::Waiting);
        // SLOW_DOWN: 10 - 3 = 7
        assert_eq!(motion.commands.borrow().as_slice(), &[7.0]);

        // still blocked next tick: STOP clamps to zero
        v.decision_step(0.3);
        assert_eq!(motion.commands.borrow().as_slice(), &[7.0, 0.0]);
    }

    #[test]
    fn test_waiting_cluster_head_initiates_a_round() {
        let net = RecordingNet::default();
        let mut v = vehicle(1, net.clone());
        v.attach(stub(30.0, 0.0, 10.0), RecordingMotion::default());

        // a closer moving neighbor puts us in WAITING; in lockstep with
        // us, it also pins the link score at the sentinel (stability 100)
        v.on_beacon(
            Beacon {
                position: Position::new(16.0, 4.0),
                velocity: Velocity::new(10.0, 0.0),
            },
            0.0,
        );
        v.decision_step(0.1);
        assert_eq!(v.state(), VehicleState::Waiting);
        assert!(net.consensus_kinds().is_empty());

        v.let_step(0.2);
        assert!(v.role().is_cluster_head());

        v.decision_step(0.3);
        assert_eq!(net.consensus_kinds(), vec![MsgKind::PrePrepare]);
        assert_eq!(v.phase(), PbftPhase::PrePrepared);

        // replica votes corroborate the self-elected role
        v.on_data(
            ConsensusMsg {
                kind: MsgKind::Prepare,
                sender: 2,
                originator: 1,
                seq: 1,
                view: 0,
                direction: crate::consensus::message::Approach::EastWest,
            },
            0.4,
        );
        v.decision_step(0.5);
        assert_eq!(v.role(), NodeRole::ClusterHead { corroborated: true });
    }

    #[test]
    fn test_malicious_vehicle_never_becomes_cluster_head() {
        let net = RecordingNet::default();
        let cfg = SimConfig::default();
        let reporter = EventReporter::new(1, Box::new(NullSink));
        let mut v: Vehicle<StubMobility, RecordingMotion, RecordingNet> =
            Vehicle::new(1, cfg, net, reporter, &mut rand::thread_rng());
        v.integrity = NodeIntegrity::Malicious;
        v.attach(stub(30.0, 0.0, 10.0), RecordingMotion::default());

        // same lockstep neighbor that earns an honest vehicle the role
        v.on_beacon(
            Beacon {
                position: Position::new(16.0, 4.0),
                velocity: Velocity::new(10.0, 0.0),
            },
            0.0,
        );
        v.let_step(0.2);

        assert_eq!(v.role(), NodeRole::Replica);
    }

    #[test]
    fn test_beacons_refresh_the_neighbor_table() {
        let net = RecordingNet::default();
        let mut v = vehicle(1, net);

        v.on_beacon(
            Beacon {
                position: Position::new(5.0, 5.0),
                velocity: Velocity::default(),
            },
            0.0,
        );
        assert_eq!(v.neighbors.len(), 1);

        // stale entries disappear on the next decision tick's prune
        v.attach(stub(100.0, 0.0, 0.0), RecordingMotion::default());
        v.decision_step(20.0);
        assert!(v.neighbors.is_empty());
    }
}
