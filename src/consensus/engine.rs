use rand::Rng;
use tracing::{debug, info};

use super::message::{Approach, ConsensusMsg, MsgKind, WireMessage};
use super::round::{ConsensusRound, QuorumPolicy};
use crate::common::geo::Position;
use crate::network::Broadcast;
use crate::telemetry::EventReporter;
use crate::VehicleId;

/*
    The agreement is a stripped-down, unauthenticated PBFT: a proposer
    broadcasts PRE-PREPARE with a right-of-way direction, replicas answer
    PREPARE, everyone answers COMMIT once prepared, and a small fixed-size
    quorum of votes commits the round. There are no signatures, no
    acknowledgements and no retransmission; lost votes are tolerated by
    counting whatever does arrive, and a timed self-advance keeps every
    round moving back to idle so a fresh one can start.
*/

/// Phase of the local agreement machine. The ordering matters: a vote is
/// only counted once the phase has reached the matching stage.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum PbftPhase {
    Idle,
    PrePrepared,
    Prepared,
    Committed,
    Reply,
}

impl PbftPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PbftPhase::Idle => "idle",
            PbftPhase::PrePrepared => "pre_prepared",
            PbftPhase::Prepared => "prepared",
            PbftPhase::Committed => "committed",
            PbftPhase::Reply => "reply",
        }
    }
}

// Self-advance delays of the autonomous phase engine [s].
const STEP_PREPARE_DELAY: f64 = 0.2;
const STEP_COMMIT_DELAY: f64 = 0.2;
const STEP_REPLY_DELAY: f64 = 0.1;

// Vote broadcasts are delayed by a random jitter so replicas triggered by
// the same proposal do not all key the medium at once.
const JITTER_MIN: f64 = 0.01;
const JITTER_MAX: f64 = 0.1;

/// Per-vehicle agreement state machine.
pub struct ConsensusEngine {
    id: VehicleId,
    phase: PbftPhase,
    round: Option<ConsensusRound>,
    quorum: QuorumPolicy,
    /// Sequence of the last round this vehicle originated; strictly
    /// increasing per originator.
    next_seq: u64,
    view: u64,
    /// Locally recorded proposer, if any. Adopted from accepted proposals
    /// or self-elected by the cluster-head heuristic.
    primary: Option<VehicleId>,
    phase_entered_at: f64,
    /// Latest stability score, carried into the metrics event.
    topology_stability: f64,
    /// Set once a peer votes on a round this vehicle originated.
    peer_corroborated: bool,
}

impl ConsensusEngine {
    pub fn new(id: VehicleId, quorum: QuorumPolicy) -> Self {
        ConsensusEngine {
            id,
            phase: PbftPhase::Idle,
            round: None,
            quorum,
            next_seq: 0,
            view: 0,
            primary: None,
            phase_entered_at: 0.0,
            topology_stability: 0.0,
            peer_corroborated: false,
        }
    }

    pub fn phase(&self) -> PbftPhase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == PbftPhase::Idle
    }

    pub fn round(&self) -> Option<&ConsensusRound> {
        self.round.as_ref()
    }

    pub fn primary(&self) -> Option<VehicleId> {
        self.primary
    }

    pub fn is_primary(&self) -> bool {
        self.primary == Some(self.id)
    }

    /// Self-elect as proposer. Only takes effect while no primary is
    /// recorded.
    pub fn record_primary(&mut self, id: VehicleId) {
        if self.primary.is_none() {
            info!(vehicle = self.id, primary = id, "recording primary");
            self.primary = Some(id);
        }
    }

    pub fn set_topology_stability(&mut self, score: f64) {
        self.topology_stability = score;
    }

    pub fn peer_corroborated(&self) -> bool {
        self.peer_corroborated
    }

    /// Start a round with self as originator and broadcast the proposal.
    /// No-op while another round is in flight.
    pub fn initiate(
        &mut self,
        position: &Position,
        center: &Position,
        now: f64,
        net: &dyn Broadcast,
        reporter: &mut EventReporter,
    ) {
        if self.phase != PbftPhase::Idle {
            return;
        }

        self.next_seq += 1;
        let direction = Approach::from_offset(position, center);
        info!(
            vehicle = self.id,
            seq = self.next_seq,
            direction = direction.as_str(),
            "initiating right-of-way round"
        );

        self.round = Some(ConsensusRound::new(
            self.next_seq,
            self.id,
            direction,
            self.view,
            now,
            self.id,
        ));
        self.peer_corroborated = false;
        self.set_phase(PbftPhase::PrePrepared, now);

        reporter.state_change(now, "leader");
        self.send(MsgKind::PrePrepare, 0.0, now, net, reporter);
        reporter.consensus_progress(now, "pre_prepare", 1, self.quorum.required());
    }

    /// Handle one consensus message from the medium. Stale, duplicate or
    /// mismatched messages are ignored without error.
    pub fn on_message(
        &mut self,
        msg: &ConsensusMsg,
        now: f64,
        net: &dyn Broadcast,
        reporter: &mut EventReporter,
    ) {
        if msg.sender == self.id {
            return;
        }
        debug!(
            vehicle = self.id,
            kind = msg.kind.as_str(),
            sender = msg.sender,
            originator = msg.originator,
            seq = msg.seq,
            "consensus message"
        );

        match msg.kind {
            MsgKind::PrePrepare if msg.originator != self.id => {
                self.on_pre_prepare(msg, now, net, reporter)
            }
            // an echo of our own proposal carries no information
            MsgKind::PrePrepare => {}
            MsgKind::Prepare => self.on_prepare(msg, now, net, reporter),
            MsgKind::Commit => self.on_commit(msg, now, reporter),
        }
    }

    fn on_pre_prepare(
        &mut self,
        msg: &ConsensusMsg,
        now: f64,
        net: &dyn Broadcast,
        reporter: &mut EventReporter,
    ) {
        // accept when idle, or when the proposal supersedes the current
        // round (newer sequence or different originator)
        let accept = match &self.round {
            None => true,
            Some(round) => {
                self.phase == PbftPhase::Idle
                    || msg.seq > round.seq
                    || msg.originator != round.originator
            }
        };
        if !accept {
            debug!(vehicle = self.id, seq = msg.seq, "stale pre-prepare ignored");
            return;
        }

        info!(
            vehicle = self.id,
            originator = msg.originator,
            seq = msg.seq,
            "pre-prepare accepted, sending prepare"
        );
        self.round = Some(ConsensusRound::new(
            msg.seq,
            msg.originator,
            msg.direction,
            msg.view,
            now,
            self.id,
        ));
        self.view = msg.view;
        self.primary = Some(msg.originator);
        self.peer_corroborated = false;
        self.set_phase(PbftPhase::PrePrepared, now);

        reporter.state_change(now, "preparing");
        self.send(MsgKind::Prepare, self.jitter(), now, net, reporter);
        reporter.consensus_progress(now, "prepare", 1, self.quorum.required());
    }

    fn on_prepare(
        &mut self,
        msg: &ConsensusMsg,
        now: f64,
        net: &dyn Broadcast,
        reporter: &mut EventReporter,
    ) {
        let quorum_reached = {
            let Some(round) = self.round.as_mut() else {
                return;
            };
            if !round.matches(msg.seq, msg.originator) || self.phase < PbftPhase::PrePrepared {
                return;
            }
            if !round.add_prepare(msg.sender) {
                debug!(vehicle = self.id, sender = msg.sender, "duplicate prepare vote");
                return;
            }
            if round.originator == self.id {
                self.peer_corroborated = true;
            }
            let votes = round.prepare_count();
            debug!(vehicle = self.id, votes, "prepare vote counted");
            reporter.consensus_progress(now, "prepare", votes, self.quorum.required());

            self.phase == PbftPhase::PrePrepared && self.quorum.met(votes)
        };

        if quorum_reached {
            info!(vehicle = self.id, "prepare quorum reached, broadcasting commit");
            self.advance_to_prepared(now, net, reporter);
        }
    }

    fn on_commit(&mut self, msg: &ConsensusMsg, now: f64, reporter: &mut EventReporter) {
        let quorum_reached = {
            let Some(round) = self.round.as_mut() else {
                return;
            };
            if !round.matches(msg.seq, msg.originator) || self.phase < PbftPhase::Prepared {
                return;
            }
            if !round.add_commit(msg.sender) {
                debug!(vehicle = self.id, sender = msg.sender, "duplicate commit vote");
                return;
            }
            if round.originator == self.id {
                self.peer_corroborated = true;
            }
            let votes = round.commit_count();
            debug!(vehicle = self.id, votes, "commit vote counted");
            reporter.consensus_progress(now, "commit", votes, self.quorum.required());

            self.phase == PbftPhase::Prepared && self.quorum.met(votes)
        };

        if quorum_reached {
            self.mark_committed(now, reporter);
        }
    }

    /// Absolute sim time at which the autonomous phase engine wants to
    /// run, if a round is in flight.
    pub fn step_due(&self) -> Option<f64> {
        let delay = match self.phase {
            PbftPhase::Idle | PbftPhase::Reply => return None,
            PbftPhase::PrePrepared => STEP_PREPARE_DELAY,
            PbftPhase::Prepared => STEP_COMMIT_DELAY,
            PbftPhase::Committed => STEP_REPLY_DELAY,
        };
        Some(self.phase_entered_at + delay)
    }

    /// Timed self-advance, distinct from message arrival. Keeps a round
    /// progressing even when votes are lost, and eventually returns the
    /// machine to idle so the next round can start.
    pub fn step(&mut self, now: f64, net: &dyn Broadcast, reporter: &mut EventReporter) {
        match self.phase {
            PbftPhase::PrePrepared if now - self.phase_entered_at >= STEP_PREPARE_DELAY => {
                debug!(vehicle = self.id, "timed advance to prepared");
                self.advance_to_prepared(now, net, reporter);
            }
            PbftPhase::Prepared if now - self.phase_entered_at >= STEP_COMMIT_DELAY => {
                debug!(vehicle = self.id, "timed advance to committed");
                self.mark_committed(now, reporter);
            }
            PbftPhase::Committed if now - self.phase_entered_at >= STEP_REPLY_DELAY => {
                // reply leg: report completion and fall back to idle; the
                // round data stays until the next one overwrites it
                self.set_phase(PbftPhase::Reply, now);
                reporter.state_change(now, "idle");
                reporter.consensus_progress(now, "idle", 0, 0);
                self.set_phase(PbftPhase::Idle, now);
            }
            _ => {}
        }
    }

    /// Departure-triggered view change: a primary that has crossed the
    /// intersection gives up the proposer role and resets. A primary that
    /// stalls inside the zone is never deposed — there is no timeout
    /// path, which is a known liveness gap of this protocol.
    pub fn check_view_change(
        &mut self,
        dist_to_stop_line: f64,
        intersection_radius: f64,
        now: f64,
        reporter: &mut EventReporter,
    ) {
        if !self.is_primary() {
            return;
        }
        if dist_to_stop_line < -intersection_radius {
            info!(
                vehicle = self.id,
                view = self.view,
                "primary passed the intersection, relinquishing role"
            );
            self.primary = None;
            self.view += 1;
            self.round = None;
            self.set_phase(PbftPhase::Idle, now);
            reporter.view_change(now);
            reporter.state_change(now, "idle");
        }
    }

    /// Entering the commit stage: record our own commit vote and tell the
    /// others. Runs at most once per round, on vote quorum or on the timed
    /// advance, whichever comes first.
    fn advance_to_prepared(
        &mut self,
        now: f64,
        net: &dyn Broadcast,
        reporter: &mut EventReporter,
    ) {
        if let Some(round) = self.round.as_mut() {
            round.add_commit(self.id);
        }
        self.set_phase(PbftPhase::Prepared, now);
        reporter.state_change(now, "committing");
        self.send(MsgKind::Commit, self.jitter(), now, net, reporter);
    }

    fn mark_committed(&mut self, now: f64, reporter: &mut EventReporter) {
        let (latency, direction) = match &self.round {
            Some(round) => (now - round.started_at, round.direction),
            None => return,
        };
        self.set_phase(PbftPhase::Committed, now);
        info!(
            vehicle = self.id,
            latency,
            direction = direction.as_str(),
            "round committed"
        );
        reporter.state_change(now, "committed");
        reporter.metrics(now, latency, self.topology_stability, 0.0, direction.as_str());
    }

    fn send(
        &self,
        kind: MsgKind,
        delay: f64,
        now: f64,
        net: &dyn Broadcast,
        reporter: &mut EventReporter,
    ) {
        let Some(round) = &self.round else {
            return;
        };
        let msg = ConsensusMsg {
            kind,
            sender: self.id,
            originator: round.originator,
            seq: round.seq,
            view: round.view,
            direction: round.direction,
        };
        net.broadcast(WireMessage::Consensus(msg), delay);
        reporter.message_broadcast(now, kind.as_str());
    }

    fn jitter(&self) -> f64 {
        rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX)
    }

    fn set_phase(&mut self, phase: PbftPhase, now: f64) {
        if self.phase != phase {
            debug!(
                vehicle = self.id,
                from = self.phase.as_str(),
                to = phase.as_str(),
                "phase change"
            );
        }
        self.phase = phase;
        self.phase_entered_at = now;
    }
}
