use std::collections::HashSet;

use super::message::Approach;
use crate::VehicleId;

/// One right-of-way agreement attempt.
///
/// At most one round is active per vehicle; accepting a newer round
/// discards the previous vote sets. The local vote is always the first
/// PREPARE vote. Vote insertion is idempotent, so duplicated or reordered
/// deliveries cannot inflate the counts.
#[derive(Clone, Debug)]
pub struct ConsensusRound {
    pub seq: u64,
    pub originator: VehicleId,
    pub direction: Approach,
    pub view: u64,
    pub started_at: f64,
    prepare_votes: HashSet<VehicleId>,
    commit_votes: HashSet<VehicleId>,
}

impl ConsensusRound {
    pub fn new(
        seq: u64,
        originator: VehicleId,
        direction: Approach,
        view: u64,
        started_at: f64,
        self_id: VehicleId,
    ) -> Self {
        let mut prepare_votes = HashSet::new();
        prepare_votes.insert(self_id);
        ConsensusRound {
            seq,
            originator,
            direction,
            view,
            started_at,
            prepare_votes,
            commit_votes: HashSet::new(),
        }
    }

    pub fn matches(&self, seq: u64, originator: VehicleId) -> bool {
        self.seq == seq && self.originator == originator
    }

    /// Returns false when the voter was already counted.
    pub fn add_prepare(&mut self, voter: VehicleId) -> bool {
        self.prepare_votes.insert(voter)
    }

    /// Returns false when the voter was already counted.
    pub fn add_commit(&mut self, voter: VehicleId) -> bool {
        self.commit_votes.insert(voter)
    }

    pub fn prepare_count(&self) -> usize {
        self.prepare_votes.len()
    }

    pub fn commit_count(&self) -> usize {
        self.commit_votes.len()
    }

    pub fn has_prepare_from(&self, voter: VehicleId) -> bool {
        self.prepare_votes.contains(&voter)
    }

    pub fn has_commit_from(&self, voter: VehicleId) -> bool {
        self.commit_votes.contains(&voter)
    }
}

/// Vote threshold as a function of the expected participant count,
/// instead of a constant wired into the protocol.
#[derive(Clone, Copy, Debug)]
pub struct QuorumPolicy {
    required: usize,
}

impl QuorumPolicy {
    pub fn fixed(required: usize) -> Self {
        QuorumPolicy { required }
    }

    /// Byzantine majority for n expected participants, floored at the
    /// 2-vote demonstration scale: f = (n - 1) / 3, required = 2f + 1.
    pub fn for_participants(n: usize) -> Self {
        let f = n.saturating_sub(1) / 3;
        QuorumPolicy {
            required: (2 * f + 1).max(2),
        }
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn met(&self, votes: usize) -> bool {
        votes >= self.required
    }
}
