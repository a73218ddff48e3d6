use serde::{Deserialize, Serialize};

use crate::common::geo::{Position, Velocity};
use crate::VehicleId;

/// Voting message kinds of the three-round agreement.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum MsgKind {
    PrePrepare,
    Prepare,
    Commit,
}

impl MsgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgKind::PrePrepare => "PRE_PREPARE",
            MsgKind::Prepare => "PREPARE",
            MsgKind::Commit => "COMMIT",
        }
    }
}

/// Proposed right-of-way direction: which pair of approaches may cross.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Approach {
    NorthSouth,
    EastWest,
}

impl Approach {
    /// The dominant axis of the offset from the intersection center
    /// decides which approach a vehicle is on.
    pub fn from_offset(position: &Position, center: &Position) -> Self {
        let dx = (position.x - center.x).abs();
        let dy = (position.y - center.y).abs();
        if dx >= dy {
            Approach::EastWest
        } else {
            Approach::NorthSouth
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Approach::NorthSouth => "NS",
            Approach::EastWest => "EW",
        }
    }
}

/// Periodic safety beacon. Carries no sender identity; receivers track the
/// sender by position proximity.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Beacon {
    pub position: Position,
    pub velocity: Velocity,
}

/// One vote or proposal in an agreement round.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ConsensusMsg {
    pub kind: MsgKind,
    pub sender: VehicleId,
    pub originator: VehicleId,
    pub seq: u64,
    pub view: u64,
    pub direction: Approach,
}

/// Everything that crosses the simulated medium.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum WireMessage {
    Beacon(Beacon),
    Consensus(ConsensusMsg),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approach_from_dominant_axis() {
        let center = Position::new(0.0, 0.0);
        assert_eq!(
            Approach::from_offset(&Position::new(30.0, 5.0), &center),
            Approach::EastWest
        );
        assert_eq!(
            Approach::from_offset(&Position::new(-3.0, -40.0), &center),
            Approach::NorthSouth
        );
    }
}
