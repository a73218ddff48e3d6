use sha2::{Digest, Sha256};
use tracing::debug;

use crate::common::geo::{Position, Velocity};
use crate::VehicleId;

/// A beacon update landing within this distance of a known record is
/// treated as coming from the same sender. Also the cell size of the
/// pseudo-id quantization.
const MATCH_RADIUS: f64 = 5.0;

/// Last known kinematic state of a nearby vehicle, refreshed by beacons.
#[derive(Clone, Debug)]
pub struct NeighborRecord {
    pub id: VehicleId,
    pub position: Position,
    pub velocity: Velocity,
    pub last_seen: f64,
}

/// Tracks peers observed via periodic beacons and expires stale entries.
///
/// The beacon channel carries no sender identity, so records are matched
/// by proximity to the last known position and keyed by a deterministic
/// pseudo-id. Collisions merge into an existing record; the table is
/// advisory input to priority/safety checks, not a safety-critical index.
pub struct NeighborTable {
    records: Vec<NeighborRecord>,
    timeout: f64,
}

impl NeighborTable {
    pub fn new(timeout: f64) -> Self {
        NeighborTable {
            records: Vec::new(),
            timeout,
        }
    }

    /// Insert or update the neighbor a beacon came from. Always succeeds;
    /// returns the id the sender is tracked under.
    pub fn on_beacon(&mut self, position: Position, velocity: Velocity, now: f64) -> VehicleId {
        for record in &mut self.records {
            if record.position.distance(&position) < MATCH_RADIUS {
                record.position = position;
                record.velocity = velocity;
                record.last_seen = now;
                return record.id;
            }
        }

        let id = pseudo_id(&position);
        debug!(id, x = position.x, y = position.y, "new neighbor");
        self.records.push(NeighborRecord {
            id,
            position,
            velocity,
            last_seen: now,
        });
        id
    }

    /// Drop every record not refreshed within the timeout.
    pub fn prune(&mut self, now: f64) {
        let timeout = self.timeout;
        self.records.retain(|r| now - r.last_seen <= timeout);
    }

    pub fn records(&self) -> &[NeighborRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Deterministic pseudo-identifier for an id-less beacon sender: the
/// sender's 5x5-unit position bucket, hashed and truncated to 32 bits.
pub fn pseudo_id(position: &Position) -> VehicleId {
    let bx = (position.x / MATCH_RADIUS).floor() as i64;
    let by = (position.y / MATCH_RADIUS).floor() as i64;

    let mut hasher = Sha256::new();
    hasher.update(bx.to_be_bytes());
    hasher.update(by.to_be_bytes());
    let digest = hasher.finalize();

    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_near_known_record_updates_it() {
        let mut table = NeighborTable::new(5.0);
        let id = table.on_beacon(Position::new(10.0, 0.0), Velocity::new(1.0, 0.0), 0.0);

        // 3 units away: same sender, moved
        let id2 = table.on_beacon(Position::new(13.0, 0.0), Velocity::new(1.0, 0.0), 1.0);

        assert_eq!(id, id2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.records()[0].position.x, 13.0);
        assert_eq!(table.records()[0].last_seen, 1.0);
    }

    #[test]
    fn test_beacon_far_away_creates_new_record() {
        let mut table = NeighborTable::new(5.0);
        let id = table.on_beacon(Position::new(10.0, 0.0), Velocity::default(), 0.0);
        let id2 = table.on_beacon(Position::new(40.0, 40.0), Velocity::default(), 0.0);

        assert_ne!(id, id2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_prune_removes_only_stale_records() {
        let mut table = NeighborTable::new(5.0);
        table.on_beacon(Position::new(10.0, 0.0), Velocity::default(), 0.0);
        table.on_beacon(Position::new(40.0, 40.0), Velocity::default(), 4.0);

        table.prune(6.0);

        assert_eq!(table.len(), 1);
        assert_eq!(table.records()[0].position.x, 40.0);
    }

    #[test]
    fn test_pseudo_id_is_deterministic_per_bucket() {
        let a = pseudo_id(&Position::new(11.0, 7.0));
        let b = pseudo_id(&Position::new(12.5, 8.5));
        let c = pseudo_id(&Position::new(17.0, 7.0));

        // same 5x5 bucket, same id; next bucket over, different id
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
