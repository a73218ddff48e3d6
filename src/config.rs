use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::geo::Position;
use crate::consensus::round::QuorumPolicy;

/// Read-only simulation parameters, loaded once at startup. Every field
/// has a default so a partial TOML file (or none at all) works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Seconds between decision steps of the crossing state machine.
    #[serde(default = "default_decision_interval")]
    pub decision_interval: f64,
    /// Seconds between link-stability recomputations.
    #[serde(default = "default_let_interval")]
    pub let_interval: f64,
    /// Seconds between position/velocity beacons.
    #[serde(default = "default_beacon_interval")]
    pub beacon_interval: f64,
    #[serde(default)]
    pub intersection_center: Position,
    /// Radius of the conflict zone around the intersection center.
    #[serde(default = "default_intersection_radius")]
    pub intersection_radius: f64,
    /// Radial distance from the center to the stop line. Must exceed the
    /// intersection radius or vehicles would wait inside the conflict zone.
    #[serde(default = "default_stop_line_offset")]
    pub stop_line_offset: f64,
    /// Speed reduction applied by a SLOW_DOWN action [units/s].
    #[serde(default = "default_slow_down_delta")]
    pub slow_down_delta: f64,
    /// Speed increase applied by an ACCELERATE action [units/s].
    #[serde(default = "default_accelerate_delta")]
    pub accelerate_delta: f64,
    #[serde(default)]
    pub min_speed: f64,
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    /// Seconds after which an un-refreshed neighbor record is pruned.
    #[serde(default = "default_neighbor_timeout")]
    pub neighbor_timeout: f64,
    /// Communication radius used for link-expiration scoring.
    #[serde(default = "default_comm_radius")]
    pub comm_radius: f64,
    /// Expected number of consensus participants; the vote quorum is
    /// derived from this rather than hardcoded.
    #[serde(default = "default_expected_participants")]
    pub expected_participants: usize,
    #[serde(default)]
    pub malicious: MaliciousConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Byzantine fault injection knobs. Integrity is drawn once per vehicle
/// at creation and never changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MaliciousConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_malicious_probability")]
    pub probability: f64,
}

/// Simulated broadcast medium parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Base one-hop delivery latency [s].
    #[serde(default = "default_base_latency")]
    pub base_latency: f64,
    /// Random extra latency as a fraction of the base latency (0.0 - 1.0).
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Probability that any individual delivery is dropped (0.0 - 1.0).
    #[serde(default)]
    pub loss_rate: f64,
}

fn default_decision_interval() -> f64 {
    0.2
}
fn default_let_interval() -> f64 {
    1.0
}
fn default_beacon_interval() -> f64 {
    0.5
}
fn default_intersection_radius() -> f64 {
    10.0
}
fn default_stop_line_offset() -> f64 {
    15.0
}
fn default_slow_down_delta() -> f64 {
    3.0
}
fn default_accelerate_delta() -> f64 {
    2.0
}
fn default_max_speed() -> f64 {
    20.0
}
fn default_neighbor_timeout() -> f64 {
    5.0
}
fn default_comm_radius() -> f64 {
    50.0
}
fn default_expected_participants() -> usize {
    3
}
fn default_malicious_probability() -> f64 {
    0.2
}
fn default_base_latency() -> f64 {
    0.02
}
fn default_jitter_fraction() -> f64 {
    0.5
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            decision_interval: default_decision_interval(),
            let_interval: default_let_interval(),
            beacon_interval: default_beacon_interval(),
            intersection_center: Position::default(),
            intersection_radius: default_intersection_radius(),
            stop_line_offset: default_stop_line_offset(),
            slow_down_delta: default_slow_down_delta(),
            accelerate_delta: default_accelerate_delta(),
            min_speed: 0.0,
            max_speed: default_max_speed(),
            neighbor_timeout: default_neighbor_timeout(),
            comm_radius: default_comm_radius(),
            expected_participants: default_expected_participants(),
            malicious: MaliciousConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl Default for MaliciousConfig {
    fn default() -> Self {
        MaliciousConfig {
            enabled: false,
            probability: default_malicious_probability(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            base_latency: default_base_latency(),
            jitter_fraction: default_jitter_fraction(),
            loss_rate: 0.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[source] toml::de::Error),
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Read)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn quorum(&self) -> QuorumPolicy {
        QuorumPolicy::for_participants(self.expected_participants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: SimConfig = toml::from_str(
            r#"
            comm_radius = 80.0

            [malicious]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(cfg.comm_radius, 80.0);
        assert!(cfg.malicious.enabled);
        assert_eq!(cfg.malicious.probability, 0.2);
        assert_eq!(cfg.decision_interval, 0.2);
        assert_eq!(cfg.channel.loss_rate, 0.0);
    }

    #[test]
    fn test_quorum_tracks_participant_count() {
        let mut cfg = SimConfig::default();
        assert_eq!(cfg.quorum().required(), 2);

        cfg.expected_participants = 7;
        assert_eq!(cfg.quorum().required(), 5);
    }
}
