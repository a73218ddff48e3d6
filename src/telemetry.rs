use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::VehicleId;

/// One structured record handed to the visualization/telemetry sink.
/// Field names follow the front end's JSON vocabulary.
#[derive(Clone, Debug, Serialize)]
pub struct TelemetryEvent {
    pub vehicle: VehicleId,
    pub timestamp: f64,
    #[serde(flatten)]
    pub body: EventBody,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventBody {
    StateChange {
        state: String,
    },
    Message {
        from: VehicleId,
        to: String,
        #[serde(rename = "msgType")]
        msg_type: String,
    },
    ConsensusProgress {
        phase: String,
        current: usize,
        required: usize,
    },
    TopologyUpdate {
        links: Vec<TopologyLink>,
    },
    ViewChange,
    Metrics {
        #[serde(rename = "decisionLatency")]
        decision_latency: f64,
        #[serde(rename = "topologyStabilityScore")]
        topology_stability_score: f64,
        #[serde(rename = "throughputGainPct")]
        throughput_gain_pct: f64,
        #[serde(rename = "proposalDirection")]
        proposal_direction: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct TopologyLink {
    pub from: VehicleId,
    pub to: VehicleId,
    pub strength: f64,
}

/// Transport seam for telemetry. Emission is best-effort: a sink that
/// cannot deliver logs and drops, it never fails the caller.
pub trait EventSink: Send {
    fn emit(&mut self, event: &TelemetryEvent);
}

/// Builds event records for one vehicle and hands them to the sink.
pub struct EventReporter {
    vehicle: VehicleId,
    sink: Box<dyn EventSink>,
}

impl EventReporter {
    pub fn new(vehicle: VehicleId, sink: Box<dyn EventSink>) -> Self {
        EventReporter { vehicle, sink }
    }

    pub fn vehicle(&self) -> VehicleId {
        self.vehicle
    }

    fn push(&mut self, timestamp: f64, body: EventBody) {
        let event = TelemetryEvent {
            vehicle: self.vehicle,
            timestamp,
            body,
        };
        self.sink.emit(&event);
    }

    pub fn state_change(&mut self, now: f64, state: &str) {
        self.push(
            now,
            EventBody::StateChange {
                state: state.to_string(),
            },
        );
    }

    /// A broadcast send, shown by the front end as a particle fanning out
    /// from the sender.
    pub fn message_broadcast(&mut self, now: f64, msg_type: &str) {
        let from = self.vehicle;
        self.push(
            now,
            EventBody::Message {
                from,
                to: "broadcast".to_string(),
                msg_type: msg_type.to_string(),
            },
        );
    }

    pub fn consensus_progress(&mut self, now: f64, phase: &str, current: usize, required: usize) {
        self.push(
            now,
            EventBody::ConsensusProgress {
                phase: phase.to_string(),
                current,
                required,
            },
        );
    }

    /// Snapshot of this vehicle's scored links, strengths in 0-1.
    pub fn topology_update(&mut self, now: f64, links: &[(VehicleId, f64)]) {
        let from = self.vehicle;
        let links = links
            .iter()
            .map(|&(to, strength)| TopologyLink { from, to, strength })
            .collect();
        self.push(now, EventBody::TopologyUpdate { links });
    }

    pub fn view_change(&mut self, now: f64) {
        self.push(now, EventBody::ViewChange);
    }

    pub fn metrics(
        &mut self,
        now: f64,
        decision_latency: f64,
        topology_stability_score: f64,
        throughput_gain_pct: f64,
        proposal_direction: &str,
    ) {
        self.push(
            now,
            EventBody::Metrics {
                decision_latency,
                topology_stability_score,
                throughput_gain_pct,
                proposal_direction: proposal_direction.to_string(),
            },
        );
    }
}

/// Discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: &TelemetryEvent) {}
}

/// Collects events in memory; clone the sink before handing it to a
/// reporter and read the shared buffer afterwards.
#[derive(Clone, Default)]
pub struct VecSink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl VecSink {
    pub fn new() -> Self {
        VecSink::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EventSink for VecSink {
    fn emit(&mut self, event: &TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to bind telemetry socket: {0}")]
    Bind(#[source] std::io::Error),
}

/// Streams events as JSON datagrams to an external visualizer.
pub struct UdpJsonSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpJsonSink {
    pub fn new(target: SocketAddr) -> Result<Self, SinkError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(SinkError::Bind)?;
        socket.set_nonblocking(true).map_err(SinkError::Bind)?;
        Ok(UdpJsonSink { socket, target })
    }
}

impl EventSink for UdpJsonSink {
    fn emit(&mut self, event: &TelemetryEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode telemetry event");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&payload, self.target) {
            warn!(error = %e, "failed to send telemetry event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let sink = VecSink::new();
        let mut reporter = EventReporter::new(7, Box::new(sink.clone()));

        reporter.metrics(12.5, 0.42, 87.0, 0.0, "EW");
        reporter.message_broadcast(12.6, "PRE_PREPARE");

        let events = sink.events();
        let metrics = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(metrics["kind"], "metrics");
        assert_eq!(metrics["vehicle"], 7);
        assert_eq!(metrics["decisionLatency"], 0.42);
        assert_eq!(metrics["topologyStabilityScore"], 87.0);
        assert_eq!(metrics["proposalDirection"], "EW");

        let message = serde_json::to_value(&events[1]).unwrap();
        assert_eq!(message["kind"], "message");
        assert_eq!(message["from"], 7);
        assert_eq!(message["to"], "broadcast");
        assert_eq!(message["msgType"], "PRE_PREPARE");
    }

    #[test]
    fn test_topology_links_carry_self_as_from() {
        let sink = VecSink::new();
        let mut reporter = EventReporter::new(3, Box::new(sink.clone()));

        reporter.topology_update(1.0, &[(8, 0.9), (9, 0.1)]);

        let events = sink.events();
        match &events[0].body {
            EventBody::TopologyUpdate { links } => {
                assert_eq!(links.len(), 2);
                assert!(links.iter().all(|l| l.from == 3));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
