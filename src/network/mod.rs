use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ChannelConfig;
use crate::consensus::message::WireMessage;
use crate::VehicleId;

/*
    The medium is a broadcast and unreliable stand-in for a wireless
    channel: no acknowledgements, no retransmission, no delivery-order
    guarantee. Progress comes from quorum counting over whatever arrives,
    not from making the channel reliable.
*/

/// Send side of the injected channel abstraction. Fire-and-forget: a
/// failed send is logged and dropped, never surfaced to the caller.
pub trait Broadcast {
    /// Queue a message for delivery to every other node. `delay` is an
    /// extra sender-side delay in seconds (e.g. vote jitter).
    fn broadcast(&self, msg: WireMessage, delay: f64);
}

/// One in-flight transmission.
#[derive(Clone, Copy, Debug)]
pub struct Envelope {
    pub from: VehicleId,
    pub delay: f64,
    pub msg: WireMessage,
}

/// A vehicle's handle onto the shared medium.
#[derive(Clone)]
pub struct NodeHandle {
    id: VehicleId,
    tx: UnboundedSender<Envelope>,
}

impl Broadcast for NodeHandle {
    fn broadcast(&self, msg: WireMessage, delay: f64) {
        let envelope = Envelope {
            from: self.id,
            delay,
            msg,
        };
        if self.tx.send(envelope).is_err() {
            warn!(from = self.id, "broadcast channel closed");
        }
    }
}

/// Simulated lossy broadcast medium. Every envelope is fanned out to all
/// registered nodes except the sender, each copy independently delayed
/// and possibly dropped.
pub struct Hub {
    cfg: ChannelConfig,
    ingress_tx: UnboundedSender<Envelope>,
    ingress_rx: UnboundedReceiver<Envelope>,
    nodes: Vec<(VehicleId, UnboundedSender<Envelope>)>,
}

impl Hub {
    pub fn new(cfg: ChannelConfig) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        Hub {
            cfg,
            ingress_tx,
            ingress_rx,
            nodes: Vec::new(),
        }
    }

    /// Register a node before the hub starts. Returns its send handle and
    /// inbound receiver.
    pub fn register(&mut self, id: VehicleId) -> (NodeHandle, UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.push((id, tx));
        let handle = NodeHandle {
            id,
            tx: self.ingress_tx.clone(),
        };
        (handle, rx)
    }

    /// Run the fan-out loop until every node handle is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        let Hub {
            cfg,
            ingress_tx,
            mut ingress_rx,
            nodes,
        } = self;
        // without this the hub would keep its own ingress alive forever
        drop(ingress_tx);

        tokio::spawn(async move {
            while let Some(envelope) = ingress_rx.recv().await {
                for (id, tx) in &nodes {
                    if *id == envelope.from {
                        continue;
                    }
                    if cfg.loss_rate > 0.0 && rand::thread_rng().gen::<f64>() < cfg.loss_rate {
                        debug!(from = envelope.from, to = *id, "delivery dropped");
                        continue;
                    }
                    let jitter =
                        cfg.base_latency * cfg.jitter_fraction * rand::thread_rng().gen::<f64>();
                    let wait = envelope.delay + cfg.base_latency + jitter;

                    if wait <= 0.0 {
                        let _ = tx.send(envelope);
                        continue;
                    }
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                        // receiver may have finished; that is fine
                        let _ = tx.send(envelope);
                    });
                }
            }
            debug!("hub finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::geo::{Position, Velocity};
    use crate::consensus::message::Beacon;
    use tokio::time::timeout;

    fn beacon() -> WireMessage {
        WireMessage::Beacon(Beacon {
            position: Position::new(1.0, 2.0),
            velocity: Velocity::new(3.0, 0.0),
        })
    }

    fn lossless() -> ChannelConfig {
        ChannelConfig {
            base_latency: 0.0,
            jitter_fraction: 0.0,
            loss_rate: 0.0,
        }
    }

    #[tokio::test]
    async fn test_hub_fans_out_to_everyone_but_the_sender() {
        let mut hub = Hub::new(lossless());
        let (a, mut rx_a) = hub.register(1);
        let (_b, mut rx_b) = hub.register(2);
        let (_c, mut rx_c) = hub.register(3);
        hub.spawn();

        a.broadcast(beacon(), 0.0);

        let to_b = timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        let to_c = timeout(Duration::from_secs(1), rx_c.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(to_b.from, 1);
        assert_eq!(to_c.from, 1);

        // the sender does not hear its own broadcast
        assert!(timeout(Duration::from_millis(100), rx_a.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_hub_honors_sender_delay() {
        let mut hub = Hub::new(lossless());
        let (a, _rx_a) = hub.register(1);
        let (_b, mut rx_b) = hub.register(2);
        hub.spawn();

        let start = tokio::time::Instant::now();
        a.broadcast(beacon(), 0.15);

        let envelope = timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(140));
        assert_eq!(envelope.delay, 0.15);
    }

    #[tokio::test]
    async fn test_full_loss_delivers_nothing() {
        let mut hub = Hub::new(ChannelConfig {
            base_latency: 0.0,
            jitter_fraction: 0.0,
            loss_rate: 1.0,
        });
        let (a, _rx_a) = hub.register(1);
        let (_b, mut rx_b) = hub.register(2);
        hub.spawn();

        a.broadcast(beacon(), 0.0);
        a.broadcast(beacon(), 0.0);

        assert!(timeout(Duration::from_millis(150), rx_b.recv())
            .await
            .is_err());
    }
}
