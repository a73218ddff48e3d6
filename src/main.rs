use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crossbft::common::geo::{Position, Velocity};
use crossbft::config::SimConfig;
use crossbft::network::Hub;
use crossbft::telemetry::{EventReporter, EventSink, NullSink, UdpJsonSink};
use crossbft::vehicle::{Mobility, MotionControl, MotionError, Vehicle};
use crossbft::VehicleId;

/// Vehicles approaching one intersection from alternating directions,
/// negotiating right-of-way over a lossy broadcast medium.
#[derive(Parser, Debug)]
#[command(name = "crossbft")]
struct Args {
    /// Number of simulated vehicles
    #[arg(long, default_value_t = 4)]
    vehicles: usize,
    /// Give up on a vehicle after this many seconds
    #[arg(long, default_value_t = 90.0)]
    timeout: f64,
    /// Optional TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Stream telemetry to this UDP address as JSON datagrams
    #[arg(long)]
    telemetry: Option<SocketAddr>,
    /// Override the channel packet loss rate (0.0 - 1.0)
    #[arg(long)]
    loss: Option<f64>,
}

/// Shared kinematic ground truth. Stands in for the external traffic
/// micro-simulation: vehicles move in straight lines toward and through
/// the intersection, speed commands take effect instantly.
#[derive(Default)]
struct World {
    vehicles: HashMap<VehicleId, Kinematics>,
}

struct Kinematics {
    position: Position,
    heading: (f64, f64),
    speed: f64,
}

impl World {
    fn step(&mut self, dt: f64) {
        for k in self.vehicles.values_mut() {
            k.position.x += k.heading.0 * k.speed * dt;
            k.position.y += k.heading.1 * k.speed * dt;
        }
    }
}

type SharedWorld = Arc<Mutex<World>>;

fn lock(world: &SharedWorld) -> std::sync::MutexGuard<'_, World> {
    world.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
struct WorldMobility {
    id: VehicleId,
    stop_line_offset: f64,
    world: SharedWorld,
}

impl Mobility for WorldMobility {
    fn position(&self) -> Position {
        lock(&self.world)
            .vehicles
            .get(&self.id)
            .map(|k| k.position)
            .unwrap_or_default()
    }

    fn velocity(&self) -> Velocity {
        lock(&self.world)
            .vehicles
            .get(&self.id)
            .map(|k| Velocity::new(k.heading.0 * k.speed, k.heading.1 * k.speed))
            .unwrap_or_default()
    }

    fn speed(&self) -> f64 {
        lock(&self.world)
            .vehicles
            .get(&self.id)
            .map(|k| k.speed)
            .unwrap_or_default()
    }

    fn next_traffic_signal_distance(&self) -> Option<f64> {
        // the demo intersection is signal-controlled; the signal sits on
        // the stop line
        let dist = self
            .position()
            .distance(&Position::new(0.0, 0.0));
        Some(dist - self.stop_line_offset)
    }
}

#[derive(Clone)]
struct WorldMotion {
    id: VehicleId,
    world: SharedWorld,
}

impl MotionControl for WorldMotion {
    fn set_target_speed(&mut self, speed: f64) -> Result<(), MotionError> {
        match lock(&self.world).vehicles.get_mut(&self.id) {
            Some(k) => {
                k.speed = speed;
                Ok(())
            }
            None => Err(MotionError(format!("vehicle {} not in world", self.id))),
        }
    }
}

/// Place vehicle i on one of the four approaches, staggered so arrivals
/// interleave.
fn spawn_kinematics(i: usize) -> Kinematics {
    let start_distance = 45.0 + 12.0 * (i / 4) as f64 + 6.0 * (i % 4) as f64;
    let lane = 2.0;
    let (position, heading) = match i % 4 {
        0 => (Position::new(-start_distance, -lane), (1.0, 0.0)),
        1 => (Position::new(lane, -start_distance), (0.0, 1.0)),
        2 => (Position::new(start_distance, lane), (-1.0, 0.0)),
        _ => (Position::new(-lane, start_distance), (0.0, -1.0)),
    };
    Kinematics {
        position,
        heading,
        speed: 12.0,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };
    if let Some(loss) = args.loss {
        cfg.channel.loss_rate = loss;
    }
    info!(
        vehicles = args.vehicles,
        loss = cfg.channel.loss_rate,
        "starting intersection scenario"
    );

    let world: SharedWorld = Arc::new(Mutex::new(World::default()));
    let mut hub = Hub::new(cfg.channel);
    let mut rng = rand::thread_rng();
    let mut tasks = Vec::new();

    for i in 0..args.vehicles {
        let id = i as VehicleId;
        lock(&world).vehicles.insert(id, spawn_kinematics(i));

        let (handle, rx) = hub.register(id);
        let sink: Box<dyn EventSink> = match args.telemetry {
            Some(addr) => Box::new(UdpJsonSink::new(addr)?),
            None => Box::new(NullSink),
        };
        let reporter = EventReporter::new(id, sink);

        let mut vehicle = Vehicle::new(id, cfg.clone(), handle, reporter, &mut rng);
        vehicle.attach(
            WorldMobility {
                id,
                stop_line_offset: cfg.stop_line_offset,
                world: world.clone(),
            },
            WorldMotion {
                id,
                world: world.clone(),
            },
        );
        tasks.push(tokio::spawn(vehicle.run(rx)));
    }

    let hub_task = hub.spawn();
    let world_task = {
        let world = world.clone();
        tokio::spawn(async move {
            let dt = 0.05;
            let mut tick = time::interval(Duration::from_secs_f64(dt));
            loop {
                tick.tick().await;
                lock(&world).step(dt);
            }
        })
    };

    let deadline = Duration::from_secs_f64(args.timeout);
    for task in tasks {
        match time::timeout(deadline, task).await {
            Ok(Ok(summary)) => {
                println!(
                    "vehicle {}: state={} transitions={} waiting={:.1}s phase={} integrity={:?}",
                    summary.id,
                    summary.final_state.as_str(),
                    summary.state_transitions,
                    summary.total_waiting_time,
                    summary.final_phase.as_str(),
                    summary.integrity,
                );
            }
            Ok(Err(e)) => warn!(error = %e, "vehicle task failed"),
            Err(_) => println!("vehicle did not finish within {:.0}s", args.timeout),
        }
    }

    world_task.abort();
    hub_task.abort();
    Ok(())
}
