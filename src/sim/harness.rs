//! CLI entry point for the simulation harness: two heaters sharing one setpoint,
//! each driven by its own controller against an in-memory gateway.

use clap::Parser;
use htr_cascade::controller::{self, InstanceDeps, InstanceSettings};
use htr_cascade::gateway::MemoryGateway;
use htr_cascade::setpoint::SetpointSynchronizer;
use htr_cascade::sim::{PlantParams, ThermalPlant};
use htr_cascade::store::MemoryStateStore;
use htr_cascade::telemetry::{TelemetryHub, TemperatureSample};
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(name = "sim-harness", about = "Closed-loop heater cascade simulation.")]
pub struct Cli {
    /// Simulated run length in seconds
    #[arg(long, default_value_t = 120)]
    duration: u64,

    /// Shared setpoint in °F
    #[arg(long, default_value_t = 150.0)]
    setpoint: f64,

    /// Ambient temperature in °F
    #[arg(long, default_value_t = 70.0)]
    ambient: f64,

    /// Cascade timer in milliseconds
    #[arg(long, default_value_t = 15_000)]
    timer_ms: u64,

    /// Peak-to-peak sensor noise in °F
    #[arg(long, default_value_t = 0.3)]
    noise: f64,

    /// Put both heaters in automatic cascade mode
    #[arg(long)]
    auto: bool,
}

const HEATERS: [(&str, &str); 2] = [("HTR-A", "sim-a"), ("HTR-B", "sim-b")];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
    let cli = Cli::parse();

    let gateway = Arc::new(MemoryGateway::new());
    // Only port state matters to the plants
    gateway.record_writes(false);
    let store = Arc::new(MemoryStateStore::new());
    let hub = Arc::new(TelemetryHub::new(
        HEATERS.iter().map(|(name, _)| name.to_string()).collect(),
        Duration::from_secs(30),
    ));
    let sync = Arc::new(SetpointSynchronizer::new(store.clone(), 750.0));
    let deps = InstanceDeps {
        gateway: gateway.clone(),
        poller: None,
        hub: hub.clone(),
        store,
        sync,
    };

    let params = PlantParams {
        noise: cli.noise,
        ..PlantParams::default()
    };
    let mut plants = Vec::new();
    let mut handles = Vec::new();
    for (name, address) in HEATERS {
        let mut settings = InstanceSettings::new(name, address);
        settings.timer_size = Duration::from_millis(cli.timer_ms);
        handles.push(controller::spawn(settings, deps.clone()).await);
        plants.push(ThermalPlant::new(address, cli.ambient, params));
    }

    // Section 1 gates each heater's output
    for handle in &handles {
        handle.toggle_section(0).await?;
    }
    // One operator action is enough: the setpoint propagates to the other heater
    handles[0].set_setpoint(cli.setpoint).await?;
    if cli.auto {
        for handle in &handles {
            handle.toggle_auto().await?;
        }
    }

    let dt = Duration::from_millis(100);
    let mut ticker = interval(dt);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let start = Instant::now();
    let mut step = 0u64;
    while start.elapsed() < Duration::from_secs(cli.duration) {
        ticker.tick().await;
        for ((name, _), plant) in HEATERS.iter().zip(plants.iter_mut()) {
            plant.step(&gateway, dt.as_secs_f64());
            hub.publish(TemperatureSample {
                device: name.to_string(),
                value: plant.measure(),
                timestamp: None,
                received_at: Instant::now(),
            });
        }
        step += 1;
        if step % 10 == 0 {
            for handle in &handles {
                println!("{}", serde_json::to_string(&handle.latest_snapshot())?);
            }
        }
    }

    for handle in &handles {
        handle.shutdown().await;
    }
    for (plant, (name, _)) in plants.iter().zip(HEATERS) {
        tracing::info!("{} finished at {:.1}°F", name, plant.temperature());
    }
    Ok(())
}
