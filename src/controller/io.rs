// src/controller/io.rs - I/O tasks feeding a controller instance
//
// None of these touch heater state. They only talk to the outside world and
// forward what they learn as commands.
use super::command::ControllerCommand;
use crate::control::SECTION_COUNT;
use crate::gateway::{section_port, spawn_set_port, ActuatorGateway, TemperatureSource, SECTION_PORTS};
use crate::telemetry::TelemetrySubscription;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

/// Forward pushed samples for this heater's device.
pub(crate) fn spawn_push(
    mut samples: TelemetrySubscription,
    commands: mpsc::Sender<ControllerCommand>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                sample = samples.recv() => match sample {
                    Some(sample) => {
                        if commands.send(ControllerCommand::Temperature(sample.value)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// Poll the temperature endpoint regardless of push-feed health.
pub(crate) fn spawn_poll(
    source: Arc<dyn TemperatureSource>,
    device_id: String,
    period: Duration,
    commands: mpsc::Sender<ControllerCommand>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match source.fetch_temperature(&device_id).await {
                        Ok(value) => {
                            if commands.send(ControllerCommand::Temperature(value)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::debug!("Temperature poll for {} failed: {}", device_id, e),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// Read ports 1-4 concurrently. Failed reads come back as `None`.
pub(crate) async fn read_sections(gateway: &dyn ActuatorGateway, device_address: &str) -> [Option<bool>; SECTION_COUNT] {
    let results = join_all(SECTION_PORTS.iter().map(|port| gateway.read_port(device_address, *port))).await;
    let mut readings = [None; SECTION_COUNT];
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(state) => readings[index] = Some(state),
            Err(e) => tracing::debug!("Read of port {} on {} failed: {}", section_port(index), device_address, e),
        }
    }
    readings
}

pub(crate) fn spawn_actuator_poll(
    gateway: Arc<dyn ActuatorGateway>,
    device_address: String,
    period: Duration,
    commands: mpsc::Sender<ControllerCommand>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let readings = read_sections(gateway.as_ref(), &device_address).await;
                    if readings.iter().all(Option::is_none) {
                        continue;
                    }
                    if commands.send(ControllerCommand::Reconcile { readings }).await.is_err() {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// One extra read-back shortly after a manual toggle.
pub(crate) fn spawn_early_poll(
    gateway: Arc<dyn ActuatorGateway>,
    device_address: String,
    delay: Duration,
    commands: mpsc::Sender<ControllerCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;
        let readings = read_sections(gateway.as_ref(), &device_address).await;
        // The instance may already be gone
        let _ = commands.send(ControllerCommand::Reconcile { readings }).await;
    })
}

/// Re-send ON for restored sections once the gateway has had time to settle.
pub(crate) fn spawn_restore(
    gateway: Arc<dyn ActuatorGateway>,
    device_address: String,
    sections: [bool; SECTION_COUNT],
    delay: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.recv() => return,
        }
        for (index, on) in sections.iter().enumerate() {
            if *on {
                tracing::info!("Restoring section {} on {}", index + 1, device_address);
                spawn_set_port(gateway.clone(), device_address.clone(), section_port(index), true);
            }
        }
    })
}
