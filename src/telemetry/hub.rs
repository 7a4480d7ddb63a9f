// src/telemetry/hub.rs - Fan-out of temperature samples to controller instances
use super::{normalize_device, parse_message, FeedMessage, TemperatureSample};
use crate::error::MalformedDataError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Duration, Instant};
use uuid::Uuid;

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Connected,
    /// Connected but silent for longer than the stale threshold.
    Stale,
    Reconnecting { attempt: u32 },
    Disconnected,
    /// Reconnection attempts exhausted.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedHealth {
    pub status: ConnectionStatus,
    pub stale: bool,
    pub ms_since_last_message: Option<u64>,
    pub messages: u64,
    pub malformed_messages: u64,
    pub subscribers: usize,
    pub devices: Vec<String>,
}

struct Subscriber {
    device_key: String,
    sender: mpsc::UnboundedSender<TemperatureSample>,
}

#[derive(Default)]
struct HubInner {
    subscribers: HashMap<Uuid, Subscriber>,
    latest: HashMap<String, TemperatureSample>,
    last_message: Option<Instant>,
    messages: u64,
    malformed: u64,
}

/// Shared connection manager for the telemetry feed.
///
/// Built once by the composition root and handed to every controller
/// instance; each instance subscribes for its own device.
pub struct TelemetryHub {
    devices: Vec<String>,
    inner: Arc<Mutex<HubInner>>,
    status: watch::Sender<ConnectionStatus>,
    stale_after: Duration,
}

/// Per-device sample stream. Dropping it unsubscribes.
pub struct TelemetrySubscription {
    id: Uuid,
    receiver: mpsc::UnboundedReceiver<TemperatureSample>,
    hub: Weak<Mutex<HubInner>>,
}

impl TelemetrySubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<TemperatureSample> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TemperatureSample> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for TelemetrySubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            inner.lock().unwrap_or_else(|e| e.into_inner()).subscribers.remove(&self.id);
        }
    }
}

impl TelemetryHub {
    pub fn new(devices: Vec<String>, stale_after: Duration) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::NotConnected);
        Self {
            devices,
            inner: Arc::new(Mutex::new(HubInner::default())),
            status,
            stale_after,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    /// Subscribe to samples for `device`. The most recent sample, if any, is
    /// delivered straight away.
    pub fn subscribe(&self, device: &str) -> TelemetrySubscription {
        let id = Uuid::new_v4();
        let device_key = normalize_device(device);
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if let Some(latest) = inner.latest.get(&device_key) {
            let _ = sender.send(latest.clone());
        }
        inner.subscribers.insert(id, Subscriber { device_key, sender });
        tracing::debug!("Telemetry subscriber {} added for {}", id, device);
        TelemetrySubscription {
            id,
            receiver,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn latest(&self, device: &str) -> Option<TemperatureSample> {
        self.lock().latest.get(&normalize_device(device)).cloned()
    }

    /// Decode one feed message and publish the resulting sample.
    pub fn ingest(&self, message: &FeedMessage) -> Result<TemperatureSample, MalformedDataError> {
        self.mark_message();
        match parse_message(message, &self.devices, Instant::now()) {
            Ok(sample) => {
                self.publish(sample.clone());
                Ok(sample)
            }
            Err(e) => {
                self.record_malformed(&message.topic, &e);
                Err(e)
            }
        }
    }

    /// Decode a raw feed line (`{"topic": ..., "payload": ...}`).
    pub fn ingest_line(&self, line: &str) -> Result<TemperatureSample, MalformedDataError> {
        match serde_json::from_str::<FeedMessage>(line) {
            Ok(message) => self.ingest(&message),
            Err(e) => {
                self.mark_message();
                let e = MalformedDataError::from(e);
                self.record_malformed("<unparsed>", &e);
                Err(e)
            }
        }
    }

    fn mark_message(&self) {
        {
            let mut inner = self.lock();
            inner.last_message = Some(Instant::now());
            inner.messages += 1;
        }
        self.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Stale {
                *status = ConnectionStatus::Connected;
                true
            } else {
                false
            }
        });
    }

    fn record_malformed(&self, topic: &str, error: &MalformedDataError) {
        self.lock().malformed += 1;
        tracing::warn!("Discarding telemetry message on '{}': {}", topic, error);
    }

    /// Hand a sample to every subscriber of its device.
    pub fn publish(&self, sample: TemperatureSample) {
        let key = normalize_device(&sample.device);
        let mut inner = self.lock();
        inner.latest.insert(key.clone(), sample.clone());
        inner.subscribers.retain(|_, subscriber| {
            if subscriber.device_key != key {
                return true;
            }
            subscriber.sender.send(sample.clone()).is_ok()
        });
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::info!("Telemetry feed status: {:?} -> {:?}", current, status);
            *current = status;
            true
        });
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn health(&self) -> FeedHealth {
        let now = Instant::now();
        let status = self.status();
        let inner = self.lock();
        let since = inner.last_message.map(|at| now.saturating_duration_since(at));
        let stale = matches!(status, ConnectionStatus::Connected | ConnectionStatus::Stale)
            && since.is_none_or(|d| d > self.stale_after);
        FeedHealth {
            status,
            stale,
            ms_since_last_message: since.map(|d| d.as_millis() as u64),
            messages: inner.messages,
            malformed_messages: inner.malformed,
            subscribers: inner.subscribers.len(),
            devices: self.devices.clone(),
        }
    }

    /// Flag a connected but silent feed as stale.
    pub fn check_stale(&self) -> bool {
        let health = self.health();
        if health.stale && health.status == ConnectionStatus::Connected {
            tracing::warn!(
                "Telemetry feed silent for {} ms, marking stale",
                health.ms_since_last_message.unwrap_or_default()
            );
            self.set_status(ConnectionStatus::Stale);
        }
        health.stale
    }
}

/// Periodically mark the feed stale while no messages arrive.
pub async fn run_health_check(hub: Arc<TelemetryHub>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                hub.check_stale();
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub() -> TelemetryHub {
        TelemetryHub::new(vec!["HTR-A".to_string(), "HTR-B".to_string()], DEFAULT_STALE_AFTER)
    }

    fn reading(topic: &str, value: f64) -> FeedMessage {
        FeedMessage {
            topic: topic.to_string(),
            payload: json!({ "temperature": value }),
        }
    }

    #[tokio::test]
    async fn test_samples_routed_by_device() {
        let hub = hub();
        let mut a = hub.subscribe("HTR-A");
        let mut b = hub.subscribe("htr_b");
        hub.ingest(&reading("instrument/htr_a", 140.0)).unwrap();
        hub.ingest(&reading("instrument/htr-b", 90.0)).unwrap();
        assert_eq!(a.try_recv().map(|s| s.value), Some(140.0));
        assert!(a.try_recv().is_none());
        assert_eq!(b.try_recv().map(|s| s.value), Some(90.0));
    }

    #[tokio::test]
    async fn test_latest_delivered_on_subscribe() {
        let hub = hub();
        hub.ingest(&reading("instrument/htr_a", 133.0)).unwrap();
        let mut late = hub.subscribe("HTR-A");
        assert_eq!(late.try_recv().map(|s| s.value), Some(133.0));
        assert_eq!(hub.latest("htr-a").map(|s| s.value), Some(133.0));
    }

    #[tokio::test]
    async fn test_malformed_counted_and_dropped() {
        let hub = hub();
        let mut a = hub.subscribe("HTR-A");
        assert!(hub.ingest(&reading("instrument/htr_a", -4.0)).is_err());
        assert!(hub.ingest_line("{not json").is_err());
        assert!(a.try_recv().is_none());
        let health = hub.health();
        assert_eq!(health.malformed_messages, 2);
        assert_eq!(health.messages, 2);
    }

    #[tokio::test]
    async fn test_dropped_subscription_removed() {
        let hub = hub();
        let sub = hub.subscribe("HTR-A");
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_detection() {
        let hub = hub();
        hub.set_status(ConnectionStatus::Connected);
        hub.ingest(&reading("instrument/htr_a", 120.0)).unwrap();
        assert!(!hub.check_stale());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(hub.check_stale());
        assert_eq!(hub.status(), ConnectionStatus::Stale);
        hub.ingest(&reading("instrument/htr_a", 121.0)).unwrap();
        assert_eq!(hub.status(), ConnectionStatus::Connected);
    }
}
