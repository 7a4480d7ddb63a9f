// src/telemetry/feed.rs - Push feed connection with capped exponential backoff
use super::hub::{ConnectionStatus, TelemetryHub};
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Opens a connection to the push feed.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedStream>, TransportError>;
    fn describe(&self) -> String;
}

/// An open feed delivering one raw message per call.
#[async_trait]
pub trait FeedStream: Send {
    /// `Ok(None)` when the remote end closed the connection.
    async fn next_message(&mut self) -> Result<Option<String>, TransportError>;
}

/// Line-delimited JSON over TCP.
#[derive(Debug, Clone)]
pub struct TcpLineFeed {
    addr: String,
}

impl TcpLineFeed {
    pub fn new(addr: &str) -> Self {
        Self { addr: addr.to_string() }
    }
}

struct TcpLines {
    lines: Lines<BufReader<TcpStream>>,
}

#[async_trait]
impl FeedStream for TcpLines {
    async fn next_message(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                other => return Ok(other),
            }
        }
    }
}

#[async_trait]
impl FeedConnector for TcpLineFeed {
    async fn connect(&self) -> Result<Box<dyn FeedStream>, TransportError> {
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(Box::new(TcpLines {
            lines: BufReader::new(stream).lines(),
        }))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// `min(base · 2^attempt, max)` between attempts, giving up after `max_attempts`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempts);
        self.attempts += 1;
        Some(self.base.saturating_mul(factor).min(self.max_delay))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

enum StreamEnd {
    Closed,
    Shutdown,
}

async fn pump(hub: &TelemetryHub, stream: &mut dyn FeedStream, shutdown: &mut broadcast::Receiver<()>) -> StreamEnd {
    loop {
        tokio::select! {
            next = stream.next_message() => match next {
                Ok(Some(line)) => {
                    // Malformed lines are counted and logged by the hub
                    let _ = hub.ingest_line(&line);
                }
                Ok(None) => {
                    tracing::warn!("Telemetry feed closed by remote");
                    return StreamEnd::Closed;
                }
                Err(e) => {
                    tracing::warn!("Telemetry feed error: {}", e);
                    return StreamEnd::Closed;
                }
            },
            _ = shutdown.recv() => return StreamEnd::Shutdown,
        }
    }
}

/// Keep the hub connected to the push feed until shutdown or until the
/// reconnect policy gives up.
pub async fn run_feed(
    hub: Arc<TelemetryHub>,
    connector: Arc<dyn FeedConnector>,
    mut policy: ReconnectPolicy,
    mut shutdown: broadcast::Receiver<()>,
) {
    let target = connector.describe();
    loop {
        if policy.attempts() == 0 {
            hub.set_status(ConnectionStatus::Connecting);
        }
        let connected = tokio::select! {
            result = connector.connect() => result,
            _ = shutdown.recv() => break,
        };

        match connected {
            Ok(mut stream) => {
                tracing::info!("Connected to telemetry feed {}", target);
                policy.reset();
                hub.set_status(ConnectionStatus::Connected);
                if let StreamEnd::Shutdown = pump(&hub, stream.as_mut(), &mut shutdown).await {
                    break;
                }
            }
            Err(e) => tracing::warn!("Failed to connect to telemetry feed {}: {}", target, e),
        }

        hub.set_status(ConnectionStatus::Disconnected);
        match policy.next_delay() {
            Some(delay) => {
                hub.set_status(ConnectionStatus::Reconnecting {
                    attempt: policy.attempts(),
                });
                tracing::info!(
                    "Reconnecting to {} in {} ms (attempt {})",
                    target,
                    delay.as_millis(),
                    policy.attempts()
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.recv() => break,
                }
            }
            None => {
                tracing::error!("Max reconnection attempts reached for {}", target);
                hub.set_status(ConnectionStatus::Failed);
                return;
            }
        }
    }
    hub.set_status(ConnectionStatus::Disconnected);
    tracing::info!("Telemetry feed task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[test]
    fn test_backoff_sequence() {
        let mut policy = ReconnectPolicy::default();
        let delays: Vec<u64> = std::iter::from_fn(|| policy.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000, 30_000, 30_000, 30_000]
        );
        assert_eq!(policy.next_delay(), None);
        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
    }

    struct ScriptedStream {
        lines: VecDeque<String>,
    }

    #[async_trait]
    impl FeedStream for ScriptedStream {
        async fn next_message(&mut self) -> Result<Option<String>, TransportError> {
            Ok(self.lines.pop_front())
        }
    }

    /// Fails `failures` times, then serves `lines` once, then fails forever.
    struct ScriptedConnector {
        failures: Mutex<u32>,
        lines: Mutex<Option<Vec<String>>>,
        connects: Mutex<u32>,
    }

    #[async_trait]
    impl FeedConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn FeedStream>, TransportError> {
            *self.connects.lock().unwrap() += 1;
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Closed);
            }
            match self.lines.lock().unwrap().take() {
                Some(lines) => Ok(Box::new(ScriptedStream { lines: lines.into() })),
                None => Err(TransportError::Closed),
            }
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_delivers_then_gives_up() {
        let hub = Arc::new(TelemetryHub::new(vec!["HTR-A".to_string()], Duration::from_secs(30)));
        let mut sub = hub.subscribe("HTR-A");
        let connector = Arc::new(ScriptedConnector {
            failures: Mutex::new(2),
            lines: Mutex::new(Some(vec![
                r#"{"topic":"instrument/htr_a","payload":{"temperature":101.5}}"#.to_string(),
                "garbage".to_string(),
            ])),
            connects: Mutex::new(0),
        });
        let (_tx, rx) = broadcast::channel(1);
        let policy = ReconnectPolicy::new(Duration::from_millis(1000), Duration::from_millis(30_000), 3);
        run_feed(hub.clone(), connector.clone(), policy, rx).await;

        assert_eq!(sub.try_recv().map(|s| s.value), Some(101.5));
        assert_eq!(hub.status(), ConnectionStatus::Failed);
        assert_eq!(hub.health().malformed_messages, 1);
        // Two failures, one session, then three failed attempts after the reset
        assert_eq!(*connector.connects.lock().unwrap(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_stops_on_shutdown() {
        let hub = Arc::new(TelemetryHub::new(vec!["HTR-A".to_string()], Duration::from_secs(30)));
        let connector = Arc::new(ScriptedConnector {
            failures: Mutex::new(u32::MAX),
            lines: Mutex::new(None),
            connects: Mutex::new(0),
        });
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(run_feed(hub.clone(), connector, ReconnectPolicy::default(), rx));
        sleep(Duration::from_millis(1500)).await;
        tx.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(hub.status(), ConnectionStatus::Disconnected);
    }
}
