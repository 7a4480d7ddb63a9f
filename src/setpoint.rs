// src/setpoint.rs - Shared setpoint broadcast between controller instances
use crate::store::StateStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

pub const DEFAULT_SHARED_SETPOINT: f64 = 150.0;

/// A setpoint published by one instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetpointChange {
    pub value: f64,
    pub origin: Uuid,
    /// Position of this write in the order writes were persisted.
    pub seq: u64,
}

type Registry = Mutex<HashMap<Uuid, mpsc::UnboundedSender<SetpointChange>>>;

/// Last-write-wins setpoint shared by every heater in a deployment.
///
/// Writes are persisted and broadcast one at a time and numbered in that
/// order. A subscriber that drops changes older than its own last write ends
/// up on the persisted value.
pub struct SetpointSynchronizer {
    store: Arc<dyn StateStore>,
    subscribers: Arc<Registry>,
    /// Sequence number of the last write; held across persist and broadcast.
    last_seq: AsyncMutex<u64>,
    max_temp: f64,
}

/// Receiving side of the shared setpoint. Dropping it unsubscribes.
pub struct SetpointSubscription {
    id: Uuid,
    receiver: mpsc::UnboundedReceiver<SetpointChange>,
    registry: Weak<Registry>,
}

impl SetpointSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<SetpointChange> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SetpointChange> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for SetpointSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.id);
        }
    }
}

impl SetpointSynchronizer {
    pub fn new(store: Arc<dyn StateStore>, max_temp: f64) -> Self {
        Self {
            store,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            last_seq: AsyncMutex::new(0),
            max_temp,
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, mpsc::UnboundedSender<SetpointChange>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> SetpointSubscription {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.registry().insert(id, sender);
        SetpointSubscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    /// Current shared value, falling back to the default when nothing is stored.
    pub async fn current(&self) -> f64 {
        match self.store.load_shared_setpoint().await {
            Ok(Some(value)) => value.clamp(0.0, self.max_temp),
            Ok(None) => DEFAULT_SHARED_SETPOINT.min(self.max_temp),
            Err(e) => {
                tracing::error!("Failed to read shared setpoint: {}", e);
                DEFAULT_SHARED_SETPOINT.min(self.max_temp)
            }
        }
    }

    /// Persist `value` and notify every subscriber except `origin`.
    ///
    /// Returns the sequence number of this write.
    pub async fn set(&self, origin: Uuid, value: f64) -> u64 {
        let mut last_seq = self.last_seq.lock().await;
        *last_seq += 1;
        let seq = *last_seq;
        if let Err(e) = self.store.save_shared_setpoint(value).await {
            tracing::error!("Failed to persist shared setpoint {:.1}°F: {}", value, e);
        }
        let change = SetpointChange { value, origin, seq };
        let mut notified = 0;
        self.registry().retain(|id, sender| {
            if *id == origin {
                return true;
            }
            // A closed receiver belongs to a torn-down instance
            let delivered = sender.send(change).is_ok();
            notified += usize::from(delivered);
            delivered
        });
        tracing::info!("Shared setpoint set to {:.1}°F ({} peers notified)", value, notified);
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let sync = SetpointSynchronizer::new(Arc::new(MemoryStateStore::new()), 750.0);
        let mut a = sync.subscribe();
        let mut b = sync.subscribe();
        assert_eq!(sync.set(a.id(), 200.0).await, 1);
        assert_eq!(a.try_recv(), None);
        assert_eq!(
            b.try_recv(),
            Some(SetpointChange {
                value: 200.0,
                origin: a.id(),
                seq: 1
            })
        );
        assert_eq!(sync.current().await, 200.0);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let sync = SetpointSynchronizer::new(Arc::new(MemoryStateStore::new()), 750.0);
        let mut a = sync.subscribe();
        let mut b = sync.subscribe();
        let first = sync.set(a.id(), 180.0).await;
        let second = sync.set(b.id(), 220.0).await;
        assert!(second > first);
        assert_eq!(sync.current().await, 220.0);
        // Each side only ever sees the other's write, in persist order
        assert_eq!(a.try_recv().map(|c| (c.value, c.seq)), Some((220.0, second)));
        assert_eq!(b.try_recv().map(|c| (c.value, c.seq)), Some((180.0, first)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_get_distinct_sequence() {
        let sync = Arc::new(SetpointSynchronizer::new(Arc::new(MemoryStateStore::new()), 750.0));
        let mut watcher = sync.subscribe();
        let writers: Vec<_> = (0..16)
            .map(|i| {
                let sync = sync.clone();
                tokio::spawn(async move { sync.set(Uuid::new_v4(), 100.0 + i as f64).await })
            })
            .collect();
        let mut seqs = Vec::new();
        for writer in writers {
            seqs.push(writer.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=16).collect::<Vec<u64>>());

        // Notifications arrive in sequence order and the last one is what was persisted
        let mut last = None;
        while let Some(change) = watcher.try_recv() {
            if let Some((seq, _)) = last {
                assert!(change.seq > seq);
            }
            last = Some((change.seq, change.value));
        }
        assert_eq!(last.map(|(seq, _)| seq), Some(16));
        assert_eq!(last.map(|(_, value)| value), Some(sync.current().await));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let sync = SetpointSynchronizer::new(Arc::new(MemoryStateStore::new()), 750.0);
        let a = sync.subscribe();
        {
            let _b = sync.subscribe();
            assert_eq!(sync.subscriber_count(), 2);
        }
        assert_eq!(sync.subscriber_count(), 1);
        sync.set(a.id(), 100.0).await;
        assert_eq!(sync.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_default_when_nothing_stored() {
        let sync = SetpointSynchronizer::new(Arc::new(MemoryStateStore::new()), 750.0);
        assert_eq!(sync.current().await, DEFAULT_SHARED_SETPOINT);
        let capped = SetpointSynchronizer::new(Arc::new(MemoryStateStore::new()), 120.0);
        assert_eq!(capped.current().await, 120.0);
    }
}
