// src/store.rs - Persistence of per-heater state and the shared setpoint
use crate::control::{ControlMode, SECTION_COUNT};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::fs;

/// Per-heater records older than this are ignored on startup.
pub const FRESHNESS_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Snapshot of the operator-facing heater settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedHeaterState {
    pub is_auto: bool,
    pub setpoint: f64,
    pub sections: [bool; SECTION_COUNT],
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub control_mode: ControlMode,
    /// Cascade timer in milliseconds
    pub timer_size: u64,
    pub saved_at: DateTime<Utc>,
}

impl PersistedHeaterState {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.saved_at) < ChronoDuration::hours(FRESHNESS_WINDOW_HOURS)
    }

    /// Same settings, ignoring when they were saved.
    pub fn same_settings(&self, other: &PersistedHeaterState) -> bool {
        self.is_auto == other.is_auto
            && self.setpoint == other.setpoint
            && self.sections == other.sections
            && self.kp == other.kp
            && self.ki == other.ki
            && self.kd == other.kd
            && self.control_mode == other.control_mode
            && self.timer_size == other.timer_size
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_heater(&self, name: &str) -> Result<Option<PersistedHeaterState>, StoreError>;
    async fn save_heater(&self, name: &str, state: &PersistedHeaterState) -> Result<(), StoreError>;
    async fn load_shared_setpoint(&self) -> Result<Option<f64>, StoreError>;
    async fn save_shared_setpoint(&self, value: f64) -> Result<(), StoreError>;
}

/// Load a heater record only if it is within the freshness window.
pub async fn load_fresh(store: &dyn StateStore, name: &str) -> Option<PersistedHeaterState> {
    match store.load_heater(name).await {
        Ok(Some(record)) if record.is_fresh(Utc::now()) => {
            tracing::info!("Restored {} state saved at {}", name, record.saved_at);
            Some(record)
        }
        Ok(Some(record)) => {
            tracing::info!("Ignoring stale {} state saved at {}", name, record.saved_at);
            None
        }
        Ok(None) => None,
        Err(e) => {
            tracing::error!("Failed to load {} state: {}", name, e);
            None
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SharedSetpointRecord {
    setpoint: f64,
}

/// JSON files in one directory: `heater_<name>.json` and `shared_setpoint.json`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn heater_path(&self, name: &str) -> PathBuf {
        let key: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        self.dir.join(format!("heater_{}.json", key))
    }

    fn shared_path(&self) -> PathBuf {
        self.dir.join("shared_setpoint.json")
    }

    async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Write through a temporary file so readers never see half a record.
    async fn write_atomic(path: &Path, contents: String) -> Result<(), StoreError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_heater(&self, name: &str) -> Result<Option<PersistedHeaterState>, StoreError> {
        match Self::read_optional(&self.heater_path(name)).await? {
            Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            None => Ok(None),
        }
    }

    async fn save_heater(&self, name: &str, state: &PersistedHeaterState) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(state)?;
        Self::write_atomic(&self.heater_path(name), contents).await
    }

    async fn load_shared_setpoint(&self) -> Result<Option<f64>, StoreError> {
        match Self::read_optional(&self.shared_path()).await? {
            Some(contents) => {
                let record: SharedSetpointRecord = serde_json::from_str(&contents)?;
                Ok(Some(record.setpoint))
            }
            None => Ok(None),
        }
    }

    async fn save_shared_setpoint(&self, value: f64) -> Result<(), StoreError> {
        let contents = serde_json::to_string(&SharedSetpointRecord { setpoint: value })?;
        Self::write_atomic(&self.shared_path(), contents).await
    }
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    heaters: HashMap<String, PersistedHeaterState>,
    shared_setpoint: Option<f64>,
    saves: usize,
}

/// Volatile store for tests and the simulator.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_heater(&self, name: &str, state: PersistedHeaterState) {
        self.lock().heaters.insert(name.to_string(), state);
    }

    pub fn heater(&self, name: &str) -> Option<PersistedHeaterState> {
        self.lock().heaters.get(name).cloned()
    }

    /// Number of heater saves so far.
    pub fn save_count(&self) -> usize {
        self.lock().saves
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_heater(&self, name: &str) -> Result<Option<PersistedHeaterState>, StoreError> {
        Ok(self.lock().heaters.get(name).cloned())
    }

    async fn save_heater(&self, name: &str, state: &PersistedHeaterState) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.heaters.insert(name.to_string(), state.clone());
        inner.saves += 1;
        Ok(())
    }

    async fn load_shared_setpoint(&self) -> Result<Option<f64>, StoreError> {
        Ok(self.lock().shared_setpoint)
    }

    async fn save_shared_setpoint(&self, value: f64) -> Result<(), StoreError> {
        self.lock().shared_setpoint = Some(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(saved_at: DateTime<Utc>) -> PersistedHeaterState {
        PersistedHeaterState {
            is_auto: true,
            setpoint: 180.0,
            sections: [true, true, false, false],
            kp: 3.0,
            ki: 0.1,
            kd: 0.3,
            control_mode: ControlMode::Modulated,
            timer_size: 20_000,
            saved_at,
        }
    }

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        assert!(record(now - ChronoDuration::hours(23)).is_fresh(now));
        assert!(!record(now - ChronoDuration::hours(24)).is_fresh(now));
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(record(Utc::now())).unwrap();
        assert_eq!(json["isAuto"], true);
        assert_eq!(json["controlMode"], "MODULATED");
        assert_eq!(json["timerSize"], 20_000);
        assert!(json.get("savedAt").is_some());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        assert!(store.load_heater("HTR-A").await.unwrap().is_none());
        assert!(store.load_shared_setpoint().await.unwrap().is_none());

        let saved = record(Utc::now());
        store.save_heater("HTR-A", &saved).await.unwrap();
        store.save_shared_setpoint(210.0).await.unwrap();

        let reopened = FileStateStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load_heater("HTR-A").await.unwrap(), Some(saved));
        assert_eq!(reopened.load_shared_setpoint().await.unwrap(), Some(210.0));
        assert!(dir.path().join("heater_htr_a.json").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_record() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("heater_htr_b.json"), "{not json").unwrap();
        assert!(matches!(store.load_heater("HTR-B").await, Err(StoreError::Json(_))));
        assert!(load_fresh(&store, "HTR-B").await.is_none());
    }

    #[tokio::test]
    async fn test_load_fresh_skips_stale_records() {
        let store = MemoryStateStore::new();
        store.insert_heater("HTR-A", record(Utc::now() - ChronoDuration::hours(30)));
        assert!(load_fresh(&store, "HTR-A").await.is_none());
        store.insert_heater("HTR-A", record(Utc::now()));
        assert!(load_fresh(&store, "HTR-A").await.is_some());
    }
}
