use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::domain::{DeviceId, PersistedDeviceState};
use crate::error::SchedulingError;

/// Persisted per-device scheduling state, read at the start of a pass and written at its end
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// State of `device_id`; an unknown device yields an empty record
    async fn get(&self, device_id: &str) -> Result<PersistedDeviceState, SchedulingError>;

    async fn save(&self, device_id: &str, state: &PersistedDeviceState) -> Result<(), SchedulingError>;

    /// Writes the records of one pass, keyed by their `device_id`
    async fn save_all(&self, states: &[PersistedDeviceState]) -> Result<(), SchedulingError> {
        for state in states {
            self.save(&state.device_id, state).await?;
        }
        Ok(())
    }
}

type StateMap = BTreeMap<DeviceId, PersistedDeviceState>;

fn lookup(map: &StateMap, device_id: &str) -> PersistedDeviceState {
    let mut state = map.get(device_id).cloned().unwrap_or_default();
    state.device_id = device_id.to_string();
    state
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: Mutex<StateMap>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StateMap {
        self.states.lock().clone()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, device_id: &str) -> Result<PersistedDeviceState, SchedulingError> {
        Ok(lookup(&self.states.lock(), device_id))
    }

    async fn save(&self, device_id: &str, state: &PersistedDeviceState) -> Result<(), SchedulingError> {
        let mut state = state.clone();
        state.device_id = device_id.to_string();
        self.states.lock().insert(device_id.to_string(), state);
        Ok(())
    }

    async fn save_all(&self, states: &[PersistedDeviceState]) -> Result<(), SchedulingError> {
        let mut map = self.states.lock();
        for state in states {
            map.insert(state.device_id.clone(), state.clone());
        }
        Ok(())
    }
}

/// One JSON object keyed by device id, replaced atomically on every write
#[derive(Debug)]
pub struct JsonFileStateStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Raw file body; `None` when there is no file yet or it is empty
    async fn read_body(&self) -> Result<Option<String>, SchedulingError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(body) if body.trim().is_empty() => Ok(None),
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file yet");
                Ok(None)
            }
            Err(e) => Err(SchedulingError::Persistence(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn read_map(&self) -> Result<StateMap, SchedulingError> {
        match self.read_body().await? {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Ok(StateMap::new()),
        }
    }

    async fn write_map(&self, map: &StateMap) -> Result<(), SchedulingError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let body = serde_json::to_vec_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn update(&self, states: &[PersistedDeviceState]) -> Result<(), SchedulingError> {
        let _guard = self.write_lock.lock().await;
        // An unparseable file would otherwise block every later write
        let mut map = match self.read_body().await? {
            Some(body) => serde_json::from_str(&body).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "state file is corrupt, overwriting it");
                StateMap::new()
            }),
            None => StateMap::new(),
        };
        for state in states {
            map.insert(state.device_id.clone(), state.clone());
        }
        self.write_map(&map).await?;
        info!(path = %self.path.display(), records = states.len(), "device state saved");
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn get(&self, device_id: &str) -> Result<PersistedDeviceState, SchedulingError> {
        let map = self.read_map().await?;
        Ok(lookup(&map, device_id))
    }

    async fn save(&self, device_id: &str, state: &PersistedDeviceState) -> Result<(), SchedulingError> {
        let mut state = state.clone();
        state.device_id = device_id.to_string();
        self.update(std::slice::from_ref(&state)).await
    }

    async fn save_all(&self, states: &[PersistedDeviceState]) -> Result<(), SchedulingError> {
        self.update(states).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, FixedOffset, TimeZone};

    fn t0() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 2, 1, 10, 0, 0)
            .unwrap()
    }

    fn state(id: &str) -> PersistedDeviceState {
        PersistedDeviceState {
            device_id: id.into(),
            last_run_end: Some(t0()),
            locked_starts: vec![t0(), t0() + chrono::Duration::minutes(15)],
        }
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let store = InMemoryStateStore::new();
        let missing = store.get("hp").await.unwrap();
        assert_eq!(missing, PersistedDeviceState::empty("hp"));

        store.save_all(&[state("hp"), state("battery_charge")]).await.unwrap();
        assert_eq!(store.get("hp").await.unwrap(), state("hp"));
        assert_eq!(store.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_json_file_store_layout() {
        let dir = std::env::temp_dir().join(format!("state-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.json");
        let store = JsonFileStateStore::new(&path);

        assert_eq!(store.get("hp").await.unwrap(), PersistedDeviceState::empty("hp"));

        store.save("hp", &state("ignored")).await.unwrap();
        store.save_all(&[state("hot_water")]).await.unwrap();

        let body = tokio::fs::read_to_string(&path).await.unwrap();
        let raw: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(raw["hp"]["last_run_end"].is_string());
        assert_eq!(raw["hot_water"]["locked_starts"].as_array().unwrap().len(), 2);
        assert!(raw["hp"].get("device_id").is_none());
        assert!(!path.with_extension("json.tmp").exists());

        assert_eq!(store.get("hp").await.unwrap(), state("hp"));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_persistence_error() {
        let path = std::env::temp_dir().join(format!("state-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "{not json").await.unwrap();
        let store = JsonFileStateStore::new(&path);
        assert!(matches!(store.get("hp").await, Err(SchedulingError::Persistence(_))));
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_replaces_corrupt_file() {
        let path = std::env::temp_dir().join(format!("state-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "{\"hp\": {\"last_run_end\": ").await.unwrap();
        let store = JsonFileStateStore::new(&path);
        assert!(store.get("hp").await.is_err());

        store.save_all(&[state("hp"), state("hot_water")]).await.unwrap();
        assert_eq!(store.get("hp").await.unwrap(), state("hp"));
        assert_eq!(store.get("hot_water").await.unwrap(), state("hot_water"));

        // Later writes merge as usual
        store.save("battery_charge", &state("battery_charge")).await.unwrap();
        assert_eq!(store.get("hp").await.unwrap(), state("hp"));
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_store_default_save_all() {
        let mut mock = MockStateStore::new();
        mock.expect_save_all()
            .returning(|_| Err(SchedulingError::Persistence("disk full".into())));
        let err = mock.save_all(&[state("hp")]).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }
}
