//! History, connection profile and per-profile settings persistence.
//!
//! Each store keeps one pretty-printed JSON file under the console's data
//! directory. Writes go to a `.tmp` sibling first and are renamed into place.

use crate::error::StorageError;
use crate::model::{MaintenanceOptions, RunRecord, ServerProfile};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_HISTORY_LIMIT: usize = 200;

const HISTORY_FILE: &str = "history.json";
const PROFILES_FILE: &str = "profiles.json";
const SETTINGS_FILE: &str = "settings.json";

/// Options each profile changed, by profile id. Only changed keys are kept.
type StoredSettings = BTreeMap<String, Map<String, Value>>;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Newest first, at most `limit` (default 200) records.
    async fn list(
        &self,
        profile_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RunRecord>, StorageError>;

    /// Remove every record, or only one profile's. Returns how many went.
    async fn clear(&self, profile_id: Option<&str>) -> Result<usize, StorageError>;

    /// Store a finished run and return it with its assigned id.
    async fn append(&self, record: RunRecord) -> Result<RunRecord, StorageError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn list(&self) -> Result<Vec<ServerProfile>, StorageError>;

    /// Insert or replace by id. Passwords are never written.
    async fn save(&self, profile: ServerProfile) -> Result<(), StorageError>;

    async fn delete(&self, profile_id: &str) -> Result<bool, StorageError>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// The profile's stored options laid over the defaults.
    async fn get(&self, profile_id: &str) -> Result<MaintenanceOptions, StorageError>;

    /// Change one option for the profile and return the options now in effect.
    async fn update(
        &self,
        profile_id: &str,
        key: &str,
        value: Value,
    ) -> Result<MaintenanceOptions, StorageError>;
}

/// Default directory for console data files.
pub fn default_data_dir() -> Result<PathBuf, StorageError> {
    dirs::data_dir()
        .map(|d| d.join("idxmaint-console"))
        .ok_or(StorageError::NoDataDir)
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Run a read-modify-write of `path` on the blocking pool.
async fn with_file<T, R, F>(path: &Path, f: F) -> Result<R, StorageError>
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut T) -> (R, bool) + Send + 'static,
{
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut value: T = load_json(&path)?;
        let (out, dirty) = f(&mut value);
        if dirty {
            save_json(&path, &value)?;
        }
        Ok(out)
    })
    .await
    .map_err(|e| StorageError::Io(io::Error::other(e)))?
}

/// History kept in `history.json`.
#[derive(Clone)]
pub struct JsonHistoryStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl JsonHistoryStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(HISTORY_FILE),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn list(
        &self,
        profile_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RunRecord>, StorageError> {
        let _guard = self.lock.lock().await;
        let filter = profile_id.map(str::to_string);
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        with_file(&self.path, move |records: &mut Vec<RunRecord>| {
            let mut out: Vec<RunRecord> = records
                .iter()
                .filter(|r| filter.as_deref().map_or(true, |id| r.profile_id == id))
                .cloned()
                .collect();
            out.sort_by(|a, b| b.id.cmp(&a.id));
            out.truncate(limit);
            (out, false)
        })
        .await
    }

    async fn clear(&self, profile_id: Option<&str>) -> Result<usize, StorageError> {
        let _guard = self.lock.lock().await;
        let filter = profile_id.map(str::to_string);
        let removed = with_file(&self.path, move |records: &mut Vec<RunRecord>| {
            let before = records.len();
            match filter.as_deref() {
                Some(id) => records.retain(|r| r.profile_id != id),
                None => records.clear(),
            }
            let removed = before - records.len();
            (removed, removed > 0)
        })
        .await?;
        tracing::info!(removed, profile_id = ?profile_id, "history cleared");
        Ok(removed)
    }

    async fn append(&self, mut record: RunRecord) -> Result<RunRecord, StorageError> {
        let _guard = self.lock.lock().await;
        with_file(&self.path, move |records: &mut Vec<RunRecord>| {
            record.id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
            records.push(record.clone());
            (record, true)
        })
        .await
    }
}

/// Connection profiles kept in `profiles.json`, without passwords.
#[derive(Clone)]
pub struct JsonProfileStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl JsonProfileStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(PROFILES_FILE),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl ProfileStore for JsonProfileStore {
    async fn list(&self) -> Result<Vec<ServerProfile>, StorageError> {
        let _guard = self.lock.lock().await;
        with_file(&self.path, |profiles: &mut Vec<ServerProfile>| {
            let mut out = profiles.clone();
            out.sort_by(|a, b| a.name.cmp(&b.name));
            (out, false)
        })
        .await
    }

    async fn save(&self, mut profile: ServerProfile) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        profile.password.clear();
        let id = profile.id.clone();
        with_file(&self.path, move |profiles: &mut Vec<ServerProfile>| {
            match profiles.iter().position(|p| p.id == profile.id) {
                Some(i) => profiles[i] = profile,
                None => profiles.push(profile),
            }
            ((), true)
        })
        .await?;
        tracing::debug!(profile_id = %id, "profile saved");
        Ok(())
    }

    async fn delete(&self, profile_id: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        let id = profile_id.to_string();
        with_file(&self.path, move |profiles: &mut Vec<ServerProfile>| {
            let before = profiles.len();
            profiles.retain(|p| p.id != id);
            let removed = profiles.len() != before;
            (removed, removed)
        })
        .await
    }
}

fn default_options() -> Result<Map<String, Value>, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(MaintenanceOptions::default())?)
}

/// Defaults first, then the stored values. Stored keys the options no longer
/// have are ignored.
fn merge_over_defaults(
    stored: Option<&Map<String, Value>>,
) -> Result<MaintenanceOptions, serde_json::Error> {
    let mut merged = default_options()?;
    for (key, value) in stored.into_iter().flatten() {
        if let Some(slot) = merged.get_mut(key) {
            *slot = value.clone();
        }
    }
    serde_json::from_value(Value::Object(merged))
}

/// Per-profile maintenance options kept in `settings.json`.
#[derive(Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl JsonSettingsStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SETTINGS_FILE),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn get(&self, profile_id: &str) -> Result<MaintenanceOptions, StorageError> {
        let _guard = self.lock.lock().await;
        let id = profile_id.to_string();
        let merged = with_file(&self.path, move |all: &mut StoredSettings| {
            (merge_over_defaults(all.get(&id)), false)
        })
        .await?;
        Ok(merged?)
    }

    async fn update(
        &self,
        profile_id: &str,
        key: &str,
        value: Value,
    ) -> Result<MaintenanceOptions, StorageError> {
        if !default_options()?.contains_key(key) {
            return Err(StorageError::UnknownSetting(key.to_string()));
        }
        let _guard = self.lock.lock().await;
        let id = profile_id.to_string();
        let key = key.to_string();
        with_file(&self.path, move |all: &mut StoredSettings| {
            let mut entry = all.get(&id).cloned().unwrap_or_default();
            entry.insert(key.clone(), value);
            match merge_over_defaults(Some(&entry)) {
                Ok(options) => {
                    tracing::debug!(profile_id = %id, setting = %key, "setting updated");
                    all.insert(id, entry);
                    (Ok(options), true)
                }
                Err(source) => (Err(StorageError::InvalidSetting { key, source }), false),
            }
        })
        .await?
    }
}
