//! Long-term identity store
//!
//! Holds the stable `userId` under a single key. The id is generated once
//! (UUID v4) the first time it is missing and is never rewritten afterwards.

use crate::error::{Error, Result};
use crate::types::UserId;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key under which the user id is stored
pub const USER_ID_KEY: &str = "userId";

/// Minimal key-value store for long-lived identifiers.
pub trait IdentityStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Read the persisted user id, generating and persisting one if absent.
pub fn load_or_create_user_id(store: &dyn IdentityStore) -> Result<UserId> {
    if let Some(existing) = store.get(USER_ID_KEY)? {
        let existing = existing.trim();
        if !existing.is_empty() {
            tracing::debug!(user_id = %existing, "Loaded user id");
            return Ok(UserId::new(existing));
        }
    }

    let user_id = UserId::generate();
    store.set(USER_ID_KEY, user_id.as_str())?;
    tracing::info!(user_id = %user_id, "Generated new user id");
    Ok(user_id)
}

/// Identity store backed by a small JSON object on disk.
///
/// Writes go to a sibling temp file that is flushed to disk and then renamed
/// over the target, so a crash mid-write leaves the previous contents intact.
pub struct JsonFileIdentityStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::Identity(format!(
                    "failed to parse {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(map)?)?;
        // The rename must never expose an empty file
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl IdentityStore for JsonFileIdentityStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::Identity("identity store lock poisoned".to_string()))?;
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::Identity("identity store lock poisoned".to_string()))?;
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }
}

/// In-memory identity store (for testing)
#[derive(Default)]
pub struct MemoryIdentityStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| Error::Identity("identity store lock poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| Error::Identity("identity store lock poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
