//! File-backed [`ConfigStore`].
//!
//! Keeps every key in memory and writes the whole map to a TOML file on
//! [`sync`](ConfigStore::sync).  The file is small (a handful of device
//! states) so rewriting it on each sync is fine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use spoke_core::ports::{ConfigError, ConfigStore};
use tracing::debug;

struct Entries {
    values: BTreeMap<String, Value>,
    dirty: bool,
}

pub struct FileConfigStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl FileConfigStore {
    /// Opens the store at `path`.  A missing file yields an empty store; the
    /// file is created on the first [`sync`](ConfigStore::sync).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file exists but cannot be read and
    /// [`ConfigError::Storage`] if it is not valid TOML.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| ConfigError::Storage(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = values.len(), "state store opened");
        Ok(Self {
            path,
            entries: Mutex::new(Entries { values, dirty: false }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for FileConfigStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.lock().values.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        // TOML has no null
        if value.is_null() {
            return Err(ConfigError::Storage(format!("cannot store null under '{key}'")));
        }
        let mut entries = self.lock();
        if entries.values.get(key) != Some(&value) {
            entries.values.insert(key.to_string(), value);
            entries.dirty = true;
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), ConfigError> {
        let mut entries = self.lock();
        if !entries.dirty {
            return Ok(());
        }
        let content = toml::to_string_pretty(&entries.values).map_err(|e| ConfigError::Storage(e.to_string()))?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, content)?;
        entries.dirty = false;
        debug!(path = %self.path.display(), "state store synced");
        Ok(())
    }
}
