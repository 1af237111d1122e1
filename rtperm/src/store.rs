//! Persistence for the "has asked before" registry
//!
//! The OS never tells an application whether it has shown the permission
//! dialog before, so the manager records it itself, one boolean per group.
//! Implement [`PermissionStore`] to back the registry with something other
//! than the provided JSON file or in-memory stores.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tempfile::NamedTempFile;
use thiserror::Error;

/// File name used by [`FilePermissionStore::default_for_app`]
pub const DEFAULT_STORE_FILE: &str = "asked_permissions.json";

/// Error type for permission store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access permission store: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse permission store: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Durable boolean key/value storage
///
/// Reads never fail: a missing or unreadable entry is `false`.
pub trait PermissionStore: Send + Sync {
    /// Read a flag, `false` when absent
    fn get_bool(&self, key: &str) -> bool;

    /// Write a flag and persist it before returning
    fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError>;

    /// Remove every flag
    fn clear(&self) -> Result<(), StoreError>;

    /// Snapshot of all stored flags, sorted by key
    fn entries(&self) -> Vec<(String, bool)>;
}

impl<T: PermissionStore + ?Sized> PermissionStore for Arc<T> {
    fn get_bool(&self, key: &str) -> bool {
        (**self).get_bool(key)
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        (**self).set_bool(key, value)
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }

    fn entries(&self) -> Vec<(String, bool)> {
        (**self).entries()
    }
}

// ============================================================================
// File-based Permission Store
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AskedFileData {
    version: u32,
    #[serde(default)]
    asked: BTreeMap<String, bool>,
}

impl AskedFileData {
    fn new() -> Self {
        Self {
            version: 1,
            asked: BTreeMap::new(),
        }
    }
}

/// JSON file store
///
/// The whole file is rewritten on every change so that a flag is on disk
/// before the permission dialog is launched. Writes go to a sibling temp file
/// that is renamed over the store, so the file is always complete. A file
/// that still fails to parse is moved aside to `<name>.corrupt` and the store
/// starts empty.
/// Default: `~/.config/<app>/asked_permissions.json`
pub struct FilePermissionStore {
    path: PathBuf,
    data: RwLock<AskedFileData>,
}

impl FilePermissionStore {
    /// Open (or lazily create) a store at the specified path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let data = if path.exists() {
            Self::load(&path)?
        } else {
            AskedFileData::new()
        };

        tracing::debug!(path = %path.display(), entries = data.asked.len(), "Opened asked-permission store");

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Open the store in the default location for an application
    pub fn default_for_app(app_name: &str) -> Result<Self, StoreError> {
        Self::new(Self::default_path(app_name))
    }

    /// Path used by [`default_for_app`](Self::default_for_app)
    pub fn default_path(app_name: &str) -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        config_dir.join(app_name).join(DEFAULT_STORE_FILE)
    }

    /// Get the store file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path an unreadable store file is moved to
    pub fn corrupt_path(&self) -> PathBuf {
        corrupt_path_for(&self.path)
    }

    fn load(path: &Path) -> Result<AskedFileData, StoreError> {
        let file = File::open(path)?;
        match serde_json::from_reader(BufReader::new(file)) {
            Ok(data) => Ok(data),
            Err(e) => {
                let aside = corrupt_path_for(path);
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "Unreadable asked-permission store, starting empty"
                );
                fs::rename(path, &aside)?;
                Ok(AskedFileData::new())
            }
        }
    }

    fn save(&self, data: &AskedFileData) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, data)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Apply a change to a copy, persist it, then publish it in memory
    fn update(&self, change: impl FnOnce(&mut AskedFileData)) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = data.clone();
        change(&mut updated);
        self.save(&updated)?;
        *data = updated;
        Ok(())
    }
}

fn corrupt_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".corrupt");
    path.with_file_name(name)
}

impl PermissionStore for FilePermissionStore {
    fn get_bool(&self, key: &str) -> bool {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.asked.get(key).copied().unwrap_or(false)
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        self.update(|data| {
            data.asked.insert(key.to_string(), value);
        })
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.update(|data| data.asked.clear())
    }

    fn entries(&self) -> Vec<(String, bool)> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.asked.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

impl std::fmt::Debug for FilePermissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePermissionStore")
            .field("path", &self.path)
            .finish()
    }
}

// ============================================================================
// In-Memory Permission Store
// ============================================================================

/// In-memory store for tests or session-only state
pub struct MemoryPermissionStore {
    data: RwLock<HashMap<String, bool>>,
}

impl MemoryPermissionStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored flags
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryPermissionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionStore for MemoryPermissionStore {
    fn get_bool(&self, key: &str) -> bool {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(key).copied().unwrap_or(false)
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.insert(key.to_string(), value);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn entries(&self) -> Vec<(String, bool)> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = data.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort();
        entries
    }
}

impl std::fmt::Debug for MemoryPermissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPermissionStore")
            .field("count", &self.len())
            .finish()
    }
}
