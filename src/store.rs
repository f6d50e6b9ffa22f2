// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

//! Synchronous string key/value stores shared by the image and ad caches.
//!
//! Stores are capacity bounded and non-transactional. Writers are
//! last-writer-wins per key; TTL and eviction live in the callers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: usize, quota: usize },
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}

pub trait KeyValueStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str);
    fn keys(&self) -> Vec<String>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

/// In-process store, mainly for sessions without a cache directory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota: Some(quota),
        }
    }

    pub fn used_bytes(&self) -> usize {
        lock(&self.entries)
            .iter()
            .map(|(k, v)| entry_size(k, v))
            .sum()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);

        if let Some(quota) = self.quota {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| entry_size(k, v))
                .sum();
            let needed = others + entry_size(key, value);
            if needed > quota {
                return Err(StoreError::QuotaExceeded { needed, quota });
            }
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        lock(&self.entries).remove(key);
    }

    fn keys(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    value: String,
}

/// Directory-backed store: one JSON file per key, named by a hash of the key.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    quota: usize,
    // key -> accounted size
    index: Mutex<HashMap<String, usize>>,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(dir: P, quota: usize) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut index = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match fs::read_to_string(&path)
                .map_err(StoreError::from)
                .and_then(|s| serde_json::from_str::<StoredRecord>(&s).map_err(StoreError::from))
            {
                Ok(record) => {
                    let size = entry_size(&record.key, &record.value);
                    index.insert(record.key, size);
                }
                Err(e) => {
                    warn!("Dropping unreadable store file {}: {}", path.display(), e);
                    if let Err(e) = fs::remove_file(&path) {
                        debug!("Failed to remove store file {}: {}", path.display(), e);
                    }
                }
            }
        }

        debug!("Opened store at {} with {} entries", dir.display(), index.len());

        Ok(Self {
            dir,
            quota,
            index: Mutex::new(index),
        })
    }

    /// Opens the store under the user cache directory.
    pub fn open_default(quota: usize) -> Result<Self, StoreError> {
        let dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("iptv-core")
            .join("store");
        Self::open(dir, quota)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let hash = format!("{:x}", hasher.finalize())[..16].to_string();
        self.dir.join(format!("{}.json", hash))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        if !lock(&self.index).contains_key(key) {
            return None;
        }

        let path = self.path_for(key);
        let content = fs::read_to_string(&path).ok()?;
        let record: StoredRecord = serde_json::from_str(&content).ok()?;
        (record.key == key).then_some(record.value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut index = lock(&self.index);

        let others: usize = index
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, size)| *size)
            .sum();
        let size = entry_size(key, value);
        let needed = others + size;
        if needed > self.quota {
            return Err(StoreError::QuotaExceeded {
                needed,
                quota: self.quota,
            });
        }

        let record = StoredRecord {
            key: key.to_string(),
            value: value.to_string(),
        };
        fs::write(self.path_for(key), serde_json::to_string(&record)?)?;
        index.insert(key.to_string(), size);
        Ok(())
    }

    fn remove(&self, key: &str) {
        if lock(&self.index).remove(key).is_some() {
            let path = self.path_for(key);
            if let Err(e) = fs::remove_file(&path) {
                debug!("Failed to remove store file {}: {}", path.display(), e);
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        lock(&self.index).keys().cloned().collect()
    }
}
