// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

//! Ad metadata per display context ("home", "channels", ...), served
//! stale-while-revalidate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AdCacheConfig;
use crate::images::ImageCache;
use crate::store::KeyValueStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdItem {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub image_url: String,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

#[async_trait]
pub trait AdSource: Send + Sync {
    async fn fetch_ads(&self, context: &str) -> Result<Vec<AdItem>, String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdMetadataSet {
    pub context_key: String,
    pub items: Vec<AdItem>,
    pub fetched_at: DateTime<Utc>,
}

impl AdMetadataSet {
    pub fn is_stale(&self, ttl: std::time::Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        age.to_std().map(|age| age > ttl).unwrap_or(false)
    }
}

#[derive(Default)]
struct AdState {
    sets: HashMap<String, AdMetadataSet>,
    refreshing: HashSet<String>,
}

struct Inner {
    config: AdCacheConfig,
    source: Arc<dyn AdSource>,
    store: Arc<dyn KeyValueStore>,
    images: Option<ImageCache>,
    state: Mutex<AdState>,
    /// Woken whenever an in-flight fetch finishes.
    refreshed: Notify,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct AdMetadataCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for AdMetadataCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdMetadataCache")
            .field("config", &self.inner.config)
            .field("contexts", &self.state().sets.len())
            .finish()
    }
}

impl AdMetadataCache {
    pub fn new(
        config: AdCacheConfig,
        source: Arc<dyn AdSource>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::build(config, source, store, None)
    }

    /// Same as [`AdMetadataCache::new`], but ad artwork is preloaded into
    /// `images` whenever a set is fetched.
    pub fn with_images(
        config: AdCacheConfig,
        source: Arc<dyn AdSource>,
        store: Arc<dyn KeyValueStore>,
        images: ImageCache,
    ) -> Self {
        Self::build(config, source, store, Some(images))
    }

    fn build(
        config: AdCacheConfig,
        source: Arc<dyn AdSource>,
        store: Arc<dyn KeyValueStore>,
        images: Option<ImageCache>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                store,
                images,
                state: Mutex::new(AdState::default()),
                refreshed: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, AdState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store_key(&self, context: &str) -> String {
        format!("{}{}", self.inner.config.key_prefix, context)
    }

    fn lookup(&self, context: &str) -> Option<AdMetadataSet> {
        if let Some(set) = self.state().sets.get(context) {
            return Some(set.clone());
        }

        let key = self.store_key(context);
        let raw = self.inner.store.get(&key)?;
        match serde_json::from_str::<AdMetadataSet>(&raw) {
            Ok(set) => {
                self.state().sets.insert(context.to_string(), set.clone());
                Some(set)
            }
            Err(e) => {
                warn!("Removing unreadable ad record for {}: {}", context, e);
                self.inner.store.remove(&key);
                None
            }
        }
    }

    /// Returns whatever is cached, fresh or stale, and never waits on the
    /// network. Stale or missing sets schedule a background refresh.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn get(&self, context: &str) -> Option<AdMetadataSet> {
        let cached = self.lookup(context);

        let needs_refresh = cached
            .as_ref()
            .map(|set| set.is_stale(self.inner.config.ttl()))
            .unwrap_or(true);
        if needs_refresh {
            self.refresh_in_background(context);
        }

        cached
    }

    /// Like [`AdMetadataCache::get`], but waits for the first fetch when
    /// nothing is cached yet. A fetch already in flight for `context` is
    /// awaited rather than duplicated. Fetch failures yield `None`.
    pub async fn load(&self, context: &str) -> Option<AdMetadataSet> {
        if let Some(set) = self.lookup(context) {
            if set.is_stale(self.inner.config.ttl()) {
                self.refresh_in_background(context);
            }
            return Some(set);
        }

        loop {
            let refreshed = self.inner.refreshed.notified();
            if self.inner.cancel.is_cancelled() {
                return None;
            }
            if self.state().refreshing.insert(context.to_string()) {
                break;
            }

            tokio::select! {
                _ = self.inner.cancel.cancelled() => return None,
                _ = refreshed => {}
            }
            if let Some(set) = self.lookup(context) {
                return Some(set);
            }
        }

        let result = self.refresh(context).await;
        self.refresh_finished(context);
        match result {
            Ok(set) => Some(set),
            Err(e) => {
                debug!("Ad fetch for {} failed: {}", context, e);
                None
            }
        }
    }

    fn refresh_in_background(&self, context: &str) {
        if self.inner.cancel.is_cancelled()
            || !self.state().refreshing.insert(context.to_string())
        {
            return;
        }

        let cache = self.clone();
        let context = context.to_string();
        tokio::spawn(async move {
            if let Err(e) = cache.refresh(&context).await {
                debug!("Background ad refresh for {} failed: {}", context, e);
            }
            cache.refresh_finished(&context);
        });
    }

    fn refresh_finished(&self, context: &str) {
        self.state().refreshing.remove(context);
        self.inner.refreshed.notify_waiters();
    }

    /// Fetches the set for `context` now and replaces the cached copy.
    pub async fn refresh(&self, context: &str) -> Result<AdMetadataSet, String> {
        let items = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err("ad cache disposed".to_string()),
            result = self.inner.source.fetch_ads(context) => result?,
        };

        if self.inner.cancel.is_cancelled() {
            return Err("ad cache disposed".to_string());
        }

        let set = AdMetadataSet {
            context_key: context.to_string(),
            items,
            fetched_at: Utc::now(),
        };

        match serde_json::to_string(&set) {
            Ok(value) => {
                if let Err(e) = self.inner.store.set(&self.store_key(context), &value) {
                    debug!("Dropping persistent ad write for {}: {}", context, e);
                }
            }
            Err(e) => warn!("Failed to encode ad set for {}: {}", context, e),
        }

        if let Some(images) = &self.inner.images {
            images.preload(set.items.iter().map(|item| item.image_url.as_str()));
        }

        debug!("Cached {} ads for {}", set.items.len(), context);
        self.state().sets.insert(context.to_string(), set.clone());
        Ok(set)
    }

    /// Forgets every cached set, in memory and persisted.
    pub fn clear(&self) -> usize {
        self.state().sets.clear();
        let mut removed = 0;
        for key in self.inner.store.keys() {
            if key.starts_with(self.inner.config.key_prefix.as_str()) {
                self.inner.store.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Cancels pending refreshes; their results are discarded.
    pub fn dispose(&self) {
        self.inner.cancel.cancel();
        let mut state = self.state();
        state.sets.clear();
        state.refreshing.clear();
    }
}
