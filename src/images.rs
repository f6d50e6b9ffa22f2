// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

//! Two-tier cache for small remote images (channel logos, ad artwork).
//!
//! Lookups check the in-memory tier first, then the persistent
//! [`KeyValueStore`]. Misses are filled by background fetches that go through
//! a FIFO queue with a fixed number of concurrent slots. Per URL the cache
//! moves `absent -> loading -> cached`, or back to `absent` when a fetch fails;
//! failures are not remembered, so the next `preload` tries again.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ImageCacheConfig;
use crate::store::KeyValueStore;

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("image request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("image request returned HTTP {0}")]
    Status(u16),
    #[error("image fetch failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            max_bytes: 10 * 1024 * 1024,
        }
    }

    /// Responses larger than this are abandoned mid-download.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
            if body.len() > self.max_bytes {
                return Err(FetchError::Other(format!(
                    "{} is larger than {} bytes",
                    url, self.max_bytes
                )));
            }
        }
        let bytes = Bytes::from(body);

        Ok(FetchedImage {
            bytes,
            content_type,
        })
    }
}

/// What a caller renders for a cached image.
#[derive(Debug, Clone, PartialEq)]
pub enum ImagePayload {
    /// `data:` URI; also held in the persistent tier.
    Inline(String),
    /// Image too large to persist, kept in memory for this session only.
    Transient { content_type: String, bytes: Bytes },
}

impl ImagePayload {
    pub fn as_data_uri(&self) -> Option<&str> {
        match self {
            ImagePayload::Inline(uri) => Some(uri),
            ImagePayload::Transient { .. } => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedImage {
    data: String,
    /// Milliseconds since the Unix epoch.
    timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCacheStats {
    pub memory_entries: usize,
    pub persistent_entries: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub active_fetches: usize,
}

type Callback = Arc<dyn Fn(&ImagePayload) + Send + Sync>;

struct MemoryEntry {
    payload: ImagePayload,
    cached_at: i64,
}

#[derive(Default)]
struct State {
    memory: HashMap<String, MemoryEntry>,
    // queued or being fetched
    in_flight: HashSet<String>,
    queue: VecDeque<String>,
    active: usize,
    subscribers: HashMap<String, Vec<(u64, Callback)>>,
    next_subscriber: u64,
    disposed: bool,
}

struct Inner {
    config: ImageCacheConfig,
    store: Arc<dyn KeyValueStore>,
    fetcher: Arc<dyn ImageFetcher>,
    state: Mutex<State>,
}

/// Cheap to clone; clones share tiers, queue and subscribers.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCache")
            .field("config", &self.inner.config)
            .field("store", &self.inner.store)
            .field("stats", &self.stats())
            .finish()
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn is_expired(cached_at: i64, ttl: Duration) -> bool {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_sub(cached_at) > ttl_ms
}

impl ImageCache {
    pub fn new(
        config: ImageCacheConfig,
        store: Arc<dyn KeyValueStore>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                fetcher,
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store_key(&self, url: &str) -> String {
        format!("{}{}", self.inner.config.key_prefix, url)
    }

    /// Returns the cached payload without ever starting a fetch.
    pub fn get_cached(&self, url: &str) -> Option<ImagePayload> {
        let ttl = self.inner.config.ttl();

        {
            let mut state = self.state();
            if let Some(entry) = state.memory.get(url) {
                if !is_expired(entry.cached_at, ttl) {
                    return Some(entry.payload.clone());
                }
                debug!("Memory entry for {} expired", url);
                state.memory.remove(url);
            }
        }

        let key = self.store_key(url);
        let raw = self.inner.store.get(&key)?;

        let record: PersistedImage = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("Removing unreadable cache record for {}: {}", url, e);
                self.inner.store.remove(&key);
                return None;
            }
        };

        if is_expired(record.timestamp, ttl) {
            debug!("Persistent entry for {} expired, removing", url);
            self.inner.store.remove(&key);
            return None;
        }

        let payload = ImagePayload::Inline(record.data);
        self.state().memory.insert(
            url.to_string(),
            MemoryEntry {
                payload: payload.clone(),
                cached_at: record.timestamp,
            },
        );
        Some(payload)
    }

    /// Queues fetches for every URL that is neither cached nor in flight.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn preload<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for url in urls {
            let url = url.as_ref();
            if url.is_empty() || self.get_cached(url).is_some() {
                continue;
            }

            let mut state = self.state();
            if state.disposed || !state.in_flight.insert(url.to_string()) {
                continue;
            }
            state.queue.push_back(url.to_string());
        }

        self.pump();
    }

    fn pump(&self) {
        let limit = self.inner.config.max_concurrent_fetches.max(1);

        loop {
            let url = {
                let mut state = self.state();
                if state.disposed || state.active >= limit {
                    return;
                }
                let Some(url) = state.queue.pop_front() else {
                    return;
                };
                state.active += 1;
                url
            };

            let cache = self.clone();
            tokio::spawn(async move {
                cache.run_fetch(url).await;
            });
        }
    }

    async fn run_fetch(&self, url: String) {
        debug!("Fetching image {}", url);

        match self.inner.fetcher.fetch(&url).await {
            Ok(image) => {
                if let Some(payload) = self.store_fetched(&url, image) {
                    self.notify(&url, &payload);
                }
            }
            Err(e) => {
                debug!("Image fetch for {} failed: {}", url, e);
            }
        }

        {
            let mut state = self.state();
            state.active = state.active.saturating_sub(1);
            state.in_flight.remove(&url);
        }

        self.pump();
    }

    fn store_fetched(&self, url: &str, image: FetchedImage) -> Option<ImagePayload> {
        if self.state().disposed {
            return None;
        }

        let content_type = image
            .content_type
            .filter(|ct| ct.starts_with("image/"))
            .unwrap_or_else(|| "image/png".to_string());
        let cached_at = now_millis();

        let payload = if image.bytes.len() < self.inner.config.inline_threshold_bytes {
            let data = format!("data:{};base64,{}", content_type, STANDARD.encode(&image.bytes));
            let record = PersistedImage {
                data: data.clone(),
                timestamp: cached_at,
            };
            match serde_json::to_string(&record) {
                Ok(value) => self.persist(&self.store_key(url), &value),
                Err(e) => warn!("Failed to encode cache record for {}: {}", url, e),
            }
            ImagePayload::Inline(data)
        } else {
            debug!(
                "Image {} is {} bytes, keeping it memory-only",
                url,
                image.bytes.len()
            );
            ImagePayload::Transient {
                content_type,
                bytes: image.bytes,
            }
        };

        let mut state = self.state();
        state.memory.insert(
            url.to_string(),
            MemoryEntry {
                payload: payload.clone(),
                cached_at,
            },
        );
        Some(payload)
    }

    fn persist(&self, key: &str, value: &str) {
        let store = &self.inner.store;

        match store.set(key, value) {
            Ok(()) => {}
            Err(e) if e.is_quota_exceeded() => {
                let evicted = self.evict_oldest(self.inner.config.eviction_batch);
                debug!("Store full, evicted {} entries before retrying {}", evicted, key);
                if let Err(e) = store.set(key, value) {
                    debug!("Dropping persistent write for {}: {}", key, e);
                }
            }
            Err(e) => warn!("Persistent write for {} failed: {}", key, e),
        }
    }

    /// Removes up to `count` persisted images, oldest first.
    fn evict_oldest(&self, count: usize) -> usize {
        let store = &self.inner.store;
        let prefix = &self.inner.config.key_prefix;

        let mut entries: Vec<(i64, String)> = store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix.as_str()))
            .map(|k| {
                let timestamp = store
                    .get(&k)
                    .and_then(|raw| serde_json::from_str::<PersistedImage>(&raw).ok())
                    .map(|r| r.timestamp)
                    .unwrap_or(0);
                (timestamp, k)
            })
            .collect();
        entries.sort();

        let evicted = entries.len().min(count);
        for (_, key) in entries.into_iter().take(count) {
            store.remove(&key);
        }
        evicted
    }

    fn notify(&self, url: &str, payload: &ImagePayload) {
        let callbacks = self.state().subscribers.remove(url).unwrap_or_default();
        for (_, callback) in callbacks {
            callback(payload);
        }
    }

    /// Registers `callback` for `url`. Called immediately when already cached,
    /// otherwise held until the fetch resolves.
    pub fn subscribe<F>(&self, url: &str, callback: F) -> Subscription
    where
        F: Fn(&ImagePayload) + Send + Sync + 'static,
    {
        if let Some(payload) = self.get_cached(url) {
            callback(&payload);
            return Subscription::resolved(url);
        }

        let callback: Callback = Arc::new(callback);
        let id = {
            let mut state = self.state();
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state
                .subscribers
                .entry(url.to_string())
                .or_default()
                .push((id, callback.clone()));
            id
        };

        // A fetch may have landed between the miss and the registration.
        // Whoever removes the registration delivers the payload.
        if let Some(payload) = self.get_cached(url) {
            if remove_subscriber(&mut self.state(), url, id) {
                callback(&payload);
            }
            return Subscription::resolved(url);
        }

        self.preload([url]);

        Subscription {
            cache: Arc::downgrade(&self.inner),
            url: url.to_string(),
            id: Some(id),
        }
    }

    /// Removes every expired persistent entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let store = &self.inner.store;
        let ttl = self.inner.config.ttl();
        let mut purged = 0;

        for key in store.keys() {
            if !key.starts_with(self.inner.config.key_prefix.as_str()) {
                continue;
            }
            let stale = match store.get(&key) {
                Some(raw) => serde_json::from_str::<PersistedImage>(&raw)
                    .map(|r| is_expired(r.timestamp, ttl))
                    .unwrap_or(true),
                None => false,
            };
            if stale {
                store.remove(&key);
                purged += 1;
            }
        }

        purged
    }

    /// Drops both tiers. Fetches already running still finish.
    pub fn clear(&self) {
        self.state().memory.clear();
        for key in self.inner.store.keys() {
            if key.starts_with(self.inner.config.key_prefix.as_str()) {
                self.inner.store.remove(&key);
            }
        }
    }

    /// Stops the queue and drops memory state and subscribers. The persistent
    /// tier is left untouched.
    pub fn dispose(&self) {
        let mut state = self.state();
        state.disposed = true;
        let queued: Vec<String> = state.queue.drain(..).collect();
        for url in queued {
            state.in_flight.remove(&url);
        }
        state.subscribers.clear();
        state.memory.clear();
    }

    pub fn stats(&self) -> ImageCacheStats {
        let persistent_entries = self
            .inner
            .store
            .keys()
            .iter()
            .filter(|k| k.starts_with(self.inner.config.key_prefix.as_str()))
            .count();
        let state = self.state();
        ImageCacheStats {
            memory_entries: state.memory.len(),
            persistent_entries,
            in_flight: state.in_flight.len(),
            queued: state.queue.len(),
            active_fetches: state.active,
        }
    }
}

/// Handle returned by [`ImageCache::subscribe`].
#[must_use = "dropping a Subscription keeps the callback registered; call unsubscribe() to remove it"]
#[derive(Debug)]
pub struct Subscription {
    cache: Weak<Inner>,
    url: String,
    id: Option<u64>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let (Some(inner), Some(id)) = (self.cache.upgrade(), self.id) else {
            return;
        };
        let mut state = inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        remove_subscriber(&mut state, &self.url, id);
    }

    fn resolved(url: &str) -> Self {
        Self {
            cache: Weak::new(),
            url: url.to_string(),
            id: None,
        }
    }
}

/// Returns false when the callback was already drained by a notify.
fn remove_subscriber(state: &mut State, url: &str, id: u64) -> bool {
    let Some(callbacks) = state.subscribers.get_mut(url) else {
        return false;
    };
    let before = callbacks.len();
    callbacks.retain(|(cb_id, _)| *cb_id != id);
    let removed = callbacks.len() < before;
    if callbacks.is_empty() {
        state.subscribers.remove(url);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeFetcher {
        images: HashMap<String, usize>,
        calls: Mutex<HashMap<String, usize>>,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeFetcher {
        fn with(images: &[(&str, usize)]) -> Arc<Self> {
            Arc::new(Self {
                images: images.iter().map(|(u, n)| (u.to_string(), *n)).collect(),
                ..Default::default()
            })
        }

        fn calls(&self, url: &str) -> usize {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ImageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError> {
            *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            match self.images.get(url) {
                Some(size) => Ok(FetchedImage {
                    bytes: Bytes::from(vec![7u8; *size]),
                    content_type: Some("image/png".to_string()),
                }),
                None => Err(FetchError::Status(404)),
            }
        }
    }

    fn cache_with(
        fetcher: Arc<FakeFetcher>,
        store: Arc<dyn KeyValueStore>,
        config: ImageCacheConfig,
    ) -> ImageCache {
        ImageCache::new(config, store, fetcher)
    }

    async fn settle(cache: &ImageCache) {
        while cache.stats().in_flight > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn miss_then_hit_without_refetch() {
        let fetcher = FakeFetcher::with(&[("http://logos/a.png", 10 * 1024)]);
        let cache = cache_with(
            fetcher.clone(),
            Arc::new(MemoryStore::new()),
            ImageCacheConfig::default(),
        );

        assert!(cache.get_cached("http://logos/a.png").is_none());
        assert_eq!(fetcher.calls("http://logos/a.png"), 0);

        cache.preload(["http://logos/a.png"]);
        settle(&cache).await;

        let payload = cache.get_cached("http://logos/a.png").unwrap();
        assert!(
            payload
                .as_data_uri()
                .unwrap()
                .starts_with("data:image/png;base64,")
        );

        cache.preload(["http://logos/a.png"]);
        settle(&cache).await;
        assert_eq!(fetcher.calls("http://logos/a.png"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_is_retried_on_next_preload() {
        let fetcher = FakeFetcher::with(&[("imgA", 10 * 1024)]);
        let cache = cache_with(
            fetcher.clone(),
            Arc::new(MemoryStore::new()),
            ImageCacheConfig::default(),
        );

        cache.preload(["imgA", "imgB"]);
        settle(&cache).await;

        assert!(cache.get_cached("imgA").unwrap().as_data_uri().is_some());
        assert!(cache.get_cached("imgB").is_none());

        cache.preload(["imgB"]);
        settle(&cache).await;
        assert_eq!(fetcher.calls("imgB"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_limit_in_flight() {
        let urls: Vec<String> = (0..11).map(|i| format!("http://logos/{}.png", i)).collect();
        let images: Vec<(&str, usize)> = urls.iter().map(|u| (u.as_str(), 64)).collect();
        let fetcher = FakeFetcher::with(&images);
        let cache = cache_with(
            fetcher.clone(),
            Arc::new(MemoryStore::new()),
            ImageCacheConfig::default(),
        );

        cache.preload(&urls);
        let stats = cache.stats();
        assert_eq!(stats.active_fetches, 4);
        assert_eq!(stats.queued, 7);

        settle(&cache).await;

        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 4);
        for url in &urls {
            assert_eq!(fetcher.calls(url), 1);
            assert!(cache.get_cached(url).is_some());
        }
    }

    #[tokio::test]
    async fn expired_persistent_entry_is_a_miss_and_removed() {
        let store = Arc::new(MemoryStore::new());
        let eight_days_ago = now_millis() - 8 * 24 * 60 * 60 * 1000;
        let record = serde_json::json!({ "data": "data:image/png;base64,AA==", "timestamp": eight_days_ago });
        store
            .set("logo_cache_http://logos/old.png", &record.to_string())
            .unwrap();

        let cache = cache_with(
            FakeFetcher::with(&[]),
            store.clone(),
            ImageCacheConfig::default(),
        );

        assert!(cache.get_cached("http://logos/old.png").is_none());
        assert!(store.get("logo_cache_http://logos/old.png").is_none());
    }

    #[tokio::test]
    async fn persistent_hit_hydrates_memory() {
        let store = Arc::new(MemoryStore::new());
        let record = serde_json::json!({ "data": "data:image/png;base64,AA==", "timestamp": now_millis() });
        store
            .set("logo_cache_http://logos/b.png", &record.to_string())
            .unwrap();

        let cache = cache_with(
            FakeFetcher::with(&[]),
            store.clone(),
            ImageCacheConfig::default(),
        );

        assert_eq!(cache.stats().memory_entries, 0);
        assert_eq!(
            cache.get_cached("http://logos/b.png"),
            Some(ImagePayload::Inline("data:image/png;base64,AA==".to_string()))
        );
        assert_eq!(cache.stats().memory_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn large_images_stay_in_memory_only() {
        let store = Arc::new(MemoryStore::new());
        let config = ImageCacheConfig {
            inline_threshold_bytes: 100,
            ..Default::default()
        };
        let cache = cache_with(FakeFetcher::with(&[("big", 100)]), store.clone(), config);

        cache.preload(["big"]);
        settle(&cache).await;

        assert!(matches!(
            cache.get_cached("big"),
            Some(ImagePayload::Transient { ref bytes, .. }) if bytes.len() == 100
        ));
        assert!(store.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn quota_exceeded_evicts_oldest_then_writes() {
        let old_record = |age_hours: i64| {
            serde_json::json!({
                "data": "data:image/png;base64,AAAAAAAA",
                "timestamp": now_millis() - age_hours * 60 * 60 * 1000,
            })
            .to_string()
        };

        let sizing = MemoryStore::new();
        for i in 0..5 {
            sizing.set(&format!("logo_cache_old{}", i), &old_record(i + 1)).unwrap();
        }
        let store = Arc::new(MemoryStore::with_quota(sizing.used_bytes() + 20));
        for i in 0..5 {
            store.set(&format!("logo_cache_old{}", i), &old_record(i + 1)).unwrap();
        }

        let config = ImageCacheConfig {
            eviction_batch: 2,
            ..Default::default()
        };
        let cache = cache_with(FakeFetcher::with(&[("new", 16)]), store.clone(), config);

        cache.preload(["new"]);
        settle(&cache).await;

        // old4 and old3 are the oldest (5h and 4h).
        assert!(store.get("logo_cache_old4").is_none());
        assert!(store.get("logo_cache_old3").is_none());
        assert!(store.get("logo_cache_old0").is_some());
        assert!(store.get("logo_cache_new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn write_dropped_when_eviction_is_not_enough() {
        let store = Arc::new(MemoryStore::with_quota(32));
        let cache = cache_with(
            FakeFetcher::with(&[("new", 64)]),
            store.clone(),
            ImageCacheConfig::default(),
        );

        cache.preload(["new"]);
        settle(&cache).await;

        assert!(store.keys().is_empty());
        assert!(cache.get_cached("new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_are_notified_once_resolved() {
        let fetcher = FakeFetcher::with(&[("logo", 32)]);
        let cache = cache_with(
            fetcher.clone(),
            Arc::new(MemoryStore::new()),
            ImageCacheConfig::default(),
        );

        let hits = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let _kept = cache.subscribe("logo", move |payload| {
            assert!(payload.as_data_uri().is_some());
            h.fetch_add(1, Ordering::SeqCst);
        });
        let d = dropped.clone();
        let removed = cache.subscribe("logo", move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        removed.unsubscribe();

        settle(&cache).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        assert_eq!(fetcher.calls("logo"), 1);

        // Already cached: called back synchronously.
        let h = hits.clone();
        let _again = cache.subscribe("logo", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribe_during_fetch_completion_delivers_once() {
        let urls: Vec<String> = (0..32).map(|i| format!("http://logos/{}.png", i)).collect();
        let images: Vec<(&str, usize)> = urls.iter().map(|u| (u.as_str(), 16)).collect();
        let fetcher = FakeFetcher::with(&images);
        let cache = cache_with(
            fetcher.clone(),
            Arc::new(MemoryStore::new()),
            ImageCacheConfig::default(),
        );
        let hits: Arc<Vec<AtomicUsize>> = Arc::new(urls.iter().map(|_| AtomicUsize::new(0)).collect());

        cache.preload(&urls);
        let subscribers: Vec<_> = urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let cache = cache.clone();
                let hits = hits.clone();
                let url = url.clone();
                tokio::spawn(async move {
                    // Spread the registrations across the fetch completions.
                    tokio::time::sleep(Duration::from_millis(12 * i as u64)).await;
                    let _ = cache.subscribe(&url, move |_| {
                        hits[i].fetch_add(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for task in subscribers {
            task.await.unwrap();
        }
        settle(&cache).await;

        for (url, hit) in urls.iter().zip(hits.iter()) {
            assert_eq!(hit.load(Ordering::SeqCst), 1, "{}", url);
            assert_eq!(fetcher.calls(url), 1);
        }
        assert!(cache.state().subscribers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_drops_queue_and_memory() {
        let urls: Vec<String> = (0..8).map(|i| format!("u{}", i)).collect();
        let images: Vec<(&str, usize)> = urls.iter().map(|u| (u.as_str(), 8)).collect();
        let fetcher = FakeFetcher::with(&images);
        let cache = cache_with(
            fetcher.clone(),
            Arc::new(MemoryStore::new()),
            ImageCacheConfig::default(),
        );

        cache.preload(&urls);
        cache.dispose();
        assert_eq!(cache.stats().queued, 0);

        settle(&cache).await;
        assert_eq!(cache.stats().memory_entries, 0);
        assert_eq!(fetcher.calls("u7"), 0);
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = Arc::new(MemoryStore::new());
        let fresh = serde_json::json!({ "data": "data:x", "timestamp": now_millis() });
        let stale = serde_json::json!({ "data": "data:x", "timestamp": 0 });
        store.set("logo_cache_fresh", &fresh.to_string()).unwrap();
        store.set("logo_cache_stale", &stale.to_string()).unwrap();
        store.set("unrelated", "1").unwrap();

        let cache = cache_with(
            FakeFetcher::with(&[]),
            store.clone(),
            ImageCacheConfig::default(),
        );

        assert_eq!(cache.purge_expired(), 1);
        assert!(store.get("logo_cache_fresh").is_some());
        assert!(store.get("unrelated").is_some());
    }

    #[tokio::test]
    async fn http_fetcher_reads_body_and_content_type() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logo.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![1u8; 64]),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpImageFetcher::new(reqwest::Client::new());
        let image = fetcher
            .fetch(&format!("{}/logo.png", server.uri()))
            .await
            .unwrap();
        assert_eq!(image.bytes.len(), 64);
        assert_eq!(image.content_type.as_deref(), Some("image/png"));

        let err = fetcher
            .fetch(&format!("{}/missing.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(404)));

        let small = HttpImageFetcher::new(reqwest::Client::new()).with_max_bytes(16);
        let err = small
            .fetch(&format!("{}/logo.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Other(_)));
    }
}
