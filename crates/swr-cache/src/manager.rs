//! The cache manager: TTL reads, stale-while-revalidate and single-flight
//! fetches over a pluggable [`Storage`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock, Timestamp};
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntryHeader, EntryInfo, Freshness};
use crate::error::{CacheError, FetchError};
use crate::flight::{Acquire, SingleFlight, Ticket};
use crate::pattern::KeyPattern;
use crate::stats::{CacheStats, StatsSnapshot};
use crate::storage::Storage;

/// How a [`CacheManager::get_or_fetch`] call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Fresh cache hit.
    Hit,
    /// Stale hit, served while a refresh runs in the background.
    Stale,
    /// Nothing usable was cached; this call fetched.
    Miss,
    /// Nothing usable was cached; this call reused a concurrent fetch.
    Joined,
}

impl CacheStatus {
    /// Whether the value came out of storage.
    pub fn is_from_cache(&self) -> bool {
        matches!(self, Self::Hit | Self::Stale)
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "HIT"),
            Self::Stale => write!(f, "STALE"),
            Self::Miss => write!(f, "MISS"),
            Self::Joined => write!(f, "JOINED"),
        }
    }
}

/// Value returned by [`CacheManager::get_or_fetch`].
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    /// The value.
    pub value: T,
    /// Whether it was served from the cache (fresh or stale).
    pub from_cache: bool,
    /// Detailed outcome.
    pub status: CacheStatus,
}

impl<T> Fetched<T> {
    fn new(value: T, status: CacheStatus) -> Self {
        Self {
            value,
            from_cache: status.is_from_cache(),
            status,
        }
    }

    /// Take the value.
    pub fn into_inner(self) -> T {
        self.value
    }
}

struct Inner<S, C> {
    storage: S,
    clock: C,
    config: CacheConfig,
    flights: SingleFlight,
    stats: CacheStats,
    last_stamp: AtomicU64,
}

/// Key-value cache with TTL expiry and stale-while-revalidate reads.
///
/// A `CacheManager` is a cheap handle: clones share storage, clock, in-flight
/// fetches and counters. Build one at startup and pass clones around.
///
/// Storage and serialization failures never reach callers. A failed write is
/// logged and dropped; a failed or undecodable read is a miss.
///
/// # Example
///
/// ```rust,ignore
/// use std::time::Duration;
/// use swr_cache::{CacheManager, FetchError, MemoryStorage};
///
/// let cache = CacheManager::new(MemoryStorage::new());
///
/// let issues = cache
///     .get_or_fetch(
///         "issues_filtered_12",
///         || async { load_issues().await.map_err(FetchError::new) },
///         Duration::from_secs(60),
///         Duration::from_secs(300),
///     )
///     .await?;
///
/// // After a write elsewhere:
/// cache.invalidate_pattern("issues_*").await;
/// ```
pub struct CacheManager<S, C = SystemClock> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for CacheManager<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, C> fmt::Debug for CacheManager<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.inner.config)
            .field("flights", &self.inner.flights)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> CacheManager<S, SystemClock> {
    /// Create a manager over `storage` using wall-clock time.
    pub fn new(storage: S) -> Self {
        Self::with_config(storage, SystemClock, CacheConfig::default())
    }
}

impl<S: Storage, C: Clock> CacheManager<S, C> {
    /// Create a manager with an explicit clock.
    pub fn with_clock(storage: S, clock: C) -> Self {
        Self::with_config(storage, clock, CacheConfig::default())
    }

    /// Create a manager with an explicit clock and configuration.
    pub fn with_config(storage: S, clock: C, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                clock,
                config,
                flights: SingleFlight::new(),
                stats: CacheStats::default(),
                last_stamp: AtomicU64::new(0),
            }),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The underlying storage.
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// The clock in use.
    pub fn clock(&self) -> &C {
        &self.inner.clock
    }

    /// Current counter values.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Whether a fetch for `key` is outstanding.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.flights.is_in_flight(key)
    }

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// `fresh_ttl` is recorded with the entry for inspection; freshness is
    /// always judged against the TTLs passed at read time.
    pub async fn set<T>(&self, key: &str, value: &T, fresh_ttl: Duration)
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(value) {
            Ok(json) => self.write_value(key, &json, fresh_ttl).await,
            Err(e) => warn!(key, error = %e, "cache value could not be serialized; write skipped"),
        }
    }

    /// Read `key` if it is no older than `ttl`.
    ///
    /// Expired and undecodable entries are removed as a side effect.
    pub async fn get<T>(&self, key: &str, ttl: Duration) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let (entry, bytes) = self.load::<T>(key).await?;
        if entry.age(self.now()) > ttl {
            debug!(key, "removing expired cache entry");
            self.remove_if_unchanged(key, &self.storage_key(key), &bytes).await;
            return None;
        }
        Some(entry.value)
    }

    /// Read `key`, fetching it when nothing usable is cached.
    ///
    /// - Fresh (age ≤ `fresh_ttl`): returned as is.
    /// - Stale (age ≤ `stale_ttl`): returned immediately; a background task
    ///   refetches and stores the result unless one is already running.
    ///   Background failures are logged and leave the stale entry in place.
    /// - Expired or absent: `fetch` runs now and its result is stored. If a
    ///   fetch for the key is already running, this call waits for it and
    ///   shares its result instead of fetching again.
    ///
    /// Only the last case can fail, with the fetch error.
    ///
    /// `fresh_ttl` must not exceed `stale_ttl`. Background refreshes are
    /// spawned on the current tokio runtime; outside one they are skipped.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        fresh_ttl: Duration,
        stale_ttl: Duration,
    ) -> Result<Fetched<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        if let Some((entry, _)) = self.load::<T>(key).await {
            match entry.freshness(self.now(), fresh_ttl, stale_ttl) {
                Freshness::Fresh => {
                    self.inner.stats.record_hit();
                    debug!(key, "cache hit");
                    return Ok(Fetched::new(entry.value, CacheStatus::Hit));
                }
                Freshness::Stale => {
                    self.inner.stats.record_stale_hit();
                    debug!(key, "serving stale cache entry");
                    self.revalidate(key, fetch, fresh_ttl);
                    return Ok(Fetched::new(entry.value, CacheStatus::Stale));
                }
                Freshness::Expired => debug!(key, "cache entry expired"),
            }
        }

        self.fetch_through(key, fetch, fresh_ttl).await
    }

    /// [`get_or_fetch`](Self::get_or_fetch) with the configured default TTLs.
    pub async fn get_or_fetch_default<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
    ) -> Result<Fetched<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let policy = self.inner.config.ttl_policy();
        self.get_or_fetch(key, fetch, policy.fresh, policy.stale).await
    }

    /// Delete `key`. Missing keys and storage failures are ignored.
    pub async fn remove(&self, key: &str) {
        self.remove_raw(&self.storage_key(key)).await;
    }

    /// All keys in this cache's namespace.
    ///
    /// Returns an empty list if storage cannot be listed.
    pub async fn keys(&self) -> Vec<String> {
        let raw = match self.inner.storage.list_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                self.inner.stats.record_storage_error();
                warn!(error = %e, "listing cache keys failed");
                return Vec::new();
            }
        };

        let namespace = self.inner.config.namespace.as_str();
        raw.into_iter()
            .filter_map(|k| k.strip_prefix(namespace).map(str::to_string))
            .collect()
    }

    /// Remove every key matching `glob` (`*` matches any run of characters).
    ///
    /// Returns the number of entries removed.
    pub async fn invalidate_pattern(&self, glob: &str) -> usize {
        let pattern = match KeyPattern::new(glob) {
            Ok(p) => p,
            Err(e) => {
                warn!(pattern = glob, error = %e, "invalid key pattern");
                return 0;
            }
        };

        let mut removed = 0;
        for key in self.keys().await {
            if pattern.matches(&key) && self.remove_raw(&self.storage_key(&key)).await {
                removed += 1;
            }
        }

        debug!(pattern = glob, removed, "invalidated cache keys");
        removed
    }

    /// Remove entries older than `hard_ttl`, and entries that no longer
    /// decode. Returns the number removed.
    pub async fn clear_expired(&self, hard_ttl: Duration) -> usize {
        let now = self.now();
        let mut removed = 0;

        for key in self.keys().await {
            let storage_key = self.storage_key(&key);
            let Some(bytes) = self.read_raw(&key, &storage_key).await else {
                continue;
            };

            let expired = match EntryHeader::decode(&bytes) {
                Ok(header) => now.saturating_since(header.stored_at) > hard_ttl,
                Err(e) => {
                    self.inner.stats.record_corrupt_entry();
                    warn!(key, error = %e, "sweeping undecodable cache entry");
                    true
                }
            };

            if expired && self.remove_if_unchanged(&key, &storage_key, &bytes).await {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "cleared expired cache entries");
        }
        removed
    }

    /// Remove every entry in this cache's namespace.
    pub async fn clear(&self) {
        if self.inner.config.namespace.is_empty() {
            if let Err(e) = self.inner.storage.clear().await {
                self.inner.stats.record_storage_error();
                warn!(error = %e, "clearing cache storage failed");
            }
            return;
        }

        for key in self.keys().await {
            self.remove_raw(&self.storage_key(&key)).await;
        }
    }

    /// Describe the entry under `key` without decoding its value.
    pub async fn inspect(&self, key: &str) -> Option<EntryInfo> {
        let storage_key = self.storage_key(key);
        let bytes = self.read_raw(key, &storage_key).await?;

        match EntryHeader::decode(&bytes) {
            Ok(header) => Some(EntryInfo {
                key: header.key,
                stored_at: header.stored_at,
                age: self.now().saturating_since(header.stored_at),
                ttl: header.ttl,
                size_bytes: bytes.len(),
            }),
            Err(e) => {
                self.discard_corrupt(key, &storage_key, &bytes, &e).await;
                None
            }
        }
    }

    /// Reset every counter to zero.
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    /// Run [`clear_expired`](Self::clear_expired) with the configured hard TTL
    /// every configured sweep interval.
    ///
    /// The task ends on its own once every manager handle is dropped; abort
    /// the returned handle to stop it sooner. A zero interval is treated as
    /// one millisecond.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval();
        let hard_ttl = self.inner.config.hard_ttl();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("cache dropped; sweeper exiting");
                    break;
                };
                CacheManager { inner }.clear_expired(hard_ttl).await;
            }
        })
    }

    fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    /// Write timestamp: never earlier than one already issued.
    fn stamp(&self) -> Timestamp {
        let now = self.now().as_millis();
        let previous = self.inner.last_stamp.fetch_max(now, Ordering::SeqCst);
        Timestamp::from_millis(previous.max(now))
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.config.namespace, key)
    }

    fn revalidate<T, F, Fut>(&self, key: &str, fetch: F, fresh_ttl: Duration)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key, "no async runtime available; background revalidation skipped");
            return;
        };

        let ticket = match self.inner.flights.acquire(key) {
            Acquire::Ticket(ticket) => ticket,
            Acquire::InFlight(_) => {
                debug!(key, "revalidation already in flight");
                return;
            }
        };

        self.inner.stats.record_revalidation();
        debug!(key, "starting background revalidation");

        let this = self.clone();
        runtime.spawn(async move {
            match fetch().await {
                Ok(value) => {
                    let json = shareable(ticket.key(), &value);
                    if let Some(json) = &json {
                        this.write_value(ticket.key(), json, fresh_ttl).await;
                    }
                    publish(ticket, json);
                }
                Err(e) => {
                    this.inner.stats.record_revalidation_failure();
                    warn!(key = ticket.key(), error = %e, "background revalidation failed; keeping stale entry");
                    ticket.complete(Err(e));
                }
            }
        });
    }

    async fn fetch_through<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        fresh_ttl: Duration,
    ) -> Result<Fetched<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let ticket = loop {
            match self.inner.flights.acquire(key) {
                Acquire::Ticket(ticket) => break ticket,
                Acquire::InFlight(flight) => {
                    debug!(key, "waiting on in-flight fetch");
                    match flight.wait().await {
                        Some(Ok(json)) => {
                            self.inner.stats.record_joined();
                            let value = serde_json::from_value((*json).clone())
                                .map_err(CacheError::Decode)?;
                            return Ok(Fetched::new(value, CacheStatus::Joined));
                        }
                        Some(Err(e)) => {
                            self.inner.stats.record_joined();
                            return Err(CacheError::Fetch(e));
                        }
                        None => debug!(key, "in-flight fetch abandoned; retrying"),
                    }
                }
            }
        };

        // A fetch may have landed between our read and acquiring the ticket.
        if let Some((entry, _)) = self.load::<T>(key).await {
            if entry.age(self.now()) <= fresh_ttl {
                self.inner.stats.record_hit();
                publish(ticket, shareable(key, &entry.value));
                return Ok(Fetched::new(entry.value, CacheStatus::Hit));
            }
        }

        self.inner.stats.record_miss();
        debug!(key, "cache miss; fetching");

        match fetch().await {
            Ok(value) => {
                let json = shareable(key, &value);
                if let Some(json) = &json {
                    self.write_value(key, json, fresh_ttl).await;
                }
                publish(ticket, json);
                Ok(Fetched::new(value, CacheStatus::Miss))
            }
            Err(e) => {
                self.inner.stats.record_fetch_failure();
                debug!(key, error = %e, "fetch failed");
                ticket.complete(Err(e.clone()));
                Err(CacheError::Fetch(e))
            }
        }
    }

    /// Decoded entry plus the bytes it was decoded from.
    async fn load<T>(&self, key: &str) -> Option<(CacheEntry<T>, Vec<u8>)>
    where
        T: DeserializeOwned,
    {
        let storage_key = self.storage_key(key);
        let bytes = self.read_raw(key, &storage_key).await?;

        match CacheEntry::<T>::decode(&bytes) {
            Ok(entry) => Some((entry, bytes)),
            Err(e) => {
                self.discard_corrupt(key, &storage_key, &bytes, &e).await;
                None
            }
        }
    }

    async fn read_raw(&self, key: &str, storage_key: &str) -> Option<Vec<u8>> {
        match self.inner.storage.read(storage_key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.inner.stats.record_storage_error();
                warn!(key, error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    async fn write_value(&self, key: &str, value: &serde_json::Value, ttl: Duration) {
        let entry = CacheEntry::new(key, value, self.stamp()).with_ttl(ttl);
        let bytes = match entry.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "cache entry could not be encoded; write skipped");
                return;
            }
        };

        if let Err(e) = self.inner.storage.write(&self.storage_key(key), bytes).await {
            self.inner.stats.record_storage_error();
            warn!(key, error = %e, "cache write failed");
        }
    }

    async fn discard_corrupt(
        &self,
        key: &str,
        storage_key: &str,
        bytes: &[u8],
        error: &serde_json::Error,
    ) {
        self.inner.stats.record_corrupt_entry();
        warn!(key, error = %error, "discarding undecodable cache entry");
        self.remove_if_unchanged(key, storage_key, bytes).await;
    }

    /// Remove `storage_key` only while it still holds `judged`. An entry
    /// written after `judged` was read is kept.
    async fn remove_if_unchanged(&self, key: &str, storage_key: &str, judged: &[u8]) -> bool {
        match self.read_raw(key, storage_key).await {
            Some(current) if current == judged => self.remove_raw(storage_key).await,
            Some(_) => {
                debug!(key, "cache entry rewritten since it was read; keeping it");
                false
            }
            None => false,
        }
    }

    /// Returns whether storage accepted the removal.
    async fn remove_raw(&self, storage_key: &str) -> bool {
        match self.inner.storage.remove(storage_key).await {
            Ok(()) => true,
            Err(e) => {
                self.inner.stats.record_storage_error();
                warn!(key = storage_key, error = %e, "cache remove failed");
                false
            }
        }
    }
}

/// Convert a fetched value into the form shared with waiting callers.
fn shareable<T: Serialize>(key: &str, value: &T) -> Option<Arc<serde_json::Value>> {
    match serde_json::to_value(value) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(key, error = %e, "fetched value could not be serialized; not cached");
            None
        }
    }
}

/// Hand a fetched value to waiters. Without a shareable form the ticket is
/// dropped instead, so waiters retry and fetch for themselves.
fn publish(ticket: Ticket, json: Option<Arc<serde_json::Value>>) {
    match json {
        Some(json) => ticket.complete(Ok(json)),
        None => drop(ticket),
    }
}
