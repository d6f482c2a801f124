//! In-memory tiered cache with request coalescing.
//!
//! Entries carry a volatility tier that fixes their default TTL:
//!
//! | Tier        | Default TTL | Holds                              |
//! |-------------|-------------|------------------------------------|
//! | `Mutable`   | 5 minutes   | documents fetched by tag           |
//! | `Immutable` | 90 days     | documents fetched by digest        |
//! | `Token`     | 60 seconds  | auth tokens without a declared TTL |
//!
//! At most one fetch per key is in flight: [`TieredCache::get_or_fetch`]
//! installs a shared pending computation that concurrent callers attach to.
//! Values are written only when a fetch completes successfully.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::error::RegistryError;

/// Volatility class of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// Content addressed by something that can move (tags).
    Mutable,
    /// Content addressed by digest.
    Immutable,
    /// Authentication tokens.
    Token,
}

/// Configuration for the tiered cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL for [`CacheTier::Mutable`] entries. Zero disables storing them.
    pub mutable_ttl: Duration,

    /// TTL for [`CacheTier::Immutable`] entries. Zero disables storing them.
    pub immutable_ttl: Duration,

    /// TTL for tokens whose issuer declared no lifetime.
    pub token_ttl: Duration,

    /// Interval of the background expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mutable_ttl: Duration::from_secs(5 * 60),
            immutable_ttl: Duration::from_secs(90 * 24 * 60 * 60), // 90 days
            token_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Sets the mutable-tier TTL.
    #[must_use]
    pub const fn with_mutable_ttl(mut self, ttl: Duration) -> Self {
        self.mutable_ttl = ttl;
        self
    }

    /// Sets the immutable-tier TTL.
    #[must_use]
    pub const fn with_immutable_ttl(mut self, ttl: Duration) -> Self {
        self.immutable_ttl = ttl;
        self
    }

    /// Sets the default token TTL.
    #[must_use]
    pub const fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Sets the sweep interval.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Default TTL for a tier.
    #[must_use]
    pub const fn ttl_for(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::Mutable => self.mutable_ttl,
            CacheTier::Immutable => self.immutable_ttl,
            CacheTier::Token => self.token_ttl,
        }
    }
}

/// Identifies a cached payload: host, path or digest, and a variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Registry host.
    pub host: String,
    /// Request path, digest or scope.
    pub path: String,
    /// Distinguishes payloads sharing a path (accept kind, platform).
    pub variant: String,
}

impl CacheKey {
    /// Creates a key.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        path: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            variant: variant.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}#{}", self.host, self.path, self.variant)
    }
}

/// Where a value returned by [`TieredCache::get_or_fetch`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// Served from a live entry.
    Cache,
    /// This caller ran the fetch.
    Network,
    /// This caller attached to another caller's fetch.
    Coalesced,
}

struct Entry<V> {
    value: V,
    tier: CacheTier,
    expires_at: DateTime<Utc>,
}

type PendingFetch<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct State<V, E> {
    entries: HashMap<CacheKey, Entry<V>>,
    inflight: HashMap<CacheKey, (u64, PendingFetch<V, E>)>,
    next_fetch_id: u64,
}

impl<V: Clone, E> State<V, E> {
    fn lookup(&mut self, key: &CacheKey, now: DateTime<Utc>) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if now < entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&mut self, key: CacheKey, value: V, tier: CacheTier, now: DateTime<Utc>, ttl: Duration) {
        let Some(expires_at) = chrono::Duration::from_std(ttl)
            .ok()
            .filter(|_| !ttl.is_zero())
            .and_then(|ttl| now.checked_add_signed(ttl))
        else {
            self.entries.remove(&key);
            return;
        };
        self.entries.insert(
            key,
            Entry {
                value,
                tier,
                expires_at,
            },
        );
    }
}

struct Inner<V, E> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State<V, E>>,
}

/// In-memory cache with per-tier TTLs and single-flight fetches.
///
/// Cloning is cheap and clones share state.
pub struct TieredCache<V, E = RegistryError> {
    inner: Arc<Inner<V, E>>,
}

impl<V, E> Clone for TieredCache<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> fmt::Debug for TieredCache<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TieredCache")
            .field("config", &self.inner.config)
            .field("entries", &state.entries.len())
            .field("inflight", &state.inflight.len())
            .finish()
    }
}

impl<V, E> TieredCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a cache using the system clock.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a cache using the given clock.
    #[must_use]
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    inflight: HashMap::new(),
                    next_fetch_id: 0,
                }),
            }),
        }
    }

    /// Returns the cache configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns a live entry, purging it if expired.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = self.inner.clock.now();
        self.inner.state.lock().lookup(key, now)
    }

    /// Stores a value with its tier's default TTL.
    pub fn put(&self, key: CacheKey, value: V, tier: CacheTier) {
        self.put_with_ttl(key, value, tier, self.inner.config.ttl_for(tier));
    }

    /// Stores a value with an explicit TTL. A zero TTL stores nothing.
    pub fn put_with_ttl(&self, key: CacheKey, value: V, tier: CacheTier, ttl: Duration) {
        let now = self.inner.clock.now();
        self.inner.state.lock().store(key, value, tier, now, ttl);
    }

    /// Removes an entry and detaches any in-flight fetch for it.
    ///
    /// A detached fetch still completes for its callers but does not store.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut state = self.inner.state.lock();
        state.entries.remove(key);
        state.inflight.remove(key);
    }

    /// Removes all expired entries, returning how many were removed.
    pub fn invalidate_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| now < entry.expires_at);
        before - state.entries.len()
    }

    /// Removes every entry and detaches every in-flight fetch.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.inflight.clear();
    }

    /// Number of stored entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().entries.is_empty()
    }

    /// Number of stored entries in a tier.
    #[must_use]
    pub fn count_tier(&self, tier: CacheTier) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .filter(|e| e.tier == tier)
            .count()
    }

    /// Returns the cached value or runs `fetch`, coalescing concurrent callers.
    ///
    /// All callers attached to one fetch receive the same value or the same
    /// error. Only a successful result is stored, with the tier's TTL.
    ///
    /// # Errors
    ///
    /// Returns the fetch's error.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &CacheKey,
        tier: CacheTier,
        fetch: F,
    ) -> Result<(V, FetchSource), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(found) = self.lookup_or_attach(key) {
            return match found {
                Lookup::Hit(value) => Ok((value, FetchSource::Cache)),
                Lookup::Pending(pending) => pending.await.map(|v| (v, FetchSource::Coalesced)),
            };
        }

        // Build the future outside the lock, then install it unless another
        // caller won the race in between.
        let fetch = fetch();
        let (pending, source) = {
            let now = self.inner.clock.now();
            let mut state = self.inner.state.lock();
            if let Some(value) = state.lookup(key, now) {
                return Ok((value, FetchSource::Cache));
            }
            if let Some((_, pending)) = state.inflight.get(key) {
                (pending.clone(), FetchSource::Coalesced)
            } else {
                let id = state.next_fetch_id;
                state.next_fetch_id += 1;
                let pending = settle(Arc::downgrade(&self.inner), key.clone(), tier, id, fetch)
                    .boxed()
                    .shared();
                state.inflight.insert(key.clone(), (id, pending.clone()));
                (pending, FetchSource::Network)
            }
        };

        if source == FetchSource::Network {
            tracing::debug!(key = %key, "Cache miss, fetching");
        }
        pending.await.map(|v| (v, source))
    }

    fn lookup_or_attach(&self, key: &CacheKey) -> Option<Lookup<V, E>> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        if let Some(value) = state.lookup(key, now) {
            return Some(Lookup::Hit(value));
        }
        state
            .inflight
            .get(key)
            .map(|(_, pending)| Lookup::Pending(pending.clone()))
    }

    /// Spawns a task that purges expired entries every `sweep_interval`.
    ///
    /// The task ends when the last handle to the cache is dropped.
    #[must_use]
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = Self { inner }.invalidate_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired cache entries");
                }
            }
        })
    }
}

enum Lookup<V, E> {
    Hit(V),
    Pending(PendingFetch<V, E>),
}

async fn settle<V, E, Fut>(
    inner: Weak<Inner<V, E>>,
    key: CacheKey,
    tier: CacheTier,
    id: u64,
    fetch: Fut,
) -> Result<V, E>
where
    V: Clone,
    Fut: Future<Output = Result<V, E>>,
{
    let result = fetch.await;

    if let Some(inner) = inner.upgrade() {
        let now = inner.clock.now();
        let mut state = inner.state.lock();
        let ours = state.inflight.get(&key).is_some_and(|(owner, _)| *owner == id);
        if ours {
            state.inflight.remove(&key);
            if let Ok(value) = &result {
                let ttl = inner.config.ttl_for(tier);
                state.store(key, value.clone(), tier, now, ttl);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_with_clock() -> (TieredCache<String>, ManualClock) {
        let clock = ManualClock::default();
        let cache = TieredCache::with_clock(CacheConfig::default(), Arc::new(clock.clone()));
        (cache, clock)
    }

    fn key(path: &str) -> CacheKey {
        CacheKey::new("ghcr.io", path, "index")
    }

    #[test]
    fn test_put_then_get() {
        let (cache, _) = cache_with_clock();
        cache.put(key("/v2/a/manifests/1"), "doc".to_string(), CacheTier::Mutable);
        assert_eq!(cache.get(&key("/v2/a/manifests/1")).as_deref(), Some("doc"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.count_tier(CacheTier::Mutable), 1);
    }

    #[test]
    fn test_entry_expires_at_ttl() {
        let (cache, clock) = cache_with_clock();
        cache.put(key("/a"), "doc".to_string(), CacheTier::Mutable);

        clock.advance(chrono::Duration::seconds(299));
        assert!(cache.get(&key("/a")).is_some());

        clock.advance(chrono::Duration::seconds(1));
        assert!(cache.get(&key("/a")).is_none());
        assert!(cache.is_empty(), "expired entry purged on lookup");
    }

    #[test]
    fn test_tiers_have_distinct_ttls() {
        let (cache, clock) = cache_with_clock();
        cache.put(key("/mutable"), "m".to_string(), CacheTier::Mutable);
        cache.put(key("/immutable"), "i".to_string(), CacheTier::Immutable);
        cache.put(key("/token"), "t".to_string(), CacheTier::Token);

        clock.advance(chrono::Duration::seconds(61));
        assert!(cache.get(&key("/token")).is_none());
        assert!(cache.get(&key("/mutable")).is_some());

        clock.advance(chrono::Duration::days(1));
        assert!(cache.get(&key("/mutable")).is_none());
        assert!(cache.get(&key("/immutable")).is_some());

        clock.advance(chrono::Duration::days(90));
        assert!(cache.get(&key("/immutable")).is_none());
    }

    #[test]
    fn test_zero_ttl_stores_nothing() {
        let (cache, _) = cache_with_clock();
        cache.put(key("/a"), "old".to_string(), CacheTier::Mutable);
        cache.put_with_ttl(key("/a"), "new".to_string(), CacheTier::Mutable, Duration::ZERO);
        assert!(cache.get(&key("/a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_expired_counts() {
        let (cache, clock) = cache_with_clock();
        cache.put(key("/a"), "a".to_string(), CacheTier::Token);
        cache.put(key("/b"), "b".to_string(), CacheTier::Token);
        cache.put(key("/c"), "c".to_string(), CacheTier::Immutable);

        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(cache.invalidate_expired(), 2);
        assert_eq!(cache.len(), 1);

        cache.invalidate(&key("/c"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_fetch_caches_success() {
        let (cache, _) = cache_with_clock();
        let (value, source) = cache
            .get_or_fetch(&key("/a"), CacheTier::Immutable, || async {
                Ok::<_, RegistryError>("fetched".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "fetched");
        assert_eq!(source, FetchSource::Network);

        let (value, source) = cache
            .get_or_fetch(&key("/a"), CacheTier::Immutable, || async {
                Err::<String, _>(RegistryError::transient("ghcr.io", "should not run"))
            })
            .await
            .unwrap();
        assert_eq!(value, "fetched");
        assert_eq!(source, FetchSource::Cache);
    }

    #[tokio::test]
    async fn test_get_or_fetch_does_not_cache_errors() {
        let (cache, _) = cache_with_clock();
        let err = cache
            .get_or_fetch(&key("/a"), CacheTier::Mutable, || async {
                Err::<String, _>(RegistryError::transient("ghcr.io", "reset"))
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(cache.is_empty());

        let (value, source) = cache
            .get_or_fetch(&key("/a"), CacheTier::Mutable, || async {
                Ok::<_, RegistryError>("second".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "second");
        assert_eq!(source, FetchSource::Network);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let (cache, _) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&key("/a"), CacheTier::Mutable, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok::<_, RegistryError>("shared".to_string())
                    })
                    .await
            })
        };

        // Wait until the first fetch is installed
        while cache.inner.state.lock().inflight.is_empty() {
            tokio::task::yield_now().await;
        }

        let second = {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&key("/a"), CacheTier::Mutable, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, RegistryError>("duplicate".to_string())
                    })
                    .await
            })
        };

        tokio::task::yield_now().await;
        release_tx.send(()).unwrap();

        let (a, source_a) = first.await.unwrap().unwrap();
        let (b, source_b) = second.await.unwrap().unwrap();
        assert_eq!(a, "shared");
        assert_eq!(b, "shared");
        assert_eq!(source_a, FetchSource::Network);
        assert!(matches!(source_b, FetchSource::Coalesced | FetchSource::Cache));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.inner.state.lock().inflight.is_empty());
    }

    #[tokio::test]
    async fn test_coalesced_callers_share_error() {
        let (cache, _) = cache_with_clock();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&key("/a"), CacheTier::Mutable, move || async move {
                        let _ = release_rx.await;
                        Err::<String, _>(RegistryError::NotFound {
                            reference: "a".to_string(),
                        })
                    })
                    .await
            })
        };
        while cache.inner.state.lock().inflight.is_empty() {
            tokio::task::yield_now().await;
        }

        let second = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&key("/a"), CacheTier::Mutable, || async {
                        Ok::<_, RegistryError>("unused".to_string())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        release_tx.send(()).unwrap();

        let err_a = first.await.unwrap().unwrap_err();
        let err_b = second.await.unwrap().unwrap_err();
        assert_eq!(err_a, err_b);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_detaches_inflight_fetch() {
        let (cache, _) = cache_with_clock();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&key("/a"), CacheTier::Mutable, move || async move {
                        let _ = release_rx.await;
                        Ok::<_, RegistryError>("stale".to_string())
                    })
                    .await
            })
        };
        while cache.inner.state.lock().inflight.is_empty() {
            tokio::task::yield_now().await;
        }

        cache.invalidate(&key("/a"));
        release_tx.send(()).unwrap();

        let (value, _) = pending.await.unwrap().unwrap();
        assert_eq!(value, "stale");
        assert!(cache.get(&key("/a")).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_fetch_leaves_no_entry() {
        let (cache, _) = cache_with_clock();
        let task = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&key("/a"), CacheTier::Mutable, || async {
                        futures::future::pending::<()>().await;
                        Ok::<_, RegistryError>("never".to_string())
                    })
                    .await
            })
        };
        while cache.inner.state.lock().inflight.is_empty() {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;

        assert!(cache.get(&key("/a")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_entries() {
        let clock = ManualClock::default();
        let config = CacheConfig::default().with_sweep_interval(Duration::from_secs(1));
        let cache: TieredCache<String> = TieredCache::with_clock(config, Arc::new(clock.clone()));
        cache.put(key("/a"), "a".to_string(), CacheTier::Token);

        let sweeper = cache.spawn_sweeper();
        clock.advance(chrono::Duration::minutes(5));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(cache.is_empty());
        sweeper.abort();
    }

    proptest! {
        #[test]
        fn put_get_roundtrip(
            path in "/[a-z0-9/]{1,24}",
            value in ".{0,64}",
            ttl_secs in 1u64..1_000_000,
            elapsed in 0u64..1_000_000,
        ) {
            let (cache, clock) = cache_with_clock();
            cache.put_with_ttl(key(&path), value.clone(), CacheTier::Mutable, Duration::from_secs(ttl_secs));
            clock.advance(chrono::Duration::seconds(i64::try_from(elapsed).unwrap()));

            let got = cache.get(&key(&path));
            if elapsed < ttl_secs {
                prop_assert_eq!(got, Some(value));
            } else {
                prop_assert_eq!(got, None);
            }
        }
    }
}
