//! Query cache with request coalescing.
//!
//! The cache is pull-based: invalidation only marks entries stale, and the
//! refetch happens on the next [`QueryCache::ensure_fresh`]. Entries nobody
//! looks at stay stale at no cost.
//!
//! Every entry carries an epoch that `write` and `invalidate` bump. A fetch
//! remembers the epoch it started under; if the epoch moved by the time it
//! lands, the result is older than something the cache has since been told,
//! and it must not be published as fresh.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ledgerly_core::{CacheKey, FetchError, ResourceName, Rows};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheStats, CacheStatus};

/// Configuration for the query cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound on a single fetch. A fetch that does not answer in time
    /// settles as [`FetchError::TimedOut`] instead of loading forever.
    /// `None` leaves timeouts entirely to the transport.
    pub fetch_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Some(Duration::from_secs(15)),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Disable the fetch timeout.
    pub fn without_fetch_timeout(mut self) -> Self {
        self.fetch_timeout = None;
        self
    }
}

type Outcome<V> = Option<Result<V, FetchError>>;

struct Slot<V> {
    entry: CacheEntry<V>,
    epoch: u64,
    inflight: Option<watch::Receiver<Outcome<V>>>,
    leases: usize,
    evict_on_settle: bool,
}

impl<V> Slot<V> {
    fn new(key: CacheKey) -> Self {
        Self {
            entry: CacheEntry::idle(key),
            epoch: 0,
            inflight: None,
            leases: 0,
            evict_on_settle: false,
        }
    }

    /// Bump the epoch and downgrade a fresh entry. Returns true if the
    /// entry was fresh or loading.
    fn invalidate(&mut self) -> bool {
        self.epoch += 1;
        match self.entry.status() {
            CacheStatus::Fresh => {
                self.entry.mark_stale();
                true
            }
            CacheStatus::Loading => true,
            CacheStatus::Idle | CacheStatus::Stale | CacheStatus::Error => false,
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

struct CacheInner<V> {
    slots: Mutex<HashMap<CacheKey, Slot<V>>>,
    counters: Counters,
    config: CacheConfig,
}

impl<V> CacheInner<V> {
    // Each mutation of a slot is completed before the guard is released,
    // so a poisoned table is still consistent.
    fn slots(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Plan<V> {
    Hit(V),
    Join(watch::Receiver<Outcome<V>>),
    Fetch {
        tx: watch::Sender<Outcome<V>>,
        rx: watch::Receiver<Outcome<V>>,
        epoch: u64,
    },
}

/// Cache of named query results, at most one entry and one in-flight fetch
/// per [`CacheKey`].
///
/// Cloning is cheap and yields a handle to the same table.
pub struct QueryCache<V = Rows> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slots: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                config,
            }),
        }
    }

    /// Create a query cache with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Current entry for `key`; `Idle` if the cache holds none.
    pub fn read(&self, key: &CacheKey) -> CacheEntry<V> {
        self.inner
            .slots()
            .get(key)
            .map(|slot| slot.entry.clone())
            .unwrap_or_else(|| CacheEntry::idle(key.clone()))
    }

    /// Return a fresh value for `key`, fetching it if needed.
    ///
    /// - `Fresh`: answered from the cache, `fetcher` is not called.
    /// - A fetch already in flight: joins it, `fetcher` is not called.
    /// - `Idle`, `Stale` or `Error`: moves to `Loading` and runs `fetcher`
    ///   exactly once.
    ///
    /// The fetch runs on its own task, so dropping this future does not
    /// cancel it for other waiters; the result still lands in the cache.
    /// Must be called from within a Tokio runtime.
    pub async fn ensure_fresh<F, Fut>(&self, key: &CacheKey, fetcher: F) -> Result<V, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let plan = {
            let mut slots = self.inner.slots();
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| Slot::new(key.clone()));
            let fresh = if slot.entry.is_fresh() {
                slot.entry.value().cloned()
            } else {
                None
            };
            // A sender that vanished without an outcome (panicking fetcher)
            // leaves nothing to join.
            let live = slot
                .inflight
                .as_ref()
                .filter(|rx| rx.has_changed().is_ok())
                .cloned();

            if let Some(value) = fresh {
                Plan::Hit(value)
            } else if let Some(rx) = live {
                Plan::Join(rx)
            } else {
                let (tx, rx) = watch::channel(None);
                slot.entry.begin_loading();
                slot.inflight = Some(rx.clone());
                Plan::Fetch {
                    tx,
                    rx,
                    epoch: slot.epoch,
                }
            }
        };

        match plan {
            Plan::Hit(value) => {
                Counters::bump(&self.inner.counters.hits, 1);
                Ok(value)
            }
            Plan::Join(rx) => {
                Counters::bump(&self.inner.counters.coalesced, 1);
                debug!(key = %key, "Joined in-flight fetch");
                Self::await_outcome(key, rx).await
            }
            Plan::Fetch { tx, rx, epoch } => {
                Counters::bump(&self.inner.counters.misses, 1);
                debug!(key = %key, "Fetching");
                let work = fetcher();
                self.spawn_fetch(key.clone(), epoch, work, tx);
                Self::await_outcome(key, rx).await
            }
        }
    }

    /// Mark `key` stale. Never fetches.
    ///
    /// Returns true if a fresh or loading entry was affected. A fetch in
    /// flight for the key will land as `Stale`.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let changed = self
            .inner
            .slots()
            .get_mut(key)
            .is_some_and(|slot| slot.invalidate());
        if changed {
            Counters::bump(&self.inner.counters.invalidations, 1);
            debug!(key = %key, "Invalidated cached query");
        }
        changed
    }

    /// Invalidate every entry derived from `resource`. Returns how many
    /// fresh or loading entries were affected.
    pub fn invalidate_resource(&self, resource: &ResourceName) -> usize {
        let changed = self
            .inner
            .slots()
            .values_mut()
            .filter(|slot| slot.entry.key().belongs_to(resource))
            .map(|slot| slot.invalidate())
            .filter(|changed| *changed)
            .count();
        Counters::bump(&self.inner.counters.invalidations, changed as u64);
        changed
    }

    /// Set `key` to `value` as `Fresh` without a fetch.
    ///
    /// A fetch still in flight for the key will not overwrite this value.
    /// A later `invalidate` still wins over it.
    pub fn write(&self, key: &CacheKey, value: V) {
        let mut slots = self.inner.slots();
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(key.clone()));
        slot.epoch += 1;
        slot.entry.set_fresh(value);
        debug!(key = %key, "Wrote cached query");
    }

    /// Register a consumer of `key`. The entry is reclaimed when the last
    /// lease is released and no fetch is in flight for it.
    pub fn lease(&self, key: &CacheKey) -> CacheLease<V> {
        let mut slots = self.inner.slots();
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(key.clone()));
        slot.leases += 1;
        slot.evict_on_settle = false;
        CacheLease {
            cache: self.clone(),
            key: key.clone(),
            released: AtomicBool::new(false),
        }
    }

    pub fn lease_count(&self, key: &CacheKey) -> usize {
        self.inner.slots().get(key).map_or(0, |slot| slot.leases)
    }

    /// Drop every entry that has no lease and no fetch in flight.
    pub fn sweep_unreferenced(&self) -> usize {
        let mut slots = self.inner.slots();
        let before = slots.len();
        slots.retain(|_, slot| slot.leases > 0 || slot.inflight.is_some());
        let removed = before - slots.len();
        Counters::bump(&self.inner.counters.evictions, removed as u64);
        if removed > 0 {
            debug!(removed, "Swept unreferenced cache entries");
        }
        removed
    }

    /// Keys currently held for `resource`.
    pub fn keys_for(&self, resource: &ResourceName) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self
            .inner
            .slots()
            .keys()
            .filter(|key| key.belongs_to(resource))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            invalidations: counters.invalidations.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
        }
    }

    fn spawn_fetch<Fut>(&self, key: CacheKey, epoch: u64, work: Fut, tx: watch::Sender<Outcome<V>>)
    where
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let cache = self.clone();
        let timeout = self.inner.config.fetch_timeout;
        tokio::spawn(async move {
            let outcome = run_fetch(&key.resource, work, timeout).await;
            cache.settle(&key, epoch, &outcome);
            tx.send_replace(Some(outcome));
        });
    }

    /// Publish a fetch result. Runs before waiters are woken so they observe
    /// the settled entry.
    fn settle(&self, key: &CacheKey, started_epoch: u64, outcome: &Result<V, FetchError>) {
        let mut slots = self.inner.slots();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        slot.inflight = None;
        let superseded = slot.epoch != started_epoch;
        let still_loading = slot.entry.is_loading();

        match outcome {
            Ok(value) if !superseded => slot.entry.set_fresh(value.clone()),
            Ok(value) if still_loading => {
                slot.entry.set_stale_value(value.clone());
                debug!(key = %key, "Fetch landed after an invalidation; kept stale");
            }
            // A write replaced the entry while the fetch was in flight.
            Ok(_) => {}
            Err(err) => {
                if still_loading {
                    slot.entry.set_error(err.clone());
                }
                warn!(key = %key, error = %err, "Fetch failed");
            }
        }

        if slot.evict_on_settle && slot.leases == 0 {
            slots.remove(key);
            Counters::bump(&self.inner.counters.evictions, 1);
            debug!(key = %key, "Reclaimed cache entry after fetch settled");
        }
    }

    fn release(&self, key: &CacheKey) {
        let mut slots = self.inner.slots();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        slot.leases = slot.leases.saturating_sub(1);
        if slot.leases > 0 {
            return;
        }
        if slot.inflight.is_some() {
            slot.evict_on_settle = true;
            return;
        }
        slots.remove(key);
        Counters::bump(&self.inner.counters.evictions, 1);
        debug!(key = %key, "Reclaimed cache entry");
    }

    async fn await_outcome(
        key: &CacheKey,
        mut rx: watch::Receiver<Outcome<V>>,
    ) -> Result<V, FetchError> {
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| {
            Err(FetchError::Aborted {
                resource: key.resource.clone(),
            })
        })
    }
}

impl<V> Default for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::with_defaults()
    }
}

async fn run_fetch<V, Fut>(
    resource: &ResourceName,
    work: Fut,
    timeout: Option<Duration>,
) -> Result<V, FetchError>
where
    V: Send + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
{
    let task = tokio::spawn(work);
    let abort = task.abort_handle();
    let joined = match timeout {
        Some(after) => match tokio::time::timeout(after, task).await {
            Ok(joined) => joined,
            Err(_) => {
                abort.abort();
                return Err(FetchError::TimedOut {
                    resource: resource.clone(),
                    after,
                });
            }
        },
        None => task.await,
    };
    joined.unwrap_or_else(|err| {
        warn!(resource = %resource, error = %err, "Fetch task did not complete");
        Err(FetchError::Aborted {
            resource: resource.clone(),
        })
    })
}

/// A consumer's claim on a cache entry, released on drop.
pub struct CacheLease<V>
where
    V: Clone + Send + Sync + 'static,
{
    cache: QueryCache<V>,
    key: CacheKey,
    released: AtomicBool,
}

impl<V> CacheLease<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Release now instead of on drop. Repeated calls are no-ops.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.cache.release(&self.key);
        }
    }
}

impl<V> Drop for CacheLease<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.release();
    }
}

impl<V> std::fmt::Debug for CacheLease<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLease")
            .field("key", &self.key)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}
