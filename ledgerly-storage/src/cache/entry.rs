//! Cache entries and statistics.
//!
//! A [`CacheEntry`] is a snapshot: reading one never observes a half-applied
//! transition, and holding one does not pin anything in the cache.

use chrono::Utc;
use ledgerly_core::{CacheKey, FetchError, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a cached query result.
///
/// Transitions: `Idle -> Loading -> {Fresh, Error}`, `Fresh -> Stale`
/// (invalidation), `{Stale, Error} -> Loading` (next fetch). `write` moves
/// any state to `Fresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CacheStatus {
    /// Never fetched.
    #[default]
    Idle,
    /// A fetch is in flight.
    Loading,
    Fresh,
    /// Invalidated since the last fetch; refetched on the next pull.
    Stale,
    /// The last fetch failed; retried on the next pull.
    Error,
}

impl CacheStatus {
    /// True if the next `ensure_fresh` must start a fetch.
    pub fn needs_fetch(self) -> bool {
        matches!(self, Self::Idle | Self::Stale | Self::Error)
    }
}

/// Snapshot of one cached query result.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    key: CacheKey,
    value: Option<V>,
    status: CacheStatus,
    last_updated: Option<Timestamp>,
    error: Option<FetchError>,
}

impl<V> CacheEntry<V> {
    /// An entry that has never been fetched.
    pub fn idle(key: CacheKey) -> Self {
        Self {
            key,
            value: None,
            status: CacheStatus::Idle,
            last_updated: None,
            error: None,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Last known value. Kept across `Stale`, `Loading` and `Error` so a
    /// view can keep showing it.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }

    pub fn status(&self) -> CacheStatus {
        self.status
    }

    pub fn last_updated(&self) -> Option<Timestamp> {
        self.last_updated
    }

    /// Error of the last failed fetch, set only in `Error`.
    pub fn error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    pub fn is_fresh(&self) -> bool {
        self.status == CacheStatus::Fresh
    }

    pub fn is_stale(&self) -> bool {
        self.status == CacheStatus::Stale
    }

    pub fn is_loading(&self) -> bool {
        self.status == CacheStatus::Loading
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Time since the value was last set, or `None` if it never was.
    pub fn staleness(&self) -> Option<Duration> {
        let updated = self.last_updated?;
        let now = Utc::now();
        if now > updated {
            Some((now - updated).to_std().unwrap_or(Duration::ZERO))
        } else {
            Some(Duration::ZERO)
        }
    }

    /// True if the value was set at or after `timestamp`.
    pub fn is_fresh_as_of(&self, timestamp: Timestamp) -> bool {
        self.last_updated.is_some_and(|updated| updated >= timestamp)
    }

    /// Map the value to a new type, keeping the metadata.
    pub fn map<U, F>(self, f: F) -> CacheEntry<U>
    where
        F: FnOnce(V) -> U,
    {
        CacheEntry {
            key: self.key,
            value: self.value.map(f),
            status: self.status,
            last_updated: self.last_updated,
            error: self.error,
        }
    }

    pub(crate) fn begin_loading(&mut self) {
        self.status = CacheStatus::Loading;
        self.error = None;
    }

    pub(crate) fn set_fresh(&mut self, value: V) {
        self.value = Some(value);
        self.status = CacheStatus::Fresh;
        self.last_updated = Some(Utc::now());
        self.error = None;
    }

    /// Store a value that is already known to be outdated.
    pub(crate) fn set_stale_value(&mut self, value: V) {
        self.value = Some(value);
        self.status = CacheStatus::Stale;
        self.last_updated = Some(Utc::now());
        self.error = None;
    }

    pub(crate) fn mark_stale(&mut self) {
        self.status = CacheStatus::Stale;
    }

    pub(crate) fn set_error(&mut self, error: FetchError) {
        self.status = CacheStatus::Error;
        self.error = Some(error);
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// `ensure_fresh` calls answered from a fresh entry.
    pub hits: u64,
    /// `ensure_fresh` calls that started a fetch.
    pub misses: u64,
    /// `ensure_fresh` calls that joined a fetch already in flight.
    pub coalesced: u64,
    /// Entries moved to `Stale` (or flagged while loading).
    pub invalidations: u64,
    /// Entries reclaimed after losing their last consumer.
    pub evictions: u64,
    /// Number of entries currently held.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0). Coalesced calls count as hits.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.coalesced;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}
