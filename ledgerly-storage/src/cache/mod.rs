//! Query cache and its invalidation wiring.
//!
//! Staleness is explicit here. Every read returns a [`CacheEntry`] carrying
//! its [`CacheStatus`] and the time the value was last set, so a view can
//! keep showing the last known rows while it tells the user they are being
//! refreshed.
//!
//! # Example
//!
//! ```ignore
//! let cache: QueryCache = QueryCache::with_defaults();
//! let binder = InvalidationBinder::new(cache.clone(), bus);
//! let _binding = binder.bind("invoices");
//!
//! let key = CacheKey::new("invoices").with_param("status", "open");
//! let rows = cache.ensure_fresh(&key, || fetch_invoices(store, params)).await?;
//! ```

pub mod binder;
pub mod entry;
pub mod query_cache;

pub use binder::{BindingGuard, InvalidationBinder};
pub use entry::{CacheEntry, CacheStats, CacheStatus};
pub use query_cache::{CacheConfig, CacheLease, QueryCache};
