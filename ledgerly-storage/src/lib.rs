//! Ledgerly Storage - Live Query Synchronization
//!
//! Keeps client-side query results consistent with a remote store that is
//! mutated out of band (other users, other tabs, database triggers).
//!
//! Three pieces, leaves first:
//! - [`ChangeBus`]: one upstream change subscription per watched resource,
//!   fanned out to every local watcher.
//! - [`QueryCache`]: cached query results with explicit status, coalesced
//!   fetches and reference-counted eviction.
//! - [`InvalidationBinder`]: turns bus notifications into cache
//!   invalidations.
//!
//! All three are explicitly constructed values; nothing here is a global.

pub mod bus;
pub mod cache;
pub mod remote;

pub use bus::{BusConfig, BusNotice, ChangeBus, WatchHandle};
pub use cache::{
    BindingGuard, CacheConfig, CacheEntry, CacheLease, CacheStats, CacheStatus,
    InvalidationBinder, QueryCache,
};
pub use remote::{
    feed_channel, ChangeFeed, FeedMessage, FeedSubscription, Mutation, RemoteMutate, RemoteQuery,
};
