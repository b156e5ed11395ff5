//! Per-entity live query facade.
//!
//! Screens read an entity through an [`EntityQuery`]: it binds the entity's
//! resource to cache invalidation for as long as it lives, leases every key
//! it reads, and decodes rows into the caller's record type.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ledgerly_core::{CacheKey, FetchError, QueryParams, ResourceName, Rows};
use ledgerly_storage::{
    BindingGuard, CacheEntry, CacheLease, InvalidationBinder, Mutation, QueryCache, RemoteMutate,
    RemoteQuery,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::catalog::EntityDescriptor;

/// Live, cached view of one entity.
///
/// Dropping it releases its binding and its leases; entries no other
/// consumer holds are reclaimed.
pub struct EntityQuery<T> {
    descriptor: EntityDescriptor,
    resource: ResourceName,
    cache: QueryCache,
    binder: InvalidationBinder,
    query: Arc<dyn RemoteQuery>,
    mutate: Arc<dyn RemoteMutate>,
    degraded_refetch_interval: Duration,
    leases: Mutex<HashMap<CacheKey, CacheLease<Rows>>>,
    _binding: BindingGuard,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> EntityQuery<T> {
    /// Must be called from within a Tokio runtime.
    pub(crate) fn new(
        descriptor: EntityDescriptor,
        binder: InvalidationBinder,
        query: Arc<dyn RemoteQuery>,
        mutate: Arc<dyn RemoteMutate>,
        degraded_refetch_interval: Duration,
    ) -> Self {
        let resource = descriptor.resource_name();
        let binding = binder.bind(resource.clone());
        Self {
            descriptor,
            resource,
            cache: binder.cache().clone(),
            binder,
            query,
            mutate,
            degraded_refetch_interval,
            leases: Mutex::new(HashMap::new()),
            _binding: binding,
            _record: PhantomData,
        }
    }

    pub fn descriptor(&self) -> EntityDescriptor {
        self.descriptor
    }

    pub fn resource(&self) -> &ResourceName {
        &self.resource
    }

    pub fn key(&self, params: QueryParams) -> CacheKey {
        CacheKey::with_params(self.resource.clone(), params)
    }

    /// True once the resource's change stream is open. Reads taken before
    /// then are invalidated when it opens.
    pub fn is_live(&self) -> bool {
        self.binder.bus().is_live(&self.resource)
    }

    /// True while the resource's change stream is down.
    pub fn is_degraded(&self) -> bool {
        self.binder.is_degraded(&self.resource)
    }

    /// Rows matching `params`, from the cache if fresh.
    ///
    /// While the change stream is down, a fresh entry older than the
    /// degraded refetch interval is treated as stale.
    pub async fn list(&self, params: QueryParams) -> Result<Vec<T>, FetchError> {
        let key = self.key(params);
        self.hold(&key);

        if self.is_degraded() {
            let entry = self.cache.read(&key);
            let expired = entry
                .staleness()
                .is_some_and(|age| age >= self.degraded_refetch_interval);
            if entry.is_fresh() && expired {
                debug!(key = %key, "Refetching aged entry while change stream is down");
                self.cache.invalidate(&key);
            }
        }

        let query = Arc::clone(&self.query);
        let resource = key.resource.clone();
        let params = key.params.clone();
        let rows = self
            .cache
            .ensure_fresh(&key, move || async move { query.query(&resource, &params).await })
            .await?;
        self.decode(rows)
    }

    /// Current cache entry for `params`, without fetching.
    pub fn snapshot(&self, params: QueryParams) -> CacheEntry<Rows> {
        self.cache.read(&self.key(params))
    }

    /// Publish rows for `params` directly, e.g. from an optimistic update.
    pub fn write_rows(&self, params: QueryParams, rows: Rows) {
        let key = self.key(params);
        self.hold(&key);
        self.cache.write(&key, rows);
    }

    /// Send a mutation to the store and invalidate every cached query of
    /// the resource. Returns the rows the store reports as affected.
    pub async fn mutate(&self, mutation: Mutation) -> Result<Rows, FetchError> {
        let kind = mutation.kind();
        let affected = self.mutate.mutate(&self.resource, mutation).await?;
        let invalidated = self.cache.invalidate_resource(&self.resource);
        debug!(
            resource = %self.resource,
            kind,
            affected = affected.len(),
            invalidated,
            "Mutation applied"
        );
        Ok(affected)
    }

    /// Invalidate `params` and fetch it again.
    pub async fn refresh(&self, params: QueryParams) -> Result<Vec<T>, FetchError> {
        self.cache.invalidate(&self.key(params.clone()));
        self.list(params).await
    }

    /// Stop holding `params`. Returns false if it was not held.
    pub fn release(&self, params: QueryParams) -> bool {
        self.leases().remove(&self.key(params)).is_some()
    }

    pub fn held_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self.leases().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn hold(&self, key: &CacheKey) {
        let mut leases = self.leases();
        if !leases.contains_key(key) {
            let lease = self.cache.lease(key);
            leases.insert(key.clone(), lease);
        }
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheLease<Rows>>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decode(&self, rows: Rows) -> Result<Vec<T>, FetchError> {
        rows.into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()
            .map_err(|e| FetchError::Decode {
                resource: self.resource.clone(),
                reason: e.to_string(),
            })
    }
}

impl<T> std::fmt::Debug for EntityQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityQuery")
            .field("resource", &self.resource)
            .field("label", &self.descriptor.label)
            .finish_non_exhaustive()
    }
}
