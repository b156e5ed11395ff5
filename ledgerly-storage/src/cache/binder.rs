//! Wiring from change notices to cache invalidation.
//!
//! A binding is reference counted per resource: the first consumer opens a
//! bus watch, later consumers share it, and the last one to leave disposes
//! it. Cached queries are invalidated again once the upstream goes live,
//! so reads taken before that point cannot stay fresh. While a resource's
//! upstream is failed the binding is degraded, and consumers are expected
//! to fall back to periodic refetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ledgerly_core::{ResourceName, Rows};
use tracing::{debug, info, warn};

use super::query_cache::QueryCache;
use crate::bus::{BusNotice, ChangeBus, WatchHandle};

struct Binding {
    generation: u64,
    consumers: usize,
    watch: WatchHandle,
    degraded: Arc<AtomicBool>,
}

struct BinderInner<V> {
    cache: QueryCache<V>,
    bus: ChangeBus,
    bindings: Mutex<HashMap<ResourceName, Binding>>,
    next_generation: AtomicU64,
}

impl<V> BinderInner<V> {
    fn bindings(&self) -> MutexGuard<'_, HashMap<ResourceName, Binding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

trait Unbind: Send + Sync {
    fn unbind(&self, resource: &ResourceName, generation: u64);
}

impl<V> Unbind for BinderInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn unbind(&self, resource: &ResourceName, generation: u64) {
        let released = {
            let mut bindings = self.bindings();
            let Some(binding) = bindings.get_mut(resource) else {
                return;
            };
            // The guard's binding was torn down and replaced.
            if binding.generation != generation {
                return;
            }
            binding.consumers = binding.consumers.saturating_sub(1);
            if binding.consumers > 0 {
                None
            } else {
                bindings.remove(resource)
            }
        };
        // Disposing talks to the bus; keep it outside our lock.
        if let Some(binding) = released {
            binding.watch.dispose();
            debug!(resource = %resource, "Released invalidation binding");
        }
    }
}

/// Keeps a [`QueryCache`] consistent with upstream change notices.
///
/// Any change on a bound resource invalidates every cached query derived
/// from it. Invalidation never fetches; entries refetch on their next pull.
pub struct InvalidationBinder<V = Rows> {
    inner: Arc<BinderInner<V>>,
}

impl<V> Clone for InvalidationBinder<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> InvalidationBinder<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(cache: QueryCache<V>, bus: ChangeBus) -> Self {
        Self {
            inner: Arc::new(BinderInner {
                cache,
                bus,
                bindings: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn cache(&self) -> &QueryCache<V> {
        &self.inner.cache
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.inner.bus
    }

    /// Keep cached queries of `resource` invalidated on upstream change
    /// for as long as the returned guard lives.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(&self, resource: impl Into<ResourceName>) -> BindingGuard {
        let resource = resource.into();
        let mut bindings = self.inner.bindings();
        let generation = match bindings.get_mut(&resource) {
            Some(binding) => {
                binding.consumers += 1;
                binding.generation
            }
            None => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let degraded = Arc::new(AtomicBool::new(false));
                let watch = self.inner.bus.watch(
                    resource.clone(),
                    invalidation_handler(
                        self.inner.cache.clone(),
                        resource.clone(),
                        Arc::clone(&degraded),
                    ),
                );
                bindings.insert(
                    resource.clone(),
                    Binding {
                        generation,
                        consumers: 1,
                        watch,
                        degraded,
                    },
                );
                debug!(resource = %resource, "Bound resource to cache invalidation");
                generation
            }
        };
        drop(bindings);
        let owner: Arc<dyn Unbind> = self.inner.clone();
        BindingGuard {
            owner: Arc::downgrade(&owner),
            resource,
            generation,
            released: AtomicBool::new(false),
        }
    }

    /// True if the upstream for `resource` has failed since it was bound
    /// (or last recovered).
    pub fn is_degraded(&self, resource: &ResourceName) -> bool {
        self.inner
            .bindings()
            .get(resource)
            .is_some_and(|binding| binding.degraded.load(Ordering::Acquire))
    }

    pub fn degraded_resources(&self) -> Vec<ResourceName> {
        let mut resources: Vec<_> = self
            .inner
            .bindings()
            .iter()
            .filter(|(_, binding)| binding.degraded.load(Ordering::Acquire))
            .map(|(resource, _)| resource.clone())
            .collect();
        resources.sort();
        resources
    }

    pub fn consumer_count(&self, resource: &ResourceName) -> usize {
        self.inner
            .bindings()
            .get(resource)
            .map_or(0, |binding| binding.consumers)
    }

    pub fn bound_resources(&self) -> Vec<ResourceName> {
        let mut resources: Vec<_> = self.inner.bindings().keys().cloned().collect();
        resources.sort();
        resources
    }

    /// Tear down every binding regardless of outstanding guards. Guards
    /// released afterwards are no-ops.
    pub fn unbind_all(&self) -> usize {
        let drained: Vec<_> = self.inner.bindings().drain().collect();
        let count = drained.len();
        for (resource, binding) in drained {
            binding.watch.dispose();
            debug!(resource = %resource, "Dropped invalidation binding");
        }
        count
    }

    /// Reopen a failed upstream for `resource`.
    ///
    /// Cached queries of the resource are invalidated now and again once
    /// the new stream is live, since changes made while it was down were
    /// never seen. Returns false if the
    /// resource is not bound or its upstream was healthy.
    pub fn recover(&self, resource: &ResourceName) -> bool {
        let degraded = match self.inner.bindings().get(resource) {
            Some(binding) => Arc::clone(&binding.degraded),
            None => return false,
        };
        if !self.inner.bus.resubscribe(resource) {
            return false;
        }
        degraded.store(false, Ordering::Release);
        let invalidated = self.inner.cache.invalidate_resource(resource);
        info!(resource = %resource, invalidated, "Recovered change subscription");
        true
    }
}

fn invalidation_handler<V>(
    cache: QueryCache<V>,
    resource: ResourceName,
    degraded: Arc<AtomicBool>,
) -> impl Fn(&BusNotice) + Send + Sync + 'static
where
    V: Clone + Send + Sync + 'static,
{
    move |notice: &BusNotice| match notice {
        BusNotice::Subscribed => {
            degraded.store(false, Ordering::Release);
            let invalidated = cache.invalidate_resource(&resource);
            debug!(resource = %resource, invalidated, "Change subscription live");
        }
        BusNotice::Change(event) => {
            degraded.store(false, Ordering::Release);
            let invalidated = cache.invalidate_resource(&resource);
            debug!(
                resource = %resource,
                operation = event.operation.as_str(),
                invalidated,
                "Change received"
            );
        }
        BusNotice::Failed(err) => {
            degraded.store(true, Ordering::Release);
            let invalidated = cache.invalidate_resource(&resource);
            warn!(
                resource = %resource,
                error = %err,
                invalidated,
                "Change subscription failed; falling back to periodic refetch"
            );
        }
    }
}

/// Consumer claim on an invalidation binding, released on drop.
pub struct BindingGuard {
    owner: Weak<dyn Unbind>,
    resource: ResourceName,
    generation: u64,
    released: AtomicBool,
}

impl BindingGuard {
    pub fn resource(&self) -> &ResourceName {
        &self.resource
    }

    /// Release now instead of on drop. Repeated calls are no-ops.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.unbind(&self.resource, self.generation);
        }
    }
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for BindingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingGuard")
            .field("resource", &self.resource)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}
