//! Change Bus
//!
//! Process-wide (but explicitly constructed) registry of live upstream
//! change subscriptions.
//!
//! ## Architecture
//!
//! - One topic per resource name, holding the local watchers in
//!   registration order
//! - The first watcher of a resource spawns a pump task that opens the
//!   upstream subscription and delivers every message, in order, to the
//!   watchers current at delivery time
//! - The last watcher to leave aborts the pump, which drops the feed
//!   receiver and so closes the upstream subscription
//! - Watchers are told [`BusNotice::Subscribed`] once the upstream
//!   subscription is live, since anything read before then may already
//!   be out of date
//! - Upstream failures are reported to every current watcher as
//!   [`BusNotice::Failed`]; the bus never retries on its own

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ledgerly_core::{ChangeEvent, ResourceName, SubscriptionError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::remote::{ChangeFeed, FeedMessage};

/// What a watcher is told.
#[derive(Debug, Clone, PartialEq)]
pub enum BusNotice {
    /// The upstream subscription is live. Changes made before this point
    /// may not have been delivered.
    Subscribed,
    Change(ChangeEvent),
    /// The upstream subscription failed. Treat everything derived from the
    /// resource as stale and fall back to periodic refetch.
    Failed(SubscriptionError),
}

type Handler = Arc<dyn Fn(&BusNotice) + Send + Sync>;

/// Change bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Capacity hint handed to the feed for each upstream channel.
    pub feed_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { feed_buffer: 256 }
    }
}

enum Upstream {
    Open {
        pump_id: u64,
        task: JoinHandle<()>,
        live: bool,
    },
    Failed(SubscriptionError),
}

struct Topic {
    watchers: Vec<(u64, Handler)>,
    upstream: Upstream,
}

struct BusInner {
    feed: Arc<dyn ChangeFeed>,
    config: BusConfig,
    topics: Mutex<HashMap<ResourceName, Topic>>,
    next_id: AtomicU64,
}

/// Registry of upstream change subscriptions, at most one per resource.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl ChangeBus {
    pub fn new(feed: Arc<dyn ChangeFeed>, config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                feed,
                config,
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn with_defaults(feed: Arc<dyn ChangeFeed>) -> Self {
        Self::new(feed, BusConfig::default())
    }

    /// Register `handler` for change notices on `resource`.
    ///
    /// The first watcher of a resource opens the upstream subscription.
    /// Watchers joining a resource whose upstream already failed are told
    /// so immediately. Must be called from within a Tokio runtime.
    pub fn watch<H>(&self, resource: impl Into<ResourceName>, handler: H) -> WatchHandle
    where
        H: Fn(&BusNotice) + Send + Sync + 'static,
    {
        let resource = resource.into();
        let id = self.inner.next_id();
        let handler: Handler = Arc::new(handler);

        let already_failed = {
            let mut topics = self.inner.topics();
            match topics.get_mut(&resource) {
                Some(topic) => {
                    topic.watchers.push((id, Arc::clone(&handler)));
                    debug!(
                        resource = %resource,
                        watchers = topic.watchers.len(),
                        "Joined existing change subscription"
                    );
                    match &topic.upstream {
                        Upstream::Failed(err) => Some(err.clone()),
                        Upstream::Open { .. } => None,
                    }
                }
                None => {
                    let upstream = BusInner::open_upstream(&self.inner, &resource);
                    topics.insert(
                        resource.clone(),
                        Topic {
                            watchers: vec![(id, Arc::clone(&handler))],
                            upstream,
                        },
                    );
                    debug!(resource = %resource, "Opened change subscription");
                    None
                }
            }
        };

        if let Some(err) = already_failed {
            handler(&BusNotice::Failed(err));
        }

        WatchHandle {
            bus: Arc::downgrade(&self.inner),
            resource,
            id,
            disposed: AtomicBool::new(false),
        }
    }

    /// Reopen a failed upstream subscription that still has watchers.
    ///
    /// Returns false if the resource has no watchers or its upstream is
    /// still open. Retry cadence belongs to the caller.
    pub fn resubscribe(&self, resource: &ResourceName) -> bool {
        let mut topics = self.inner.topics();
        let Some(topic) = topics.get_mut(resource) else {
            return false;
        };
        if matches!(topic.upstream, Upstream::Open { .. }) || topic.watchers.is_empty() {
            return false;
        }
        topic.upstream = BusInner::open_upstream(&self.inner, resource);
        debug!(resource = %resource, "Reopened change subscription");
        true
    }

    /// Number of open upstream subscriptions for `resource`: 0 or 1.
    pub fn upstream_count(&self, resource: &ResourceName) -> usize {
        match self.inner.topics().get(resource) {
            Some(Topic {
                upstream: Upstream::Open { .. },
                ..
            }) => 1,
            _ => 0,
        }
    }

    pub fn watcher_count(&self, resource: &ResourceName) -> usize {
        self.inner
            .topics()
            .get(resource)
            .map_or(0, |topic| topic.watchers.len())
    }

    /// True once the upstream subscription for `resource` has been
    /// established and has not failed since.
    pub fn is_live(&self, resource: &ResourceName) -> bool {
        matches!(
            self.inner.topics().get(resource),
            Some(Topic {
                upstream: Upstream::Open { live: true, .. },
                ..
            })
        )
    }

    /// True if the upstream for `resource` failed and was not reopened.
    pub fn is_failed(&self, resource: &ResourceName) -> bool {
        matches!(
            self.inner.topics().get(resource),
            Some(Topic {
                upstream: Upstream::Failed(_),
                ..
            })
        )
    }

    pub fn watched_resources(&self) -> Vec<ResourceName> {
        let mut names: Vec<_> = self.inner.topics().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every topic and close every upstream subscription.
    ///
    /// Outstanding [`WatchHandle`]s stay valid; disposing them is a no-op.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.inner.topics().drain().collect();
        for (resource, topic) in drained {
            if let Upstream::Open { task, .. } = topic.upstream {
                task.abort();
            }
            debug!(resource = %resource, "Closed change subscription on shutdown");
        }
    }
}

impl BusInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // Only registry bookkeeping happens under this lock and handlers are
    // always invoked after it is released, so a poisoned guard is still
    // consistent.
    fn topics(&self) -> MutexGuard<'_, HashMap<ResourceName, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_upstream(this: &Arc<Self>, resource: &ResourceName) -> Upstream {
        let pump_id = this.next_id();
        let task = tokio::spawn(pump(
            Arc::downgrade(this),
            Arc::clone(&this.feed),
            resource.clone(),
            pump_id,
            this.config.feed_buffer,
        ));
        Upstream::Open {
            pump_id,
            task,
            live: false,
        }
    }

    /// Handlers of `resource` if `pump_id` is still its live pump.
    fn live_handlers(&self, resource: &ResourceName, pump_id: u64) -> Option<Vec<Handler>> {
        let topics = self.topics();
        let topic = topics.get(resource)?;
        match topic.upstream {
            Upstream::Open { pump_id: live, .. } if live == pump_id => Some(
                topic
                    .watchers
                    .iter()
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect(),
            ),
            _ => None,
        }
    }

    fn announce_live(&self, resource: &ResourceName, pump_id: u64) {
        let handlers = {
            let mut topics = self.topics();
            let Some(topic) = topics.get_mut(resource) else {
                return;
            };
            match &mut topic.upstream {
                Upstream::Open {
                    pump_id: current,
                    live,
                    ..
                } if *current == pump_id => *live = true,
                _ => return,
            }
            topic
                .watchers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect::<Vec<_>>()
        };
        debug!(
            resource = %resource,
            watchers = handlers.len(),
            "Change subscription live"
        );
        let notice = BusNotice::Subscribed;
        for handler in handlers {
            handler(&notice);
        }
    }

    fn deliver(&self, resource: &ResourceName, pump_id: u64, event: ChangeEvent) {
        let Some(handlers) = self.live_handlers(resource, pump_id) else {
            return;
        };
        debug!(
            resource = %resource,
            operation = event.operation.as_str(),
            watchers = handlers.len(),
            "Delivering change event"
        );
        let notice = BusNotice::Change(event);
        for handler in handlers {
            handler(&notice);
        }
    }

    fn fail(&self, resource: &ResourceName, pump_id: u64, err: SubscriptionError) {
        let handlers = {
            let mut topics = self.topics();
            let Some(topic) = topics.get_mut(resource) else {
                return;
            };
            match topic.upstream {
                Upstream::Open { pump_id: live, .. } if live == pump_id => {}
                _ => return,
            }
            topic.upstream = Upstream::Failed(err.clone());
            topic
                .watchers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect::<Vec<_>>()
        };
        warn!(
            resource = %resource,
            error = %err,
            watchers = handlers.len(),
            "Change subscription failed"
        );
        let notice = BusNotice::Failed(err);
        for handler in handlers {
            handler(&notice);
        }
    }

    fn unwatch(&self, resource: &ResourceName, id: u64) {
        let mut topics = self.topics();
        let Some(topic) = topics.get_mut(resource) else {
            return;
        };
        topic.watchers.retain(|(watcher, _)| *watcher != id);
        if !topic.watchers.is_empty() {
            debug!(
                resource = %resource,
                watchers = topic.watchers.len(),
                "Watcher left change subscription"
            );
            return;
        }
        if let Some(topic) = topics.remove(resource) {
            if let Upstream::Open { task, .. } = topic.upstream {
                task.abort();
            }
            debug!(resource = %resource, "Closed change subscription");
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        let topics = self.topics.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, topic) in topics.drain() {
            if let Upstream::Open { task, .. } = topic.upstream {
                task.abort();
            }
        }
    }
}

async fn pump(
    bus: Weak<BusInner>,
    feed: Arc<dyn ChangeFeed>,
    resource: ResourceName,
    pump_id: u64,
    buffer: usize,
) {
    let mut stream = match feed.subscribe(&resource, buffer).await {
        Ok(stream) => stream,
        Err(err) => {
            if let Some(inner) = bus.upgrade() {
                inner.fail(&resource, pump_id, err);
            }
            return;
        }
    };
    // Release our feed handle; the subscription lives in `stream`.
    drop(feed);
    match bus.upgrade() {
        Some(inner) => inner.announce_live(&resource, pump_id),
        None => return,
    }

    while let Some(message) = stream.recv().await {
        let Some(inner) = bus.upgrade() else {
            return;
        };
        match message {
            FeedMessage::Change(event) => inner.deliver(&resource, pump_id, event),
            FeedMessage::Dropped(err) => {
                inner.fail(&resource, pump_id, err);
                return;
            }
        }
    }

    if let Some(inner) = bus.upgrade() {
        let reason = "upstream closed the change stream".to_string();
        inner.fail(
            &resource,
            pump_id,
            SubscriptionError::StreamDropped {
                resource: resource.clone(),
                reason,
            },
        );
    }
}

/// Disposer returned by [`ChangeBus::watch`].
///
/// Disposal happens on [`dispose`](Self::dispose) or on drop, whichever
/// comes first; repeated or concurrent disposal is a no-op.
pub struct WatchHandle {
    bus: Weak<BusInner>,
    resource: ResourceName,
    id: u64,
    disposed: AtomicBool,
}

impl WatchHandle {
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            inner.unwatch(&self.resource, self.id);
        }
    }

    pub fn resource(&self) -> &ResourceName {
        &self.resource
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("resource", &self.resource)
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
