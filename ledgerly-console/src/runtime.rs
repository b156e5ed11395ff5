//! Console runtime wiring.
//!
//! [`Console`] owns one change bus, one query cache and one invalidation
//! binder for the whole process, and hands out [`EntityQuery`] facades and
//! navigation decisions built on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ledgerly_access::{AccessGate, IdentitySource, RoleResolution, RoleResolver, RoleStore};
use ledgerly_core::{ConfigError, Identity};
use ledgerly_storage::{
    ChangeBus, ChangeFeed, InvalidationBinder, QueryCache, RemoteMutate, RemoteQuery,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::catalog::EntityDescriptor;
use crate::config::ConsoleConfig;
use crate::entity::EntityQuery;
use crate::guard::{Navigation, RouteGuard};

/// The remote collaborators the console talks to.
#[derive(Clone)]
pub struct RemoteStore {
    pub query: Arc<dyn RemoteQuery>,
    pub mutate: Arc<dyn RemoteMutate>,
    pub feed: Arc<dyn ChangeFeed>,
    pub identity: Arc<dyn IdentitySource>,
    pub roles: Arc<dyn RoleStore>,
}

impl RemoteStore {
    /// Bundle a backend that serves queries, mutations, change streams and
    /// identity, with a separate role store.
    pub fn new<S>(backend: Arc<S>, roles: Arc<dyn RoleStore>) -> Self
    where
        S: RemoteQuery + RemoteMutate + ChangeFeed + IdentitySource + 'static,
    {
        Self {
            query: backend.clone(),
            mutate: backend.clone(),
            feed: backend.clone(),
            identity: backend,
            roles,
        }
    }
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore").finish_non_exhaustive()
    }
}

/// A running console.
pub struct Console {
    config: ConsoleConfig,
    store: RemoteStore,
    binder: InvalidationBinder,
    resolver: RoleResolver,
    route_guard: RouteGuard,
    gates: Mutex<HashMap<String, AccessGate>>,
}

impl Console {
    /// Validate `config` and wire the runtime.
    pub fn start(config: ConsoleConfig, store: RemoteStore) -> Result<Self, ConfigError> {
        config.validate()?;

        let bus = ChangeBus::new(Arc::clone(&store.feed), config.bus_config());
        let cache = QueryCache::new(config.cache_config());
        let binder = InvalidationBinder::new(cache, bus);
        let resolver = RoleResolver::new(Arc::clone(&store.roles));
        let route_guard = RouteGuard::from_config(&config);

        info!(
            routes = config.routes.len(),
            fetch_timeout_ms = config.cache.fetch_timeout_ms,
            block_degraded = config.access.block_degraded,
            "Console started"
        );

        Ok(Self {
            config,
            store,
            binder,
            resolver,
            route_guard,
            gates: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn cache(&self) -> &QueryCache {
        self.binder.cache()
    }

    pub fn bus(&self) -> &ChangeBus {
        self.binder.bus()
    }

    pub fn binder(&self) -> &InvalidationBinder {
        &self.binder
    }

    pub fn route_guard(&self) -> &RouteGuard {
        &self.route_guard
    }

    /// Live query facade for `descriptor`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn entity<T: DeserializeOwned>(&self, descriptor: EntityDescriptor) -> EntityQuery<T> {
        EntityQuery::new(
            descriptor,
            self.binder.clone(),
            Arc::clone(&self.store.query),
            Arc::clone(&self.store.mutate),
            self.config.degraded_refetch_interval(),
        )
    }

    /// Resolve whoever is signed in right now.
    pub async fn current_resolution(&self) -> RoleResolution {
        self.resolver
            .resolve_current(self.store.identity.as_ref())
            .await
    }

    /// Decide a navigation to `path` for the current user.
    ///
    /// Each path keeps its gate between calls; the gate only re-decides
    /// when the resolution differs from the one it last settled on.
    pub async fn guard(&self, path: &str) -> Navigation {
        let resolution = self.current_resolution().await;
        let state = {
            let mut gates = self.gates();
            let gate = gates
                .entry(path.to_string())
                .or_insert_with(|| self.route_guard.gate_for(path));
            gate.settle(resolution)
        };
        self.route_guard.navigate(path, state)
    }

    /// Report a sign-in or sign-out. Gates that settled on a different
    /// identity return to loading; returns how many did.
    pub fn observe_identity(&self, identity: &Identity) -> usize {
        let mut reset = 0;
        for gate in self.gates().values_mut() {
            let was_terminal = gate.state().is_terminal();
            if was_terminal && !gate.observe_identity(identity).is_terminal() {
                reset += 1;
            }
        }
        debug!(reset, "Observed identity change");
        reset
    }

    /// Return every gate to loading, e.g. after a role grant changed.
    pub fn reset_gates(&self) {
        for gate in self.gates().values_mut() {
            gate.reset();
        }
    }

    /// Try to reopen every degraded change stream. Returns how many
    /// recovered.
    pub fn recover_degraded(&self) -> usize {
        self.binder
            .degraded_resources()
            .iter()
            .filter(|resource| self.binder.recover(resource))
            .count()
    }

    /// Close every change stream and drop cached entries nobody holds.
    pub fn shutdown(&self) {
        let unbound = self.binder.unbind_all();
        self.binder.bus().shutdown();
        let reclaimed = self.binder.cache().sweep_unreferenced();
        self.gates().clear();
        info!(unbound, reclaimed, "Console shut down");
    }

    fn gates(&self) -> MutexGuard<'_, HashMap<String, AccessGate>> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("route_guard", &self.route_guard)
            .field("bound", &self.binder.bound_resources())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CLIENTS;
    use ledgerly_core::{QueryParams, Role};
    use ledgerly_test_utils::fixtures::{identity_id, seeded_store};
    use ledgerly_test_utils::{InMemoryRemoteStore, MockRoleStore};

    fn console(store: &Arc<InMemoryRemoteStore>, roles: MockRoleStore) -> Console {
        let remote = RemoteStore::new(store.clone(), Arc::new(roles));
        Console::start(ConsoleConfig::default(), remote).expect("default config is valid")
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let mut config = ConsoleConfig::default();
        config.bus.feed_buffer = 0;
        let store = Arc::new(InMemoryRemoteStore::new());
        let remote = RemoteStore::new(store, Arc::new(MockRoleStore::new()));
        let result = Console::start(config, remote);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn test_guard_follows_sign_in() {
        let store = Arc::new(seeded_store());
        let manager = identity_id();
        let console = console(&store, MockRoleStore::new().with_grant(manager, Role::Manager));

        assert_eq!(
            console.guard("/payroll").await,
            Navigation::Redirect("/login".to_string())
        );

        store.sign_in(manager);
        assert_eq!(console.observe_identity(&Identity::authenticated(manager)), 1);
        assert_eq!(console.guard("/payroll").await, Navigation::Render);
        assert_eq!(
            console.guard("/users").await,
            Navigation::Redirect("/".to_string())
        );
    }

    #[tokio::test]
    async fn test_reset_gates_picks_up_new_grant() {
        let store = Arc::new(seeded_store());
        let roles = Arc::new(MockRoleStore::new());
        let id = identity_id();
        store.sign_in(id);
        let console = Console::start(
            ConsoleConfig::default(),
            RemoteStore::new(store.clone(), roles.clone()),
        )
        .expect("start");

        assert!(console.guard("/invoices").await.redirect_target().is_some());
        roles.grant(id, Role::Manager);
        console.reset_gates();
        assert!(console.guard("/invoices").await.is_render());
    }

    #[tokio::test]
    async fn test_shutdown_closes_streams() {
        let store = Arc::new(seeded_store());
        let console = console(&store, MockRoleStore::new());
        let clients = console.entity::<serde_json::Value>(CLIENTS);
        clients.list(QueryParams::new()).await.expect("list");
        assert_eq!(console.binder().bound_resources().len(), 1);

        console.shutdown();
        assert!(console.binder().bound_resources().is_empty());
        assert!(console.bus().watched_resources().is_empty());
    }
}
