//! In-memory stand-ins for the remote store and the role store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ledgerly_access::{IdentitySource, RoleStore};
use ledgerly_core::{
    ChangeEvent, ChangeOperation, FetchError, Identity, IdentityId, ParamValue, QueryParams,
    ResourceName, Role, RoleLookupError, Row, Rows, SubscriptionError,
};
use ledgerly_storage::{
    feed_channel, ChangeFeed, FeedMessage, FeedSubscription, Mutation, RemoteMutate, RemoteQuery,
};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

#[derive(Default)]
struct StoreState {
    tables: HashMap<ResourceName, Rows>,
    feeds: HashMap<ResourceName, Vec<mpsc::Sender<FeedMessage>>>,
    fetches: HashMap<ResourceName, usize>,
    subscribes: HashMap<ResourceName, usize>,
    failing_queries: HashMap<ResourceName, String>,
    refused_feeds: HashSet<ResourceName>,
    identity: Identity,
}

impl StoreState {
    fn live_senders(&mut self, resource: &ResourceName) -> Vec<mpsc::Sender<FeedMessage>> {
        let senders = self.feeds.entry(resource.clone()).or_default();
        senders.retain(|tx| !tx.is_closed());
        senders.clone()
    }
}

/// Remote store backed by in-memory tables.
///
/// Mutations go through [`RemoteMutate`] and are echoed on the change feed
/// like a database trigger would. [`push_change`](Self::push_change)
/// simulates a write by another actor.
pub struct InMemoryRemoteStore {
    state: Mutex<StoreState>,
    gate: watch::Sender<bool>,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(StoreState::default()),
            gate,
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the rows of `resource`.
    pub fn seed(&self, resource: impl Into<ResourceName>, rows: Rows) {
        self.state().tables.insert(resource.into(), rows);
    }

    pub fn with_table(self, resource: impl Into<ResourceName>, rows: Rows) -> Self {
        self.seed(resource, rows);
        self
    }

    pub fn rows(&self, resource: &str) -> Rows {
        self.state()
            .tables
            .get(&ResourceName::new(resource))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of queries started against `resource`.
    pub fn fetch_count(&self, resource: &str) -> usize {
        self.state()
            .fetches
            .get(&ResourceName::new(resource))
            .copied()
            .unwrap_or(0)
    }

    /// Number of subscribe calls made for `resource`.
    pub fn subscribe_count(&self, resource: &str) -> usize {
        self.state()
            .subscribes
            .get(&ResourceName::new(resource))
            .copied()
            .unwrap_or(0)
    }

    /// Change streams for `resource` whose receiver is still held.
    pub fn open_subscriptions(&self, resource: &str) -> usize {
        self.state()
            .feeds
            .get(&ResourceName::new(resource))
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Park every query until [`release_fetches`](Self::release_fetches).
    pub fn hold_fetches(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_fetches(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail_queries(&self, resource: &str, reason: impl Into<String>) {
        self.state()
            .failing_queries
            .insert(ResourceName::new(resource), reason.into());
    }

    pub fn heal_queries(&self, resource: &str) {
        self.state().failing_queries.remove(&ResourceName::new(resource));
    }

    /// Make subscribe calls for `resource` fail.
    pub fn refuse_subscriptions(&self, resource: &str) {
        self.state().refused_feeds.insert(ResourceName::new(resource));
    }

    pub fn accept_subscriptions(&self, resource: &str) {
        self.state().refused_feeds.remove(&ResourceName::new(resource));
    }

    pub fn sign_in(&self, id: IdentityId) {
        self.state().identity = Identity::authenticated(id);
    }

    pub fn sign_out(&self) {
        self.state().identity = Identity::anonymous();
    }

    /// Report a change on `resource` made by someone else. Returns the
    /// number of streams it reached.
    pub async fn push_change(&self, resource: &str, operation: ChangeOperation) -> usize {
        let resource = ResourceName::new(resource);
        let senders = self.state().live_senders(&resource);
        let event = ChangeEvent::touch(resource, operation);
        broadcast(senders, FeedMessage::Change(event)).await
    }

    /// Fail every open stream for `resource`.
    pub async fn drop_streams(&self, resource: &str, reason: &str) -> usize {
        let resource = ResourceName::new(resource);
        let senders = {
            let mut state = self.state();
            let senders = state.live_senders(&resource);
            state.feeds.remove(&resource);
            senders
        };
        let err = SubscriptionError::StreamDropped {
            resource,
            reason: reason.to_string(),
        };
        broadcast(senders, FeedMessage::Dropped(err)).await
    }

    fn apply(
        &self,
        resource: &ResourceName,
        mutation: Mutation,
    ) -> (Rows, ChangeEvent, Vec<mpsc::Sender<FeedMessage>>) {
        let mut state = self.state();
        let table = state.tables.entry(resource.clone()).or_default();
        let (affected, operation) = match mutation {
            Mutation::Insert { row } => {
                table.push(row.clone());
                (vec![row], ChangeOperation::Insert)
            }
            Mutation::Update { filter, changes } => {
                let mut affected = Vec::new();
                for row in table.iter_mut().filter(|row| row_matches(row, &filter)) {
                    merge(row, &changes);
                    affected.push(row.clone());
                }
                (affected, ChangeOperation::Update)
            }
            Mutation::Delete { filter } => {
                let (removed, kept): (Rows, Rows) =
                    table.drain(..).partition(|row| row_matches(row, &filter));
                *table = kept;
                (removed, ChangeOperation::Delete)
            }
        };
        let event = ChangeEvent::new(
            resource.clone(),
            operation,
            serde_json::json!({ "rows": affected }),
        );
        let senders = state.live_senders(resource);
        (affected, event, senders)
    }
}

async fn broadcast(senders: Vec<mpsc::Sender<FeedMessage>>, message: FeedMessage) -> usize {
    let mut reached = 0;
    for tx in senders {
        if tx.send(message.clone()).await.is_ok() {
            reached += 1;
        }
    }
    reached
}

/// Equality filter: every parameter must equal the row's column. A list
/// parameter matches any of its elements.
pub fn row_matches(row: &Row, params: &QueryParams) -> bool {
    params.iter().all(|(column, value)| {
        let cell = row.get(column).unwrap_or(&Value::Null);
        match value {
            ParamValue::List(items) => items.iter().any(|item| item.to_json() == *cell),
            other => other.to_json() == *cell,
        }
    })
}

fn merge(row: &mut Row, changes: &Row) {
    if let (Some(target), Some(changes)) = (row.as_object_mut(), changes.as_object()) {
        for (column, value) in changes {
            target.insert(column.clone(), value.clone());
        }
    }
}

#[async_trait]
impl RemoteQuery for InMemoryRemoteStore {
    async fn query(
        &self,
        resource: &ResourceName,
        params: &QueryParams,
    ) -> Result<Rows, FetchError> {
        let mut gate = self.gate.subscribe();
        *self.state().fetches.entry(resource.clone()).or_insert(0) += 1;
        let _ = gate.wait_for(|open| *open).await;

        let state = self.state();
        if let Some(reason) = state.failing_queries.get(resource) {
            return Err(FetchError::Remote {
                resource: resource.clone(),
                reason: reason.clone(),
            });
        }
        Ok(state
            .tables
            .get(resource)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row_matches(row, params))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl RemoteMutate for InMemoryRemoteStore {
    async fn mutate(
        &self,
        resource: &ResourceName,
        mutation: Mutation,
    ) -> Result<Rows, FetchError> {
        if let Mutation::Insert { row } = &mutation {
            if !row.is_object() {
                return Err(FetchError::MutationRejected {
                    resource: resource.clone(),
                    reason: "row must be an object".to_string(),
                });
            }
        }
        let (affected, event, senders) = self.apply(resource, mutation);
        broadcast(senders, FeedMessage::Change(event)).await;
        Ok(affected)
    }
}

#[async_trait]
impl ChangeFeed for InMemoryRemoteStore {
    async fn subscribe(
        &self,
        resource: &ResourceName,
        buffer: usize,
    ) -> Result<FeedSubscription, SubscriptionError> {
        let mut state = self.state();
        *state.subscribes.entry(resource.clone()).or_insert(0) += 1;
        if state.refused_feeds.contains(resource) {
            return Err(SubscriptionError::SubscribeFailed {
                resource: resource.clone(),
                reason: "subscription refused".to_string(),
            });
        }
        let (tx, rx) = feed_channel(buffer);
        state.feeds.entry(resource.clone()).or_default().push(tx);
        Ok(rx)
    }
}

#[async_trait]
impl IdentitySource for InMemoryRemoteStore {
    async fn authenticated_identity(&self) -> Identity {
        self.state().identity
    }
}

/// Role store backed by a map, with switchable failure.
#[derive(Default)]
pub struct MockRoleStore {
    grants: Mutex<HashMap<IdentityId, Role>>,
    failing: AtomicBool,
    lookups: AtomicUsize,
}

impl MockRoleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grant(self, identity: IdentityId, role: Role) -> Self {
        self.grant(identity, role);
        self
    }

    pub fn grant(&self, identity: IdentityId, role: Role) {
        self.grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity, role);
    }

    pub fn revoke(&self, identity: IdentityId) {
        self.grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&identity);
    }

    /// Make every lookup fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoleStore for MockRoleStore {
    async fn lookup_role(&self, identity: IdentityId) -> Result<Option<Role>, RoleLookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RoleLookupError::Transport {
                identity,
                reason: "role store unreachable".to_string(),
            });
        }
        Ok(self
            .grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity)
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_matches() {
        let row = json!({ "id": 1, "status": "open", "client": "acme" });
        assert!(row_matches(&row, &QueryParams::new()));
        assert!(row_matches(&row, &QueryParams::new().with("status", "open")));
        assert!(!row_matches(&row, &QueryParams::new().with("status", "paid")));
        let any_of = QueryParams::new().with(
            "status",
            ParamValue::List(vec!["paid".into(), "open".into()]),
        );
        assert!(row_matches(&row, &any_of));
        assert!(!row_matches(&row, &QueryParams::new().with("missing", 3)));
    }

    #[tokio::test]
    async fn test_query_filters_and_counts() {
        let store = InMemoryRemoteStore::new().with_table(
            "invoices",
            vec![json!({ "id": 1, "status": "open" }), json!({ "id": 2, "status": "paid" })],
        );
        let open = store
            .query(&"invoices".into(), &QueryParams::new().with("status", "open"))
            .await
            .expect("query");
        assert_eq!(open, vec![json!({ "id": 1, "status": "open" })]);
        assert_eq!(store.fetch_count("invoices"), 1);
    }

    #[tokio::test]
    async fn test_mutations_apply_and_echo() {
        let store = InMemoryRemoteStore::new();
        let mut feed = store.subscribe(&"clients".into(), 8).await.expect("subscribe");

        store
            .mutate(
                &"clients".into(),
                Mutation::Insert {
                    row: json!({ "id": 1, "name": "Acme" }),
                },
            )
            .await
            .expect("insert");
        let updated = store
            .mutate(
                &"clients".into(),
                Mutation::Update {
                    filter: QueryParams::new().with("id", 1),
                    changes: json!({ "name": "Acme Ltd" }),
                },
            )
            .await
            .expect("update");
        assert_eq!(updated[0]["name"], "Acme Ltd");

        let removed = store
            .mutate(
                &"clients".into(),
                Mutation::Delete {
                    filter: QueryParams::new().with("id", 1),
                },
            )
            .await
            .expect("delete");
        assert_eq!(removed.len(), 1);
        assert!(store.rows("clients").is_empty());

        let mut operations = Vec::new();
        for _ in 0..3 {
            match feed.recv().await {
                Some(FeedMessage::Change(event)) => operations.push(event.operation),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(
            operations,
            vec![
                ChangeOperation::Insert,
                ChangeOperation::Update,
                ChangeOperation::Delete
            ]
        );
    }

    #[tokio::test]
    async fn test_refused_and_dropped_streams() {
        let store = InMemoryRemoteStore::new();
        store.refuse_subscriptions("payroll");
        assert!(store.subscribe(&"payroll".into(), 1).await.is_err());

        let mut feed = store.subscribe(&"leads".into(), 1).await.expect("subscribe");
        assert_eq!(store.open_subscriptions("leads"), 1);
        assert_eq!(store.drop_streams("leads", "network lost").await, 1);
        assert!(matches!(feed.recv().await, Some(FeedMessage::Dropped(_))));
        assert_eq!(store.open_subscriptions("leads"), 0);
    }

    #[tokio::test]
    async fn test_mock_role_store() {
        let who = IdentityId::new(uuid::Uuid::now_v7());
        let roles = MockRoleStore::new().with_grant(who, Role::Manager);
        assert_eq!(roles.lookup_role(who).await, Ok(Some(Role::Manager)));

        roles.revoke(who);
        assert_eq!(roles.lookup_role(who).await, Ok(None));

        roles.set_failing(true);
        assert!(roles.lookup_role(who).await.is_err());
        assert_eq!(roles.lookups(), 3);
    }
}
