//! Remote store collaborator traits.
//!
//! The sync core is agnostic to transport. An implementation only has to
//! answer queries, apply mutations and deliver change events for a resource
//! at least once while the subscription is held.

use async_trait::async_trait;
use ledgerly_core::{
    ChangeEvent, FetchError, QueryParams, ResourceName, Row, Rows, SubscriptionError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Request/response query interface of the remote store.
#[async_trait]
pub trait RemoteQuery: Send + Sync {
    /// Fetch the rows of `resource` matching `params`.
    async fn query(&self, resource: &ResourceName, params: &QueryParams)
        -> Result<Rows, FetchError>;
}

/// A write against one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    Insert { row: Row },
    /// Apply `changes` to every row matching `filter`.
    Update { filter: QueryParams, changes: Row },
    Delete { filter: QueryParams },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Insert { .. } => "insert",
            Mutation::Update { .. } => "update",
            Mutation::Delete { .. } => "delete",
        }
    }
}

/// Mutation interface of the remote store.
#[async_trait]
pub trait RemoteMutate: Send + Sync {
    /// Apply `mutation` and return the affected rows as confirmed by the
    /// store.
    async fn mutate(&self, resource: &ResourceName, mutation: Mutation)
        -> Result<Rows, FetchError>;
}

/// One message on an upstream change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(ChangeEvent),
    /// The stream failed; no further messages follow.
    Dropped(SubscriptionError),
}

/// Receiving half of an upstream subscription.
///
/// Dropping it is the unsubscribe: the store sees its sender closed.
pub type FeedSubscription = mpsc::Receiver<FeedMessage>;

/// Channel pair for a feed implementation to hand out.
pub fn feed_channel(buffer: usize) -> (mpsc::Sender<FeedMessage>, FeedSubscription) {
    mpsc::channel(buffer.max(1))
}

/// Subscribe-to-changes primitive of the remote store.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a change stream for `resource`. `buffer` is a capacity hint
    /// for the returned channel.
    async fn subscribe(
        &self,
        resource: &ResourceName,
        buffer: usize,
    ) -> Result<FeedSubscription, SubscriptionError>;
}
