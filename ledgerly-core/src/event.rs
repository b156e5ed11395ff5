//! Change notifications pushed by the remote store.
//!
//! The sync core never interprets the payload; any event for a resource is
//! enough to invalidate every cached query derived from it.

use crate::{ResourceName, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Kind of mutation reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    /// Anything the transport reports that is not one of the above
    /// (truncate, schema change, a future event type).
    #[serde(other)]
    Unknown,
}

impl ChangeOperation {
    /// Parse the operation tag used by the store's change feed.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// One change notification for a watched resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub resource: ResourceName,
    pub operation: ChangeOperation,
    /// Opaque upstream payload (old/new row images, commit metadata).
    pub payload: serde_json::Value,
    pub received_at: Timestamp,
}

impl ChangeEvent {
    pub fn new(
        resource: impl Into<ResourceName>,
        operation: ChangeOperation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            resource: resource.into(),
            operation,
            payload,
            received_at: Utc::now(),
        }
    }

    /// An event with an empty payload, as produced by bare "something
    /// changed" notifications.
    pub fn touch(resource: impl Into<ResourceName>, operation: ChangeOperation) -> Self {
        Self::new(resource, operation, serde_json::Value::Null)
    }
}
