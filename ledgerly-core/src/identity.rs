//! Identity types for Ledgerly

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Row identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Identifier of an authenticated principal, as issued by the auth provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(Uuid);

impl IdentityId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for IdentityId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The caller as reported by the external auth collaborator.
///
/// An identity that is not authenticated never carries a usable id; the
/// nil UUID stands in so the type stays `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub authenticated: bool,
}

impl Identity {
    /// An authenticated session for `id`.
    pub fn authenticated(id: IdentityId) -> Self {
        Self {
            id,
            authenticated: true,
        }
    }

    /// No session.
    pub fn anonymous() -> Self {
        Self {
            id: IdentityId(Uuid::nil()),
            authenticated: false,
        }
    }

    /// The id, if the session is authenticated.
    pub fn authenticated_id(&self) -> Option<IdentityId> {
        self.authenticated.then_some(self.id)
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::anonymous()
    }
}
