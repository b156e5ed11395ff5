//! Ledgerly Core - Data Types
//!
//! Pure data structures shared by every Ledgerly crate: identifiers, the role
//! ordering, cache keys, change events and the error taxonomy.
//! This crate contains no I/O and no synchronization primitives.

pub mod error;
pub mod event;
pub mod identity;
pub mod resource;
pub mod role;

pub use error::{
    ConfigError, FetchError, LedgerlyError, LedgerlyResult, RoleLookupError, SubscriptionError,
};
pub use event::{ChangeEvent, ChangeOperation};
pub use identity::{new_entity_id, EntityId, Identity, IdentityId, Timestamp};
pub use resource::{CacheKey, ParamValue, QueryParams, ResourceName, Row, Rows};
pub use role::{ParseRoleError, Role};
