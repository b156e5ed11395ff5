//! Error types for Ledgerly operations
//!
//! Every error here is recoverable: the worst outcome of any of them is a
//! stale or denied view. Access denial is deliberately absent, it is a gate
//! state rather than an error.

use crate::{IdentityId, ResourceName};
use std::time::Duration;
use thiserror::Error;

/// Remote query (or mutation) failures.
///
/// `Clone` so that one failed fetch can be handed to every coalesced waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Query on {resource} failed: {reason}")]
    Remote {
        resource: ResourceName,
        reason: String,
    },

    #[error("Query on {resource} timed out after {after:?}")]
    TimedOut {
        resource: ResourceName,
        after: Duration,
    },

    #[error("Fetch for {resource} aborted before completing")]
    Aborted { resource: ResourceName },

    #[error("Rows from {resource} could not be decoded: {reason}")]
    Decode {
        resource: ResourceName,
        reason: String,
    },

    #[error("Mutation on {resource} rejected: {reason}")]
    MutationRejected {
        resource: ResourceName,
        reason: String,
    },
}

impl FetchError {
    /// Resource the failed request targeted.
    pub fn resource(&self) -> &ResourceName {
        match self {
            Self::Remote { resource, .. }
            | Self::TimedOut { resource, .. }
            | Self::Aborted { resource }
            | Self::Decode { resource, .. }
            | Self::MutationRejected { resource, .. } => resource,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Upstream change-stream failures, delivered to watchers as a bus error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Subscribe to {resource} failed: {reason}")]
    SubscribeFailed {
        resource: ResourceName,
        reason: String,
    },

    #[error("Change stream for {resource} dropped: {reason}")]
    StreamDropped {
        resource: ResourceName,
        reason: String,
    },
}

impl SubscriptionError {
    pub fn resource(&self) -> &ResourceName {
        match self {
            Self::SubscribeFailed { resource, .. } | Self::StreamDropped { resource, .. } => {
                resource
            }
        }
    }
}

/// Role store failures. Resolution degrades instead of propagating these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoleLookupError {
    #[error("Role lookup for {identity} failed: {reason}")]
    Transport { identity: IdentityId, reason: String },

    #[error("Role record for {identity} is unreadable: {value}")]
    InvalidRecord { identity: IdentityId, value: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Failed to read configuration file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("{component} is already initialized")]
    AlreadyInitialized { component: String },
}

/// Master error type for all Ledgerly errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerlyError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Role lookup error: {0}")]
    RoleLookup(#[from] RoleLookupError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Ledgerly operations.
pub type LedgerlyResult<T> = Result<T, LedgerlyError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_fetch_error_display_timed_out() {
        let err = FetchError::TimedOut {
            resource: ResourceName::new("invoices"),
            after: Duration::from_millis(1500),
        };
        let msg = err.to_string();
        assert!(msg.contains("invoices"));
        assert!(msg.contains("timed out"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_fetch_error_resource() {
        let err = FetchError::Decode {
            resource: ResourceName::new("clients"),
            reason: "missing field `name`".to_string(),
        };
        assert_eq!(err.resource().as_str(), "clients");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_subscription_error_display() {
        let err = SubscriptionError::StreamDropped {
            resource: ResourceName::new("payroll"),
            reason: "socket closed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("payroll"));
        assert!(msg.contains("socket closed"));
        assert_eq!(err.resource().as_str(), "payroll");
    }

    #[test]
    fn test_role_lookup_error_display() {
        let err = RoleLookupError::Transport {
            identity: IdentityId::from(Uuid::nil()),
            reason: "connection refused".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_ledgerly_error_from_variants() {
        let fetch = LedgerlyError::from(FetchError::Aborted {
            resource: ResourceName::new("deals"),
        });
        assert!(matches!(fetch, LedgerlyError::Fetch(_)));

        let sub = LedgerlyError::from(SubscriptionError::SubscribeFailed {
            resource: ResourceName::new("deals"),
            reason: "denied".to_string(),
        });
        assert!(matches!(sub, LedgerlyError::Subscription(_)));

        let role = LedgerlyError::from(RoleLookupError::Transport {
            identity: IdentityId::from(Uuid::nil()),
            reason: "timeout".to_string(),
        });
        assert!(matches!(role, LedgerlyError::RoleLookup(_)));

        let config = LedgerlyError::from(ConfigError::MissingRequired {
            field: "login_route".to_string(),
        });
        assert!(matches!(config, LedgerlyError::Config(_)));
    }
}
