//! Identity to role resolution.

use std::sync::Arc;

use async_trait::async_trait;
use ledgerly_core::{Identity, IdentityId, Role, RoleLookupError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capability::Capability;

/// Stored role grants.
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// The role recorded for `identity`, or `None` if nothing was granted.
    async fn lookup_role(&self, identity: IdentityId) -> Result<Option<Role>, RoleLookupError>;
}

/// The external auth collaborator.
///
/// Transport failures are reported as an anonymous identity; the caller is
/// then treated as signed out.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn authenticated_identity(&self) -> Identity;
}

/// Where a resolved role came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleOrigin {
    /// An explicit grant in the role store.
    Granted,
    /// No grant on record; the lowest role applies.
    NoRecord,
    /// The role store could not be read; the lowest role applies and the
    /// resolution is degraded.
    LookupFailed,
}

/// Outcome of resolving one identity.
///
/// `Unauthenticated` is distinct from every role and never carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RoleResolution {
    Unauthenticated,
    Resolved {
        identity: IdentityId,
        role: Role,
        origin: RoleOrigin,
    },
}

impl RoleResolution {
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Unauthenticated => None,
            Self::Resolved { role, .. } => Some(*role),
        }
    }

    pub fn identity(&self) -> Option<IdentityId> {
        match self {
            Self::Unauthenticated => None,
            Self::Resolved { identity, .. } => Some(*identity),
        }
    }

    pub fn origin(&self) -> Option<RoleOrigin> {
        match self {
            Self::Unauthenticated => None,
            Self::Resolved { origin, .. } => Some(*origin),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    /// True if the role is a fallback after a failed lookup.
    pub fn is_degraded(&self) -> bool {
        self.origin() == Some(RoleOrigin::LookupFailed)
    }

    pub fn capabilities(&self) -> Capability {
        self.role().map_or(Capability::empty(), Capability::granted_to)
    }

    /// True if the resolved role holds every capability in `capability`.
    /// Always false when unauthenticated.
    pub fn can(&self, capability: Capability) -> bool {
        self.role().is_some_and(|role| capability.is_granted_to(role))
    }
}

/// Resolves identities against a [`RoleStore`].
#[derive(Clone)]
pub struct RoleResolver {
    store: Arc<dyn RoleStore>,
}

impl RoleResolver {
    pub fn new(store: Arc<dyn RoleStore>) -> Self {
        Self { store }
    }

    /// Resolve `identity` to exactly one role.
    ///
    /// Never fails: a missing grant yields the lowest role, and a lookup
    /// error yields the lowest role flagged [`RoleOrigin::LookupFailed`].
    pub async fn resolve(&self, identity: &Identity) -> RoleResolution {
        let Some(id) = identity.authenticated_id() else {
            return RoleResolution::Unauthenticated;
        };

        let (role, origin) = match self.store.lookup_role(id).await {
            Ok(Some(role)) => (role, RoleOrigin::Granted),
            Ok(None) => (Role::lowest(), RoleOrigin::NoRecord),
            Err(err) => {
                warn!(identity = %id, error = %err, "Role lookup failed; resolving to lowest role");
                (Role::lowest(), RoleOrigin::LookupFailed)
            }
        };
        debug!(identity = %id, role = %role, origin = ?origin, "Resolved role");

        RoleResolution::Resolved {
            identity: id,
            role,
            origin,
        }
    }

    /// Ask `source` who is signed in, then resolve them.
    pub async fn resolve_current(&self, source: &dyn IdentitySource) -> RoleResolution {
        let identity = source.authenticated_identity().await;
        self.resolve(&identity).await
    }
}

impl std::fmt::Debug for RoleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerly_core::new_entity_id;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn id() -> IdentityId {
        IdentityId::new(new_entity_id())
    }

    #[derive(Default)]
    struct Store {
        grants: Mutex<HashMap<IdentityId, Result<Option<Role>, RoleLookupError>>>,
    }

    impl Store {
        fn set(&self, id: IdentityId, answer: Result<Option<Role>, RoleLookupError>) {
            self.grants.lock().unwrap().insert(id, answer);
        }
    }

    #[async_trait]
    impl RoleStore for Store {
        async fn lookup_role(&self, identity: IdentityId) -> Result<Option<Role>, RoleLookupError> {
            self.grants
                .lock()
                .unwrap()
                .get(&identity)
                .cloned()
                .unwrap_or(Ok(None))
        }
    }

    struct Fixed(Identity);

    #[async_trait]
    impl IdentitySource for Fixed {
        async fn authenticated_identity(&self) -> Identity {
            self.0
        }
    }

    #[tokio::test]
    async fn test_anonymous_is_unauthenticated() {
        let resolver = RoleResolver::new(Arc::new(Store::default()));
        let resolution = resolver.resolve(&Identity::anonymous()).await;
        assert_eq!(resolution, RoleResolution::Unauthenticated);
        assert_eq!(resolution.role(), None);
        assert!(!resolution.can(Capability::empty()));
    }

    #[tokio::test]
    async fn test_granted_role() {
        let store = Arc::new(Store::default());
        let who = id();
        store.set(who, Ok(Some(Role::Manager)));
        let resolver = RoleResolver::new(store);

        let resolution = resolver.resolve(&Identity::authenticated(who)).await;
        assert_eq!(resolution.role(), Some(Role::Manager));
        assert_eq!(resolution.origin(), Some(RoleOrigin::Granted));
        assert!(resolution.can(Capability::VIEW_PAYROLL));
        assert!(!resolution.can(Capability::MANAGE_USERS));
    }

    #[tokio::test]
    async fn test_missing_record_is_lowest_not_degraded() {
        let resolver = RoleResolver::new(Arc::new(Store::default()));
        let resolution = resolver.resolve(&Identity::authenticated(id())).await;
        assert_eq!(resolution.role(), Some(Role::User));
        assert_eq!(resolution.origin(), Some(RoleOrigin::NoRecord));
        assert!(!resolution.is_degraded());
    }

    #[tokio::test]
    async fn test_lookup_error_is_degraded_lowest() {
        let store = Arc::new(Store::default());
        let who = id();
        store.set(
            who,
            Err(RoleLookupError::Transport {
                identity: who,
                reason: "connection reset".to_string(),
            }),
        );
        let resolver = RoleResolver::new(store);

        let resolution = resolver.resolve(&Identity::authenticated(who)).await;
        assert_eq!(resolution.role(), Some(Role::User));
        assert!(resolution.is_degraded());
        assert!(resolution.capabilities().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_current_uses_source() {
        let store = Arc::new(Store::default());
        let who = id();
        store.set(who, Ok(Some(Role::Admin)));
        let resolver = RoleResolver::new(store);

        let resolution = resolver
            .resolve_current(&Fixed(Identity::authenticated(who)))
            .await;
        assert_eq!(resolution.identity(), Some(who));
        assert_eq!(resolution.capabilities(), Capability::ALL);
    }

    #[test]
    fn test_resolution_serialization() {
        let resolution = RoleResolution::Resolved {
            identity: id(),
            role: Role::Employee,
            origin: RoleOrigin::NoRecord,
        };
        let json = serde_json::to_value(resolution).expect("serialize");
        assert_eq!(json["state"], "resolved");
        assert_eq!(json["role"], "employee");
        assert_eq!(json["origin"], "no_record");
    }
}
