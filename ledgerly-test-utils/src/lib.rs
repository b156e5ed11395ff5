//! Ledgerly Test Utilities
//!
//! Centralized test infrastructure for the Ledgerly workspace:
//! - In-memory remote store and role store
//! - Proptest generators for keys, roles and requirements
//! - Test fixtures for common scenarios
//! - Custom assertions for cache and gate states

pub mod store;

pub use store::{row_matches, InMemoryRemoteStore, MockRoleStore};

// Re-export core types for convenience
pub use ledgerly_access::{AccessRequirement, GateState, RoleResolution};
pub use ledgerly_core::{
    CacheKey, ChangeOperation, Identity, IdentityId, ParamValue, QueryParams, ResourceName, Role,
};
pub use ledgerly_storage::{CacheEntry, CacheStatus};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Ledgerly types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Resource names used by the console.
    pub const RESOURCE_NAMES: [&str; 10] = [
        "clients",
        "projects",
        "tasks",
        "invoices",
        "invoice_items",
        "employees",
        "payroll",
        "leads",
        "deals",
        "profiles",
    ];

    pub fn arb_role() -> impl Strategy<Value = Role> {
        prop::sample::select(Role::ALL.to_vec())
    }

    /// Any requirement, including ones that set both fields.
    pub fn arb_requirement() -> impl Strategy<Value = AccessRequirement> {
        (
            prop::option::of(arb_role()),
            prop::option::of(prop::collection::vec(arb_role(), 0..4)),
        )
            .prop_map(|(required_role, allowed_roles)| AccessRequirement {
                required_role,
                allowed_roles,
            })
    }

    pub fn arb_resource_name() -> impl Strategy<Value = ResourceName> {
        prop::sample::select(RESOURCE_NAMES.to_vec()).prop_map(ResourceName::new)
    }

    pub fn arb_identity_id() -> impl Strategy<Value = IdentityId> {
        any::<[u8; 16]>().prop_map(|bytes| IdentityId::new(Uuid::from_bytes(bytes)))
    }

    pub fn arb_change_operation() -> impl Strategy<Value = ChangeOperation> {
        prop_oneof![
            Just(ChangeOperation::Insert),
            Just(ChangeOperation::Update),
            Just(ChangeOperation::Delete),
            Just(ChangeOperation::Unknown),
        ]
    }

    /// Scalar parameter values (no lists).
    pub fn arb_param_value() -> impl Strategy<Value = ParamValue> {
        prop_oneof![
            Just(ParamValue::Null),
            any::<bool>().prop_map(ParamValue::Bool),
            (-1000i64..1000).prop_map(ParamValue::Int),
            "[a-z]{1,8}".prop_map(ParamValue::Text),
        ]
    }

    pub fn arb_query_params() -> impl Strategy<Value = QueryParams> {
        prop::collection::btree_map("[a-z_]{1,10}", arb_param_value(), 0..4).prop_map(|map| {
            map.into_iter()
                .fold(QueryParams::new(), |params, (column, value)| params.with(column, value))
        })
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (arb_resource_name(), arb_query_params())
            .prop_map(|(resource, params)| CacheKey::with_params(resource, params))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use serde_json::{json, Value};
    use uuid::Uuid;

    pub fn identity_id() -> IdentityId {
        IdentityId::new(Uuid::now_v7())
    }

    pub fn client_row(id: i64, name: &str) -> Value {
        json!({ "id": id, "name": name, "email": format!("{}@example.com", name.to_lowercase()) })
    }

    pub fn invoice_row(id: i64, client_id: i64, status: &str, total_cents: i64) -> Value {
        json!({
            "id": id,
            "client_id": client_id,
            "status": status,
            "total_cents": total_cents,
        })
    }

    /// Store with two clients and three invoices.
    pub fn seeded_store() -> InMemoryRemoteStore {
        InMemoryRemoteStore::new()
            .with_table(
                "clients",
                vec![client_row(1, "Acme"), client_row(2, "Globex")],
            )
            .with_table(
                "invoices",
                vec![
                    invoice_row(10, 1, "open", 120_000),
                    invoice_row(11, 1, "paid", 45_000),
                    invoice_row(12, 2, "open", 9_900),
                ],
            )
    }

    /// A signed-in identity and a role store granting it `role`.
    pub fn staff(role: Role) -> (IdentityId, MockRoleStore) {
        let id = identity_id();
        (id, MockRoleStore::new().with_grant(id, role))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache entries and gate states.

    use super::*;

    #[track_caller]
    pub fn assert_status<V: std::fmt::Debug>(entry: &CacheEntry<V>, status: CacheStatus) {
        assert_eq!(
            entry.status(),
            status,
            "Expected {:?} for {}, got entry {:?}",
            status,
            entry.key(),
            entry
        );
    }

    #[track_caller]
    pub fn assert_fresh<V: std::fmt::Debug>(entry: &CacheEntry<V>) {
        assert_status(entry, CacheStatus::Fresh);
    }

    /// Assert the entry is stale but still holds its last value.
    #[track_caller]
    pub fn assert_stale<V: std::fmt::Debug>(entry: &CacheEntry<V>) {
        assert_status(entry, CacheStatus::Stale);
        assert!(entry.has_value(), "Stale entry lost its value: {:?}", entry);
    }

    #[track_caller]
    pub fn assert_granted(state: GateState) {
        assert_eq!(state, GateState::Granted, "Expected Granted, got {:?}", state);
    }

    #[track_caller]
    pub fn assert_denied(state: GateState) {
        assert!(state.is_denied(), "Expected a denial, got {:?}", state);
    }
}
