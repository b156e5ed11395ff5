//! Property-Based Tests for Role-Gated Navigation
//!
//! **Property 3: Hierarchy Gating**
//!
//! For any route and any signed-in role, navigation renders exactly when
//! the role is the top role, is in the route's allowed set, or ranks at or
//! above its minimum role. Signed-out users are always sent to login.
//!
//! **Property 4: No Premature Decision**
//!
//! A gate never renders or redirects before the role for the current
//! identity has been resolved.

use std::sync::Arc;

use ledgerly_access::{
    decide, AccessGate, AccessRequirement, GateState, RoleOrigin, RoleResolution, RoleResolver,
};
use ledgerly_console::{Console, ConsoleConfig, Navigation, RemoteStore, RouteGuard, RouteRule};
use ledgerly_core::{Identity, Role};
use ledgerly_test_utils::assertions::{assert_denied, assert_granted};
use ledgerly_test_utils::fixtures::{identity_id, seeded_store, staff};
use ledgerly_test_utils::generators::{arb_identity_id, arb_requirement, arb_role};
use ledgerly_test_utils::{InMemoryRemoteStore, MockRoleStore};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

const STOCK_ROUTES: [&str; 8] = [
    "/dashboard",
    "/clients",
    "/projects",
    "/crm",
    "/invoices",
    "/employees",
    "/payroll",
    "/users",
];

fn console_with(store: &Arc<InMemoryRemoteStore>, roles: Arc<MockRoleStore>) -> Console {
    let remote = RemoteStore::new(store.clone(), roles);
    Console::start(ConsoleConfig::default(), remote).expect("default config is valid")
}

fn expected_render(role: Role, requirement: &AccessRequirement) -> bool {
    if role == Role::Admin {
        return true;
    }
    match (&requirement.allowed_roles, requirement.required_role) {
        (Some(allowed), _) => allowed.contains(&role),
        (None, Some(minimum)) => role.rank() >= minimum.rank(),
        (None, None) => true,
    }
}

// ============================================================================
// STOCK ROUTE TABLE
// ============================================================================

#[tokio::test]
async fn test_stock_routes_by_role() {
    let store = Arc::new(seeded_store());
    let roles = Arc::new(MockRoleStore::new());
    let console = console_with(&store, roles.clone());

    let cases = [
        (Role::User, &STOCK_ROUTES[..0]),
        (Role::Employee, ["/dashboard", "/clients", "/projects", "/crm"].as_slice()),
        (Role::Manager, &STOCK_ROUTES[..7]),
        (Role::Admin, STOCK_ROUTES.as_slice()),
    ];

    for (role, allowed) in cases {
        let id = identity_id();
        roles.grant(id, role);
        store.sign_in(id);
        console.observe_identity(&Identity::authenticated(id));

        for path in STOCK_ROUTES {
            let navigation = console.guard(path).await;
            if allowed.contains(&path) {
                assert_eq!(navigation, Navigation::Render, "{role} on {path}");
            } else {
                assert_eq!(
                    navigation,
                    Navigation::Redirect("/".to_string()),
                    "{role} on {path}"
                );
            }
        }
    }
}

#[tokio::test]
async fn test_manager_cannot_manage_users() {
    let (id, roles) = staff(Role::Manager);
    let store = Arc::new(seeded_store());
    store.sign_in(id);
    let console = console_with(&store, Arc::new(roles));

    let resolution = console.current_resolution().await;
    assert!(resolution.can(ledgerly_access::Capability::MANAGE_EMPLOYEES));
    assert!(!resolution.can(ledgerly_access::Capability::MANAGE_USERS));
    assert_eq!(console.guard("/users").await.redirect_target(), Some("/"));
}

#[tokio::test]
async fn test_signed_out_goes_to_login() {
    let store = Arc::new(seeded_store());
    let console = console_with(&store, Arc::new(MockRoleStore::new()));

    for path in STOCK_ROUTES {
        assert_eq!(console.guard(path).await.redirect_target(), Some("/login"));
    }
    assert!(console.guard("/login").await.is_render());
}

#[tokio::test]
async fn test_sign_out_invalidates_granted_gate() {
    let (id, roles) = staff(Role::Admin);
    let store = Arc::new(seeded_store());
    store.sign_in(id);
    let console = console_with(&store, Arc::new(roles));

    assert!(console.guard("/users").await.is_render());

    store.sign_out();
    assert_eq!(console.observe_identity(&Identity::anonymous()), 1);
    assert_eq!(console.guard("/users").await.redirect_target(), Some("/login"));
}

#[tokio::test]
async fn test_role_store_outage() {
    let (id, roles) = staff(Role::Manager);
    let roles = Arc::new(roles);
    let store = Arc::new(seeded_store());
    store.sign_in(id);
    roles.set_failing(true);

    let mut config = ConsoleConfig::default();
    config.routes.push(RouteRule::new("/profile", AccessRequirement::at_least(Role::User)));
    let lenient = Console::start(config.clone(), RemoteStore::new(store.clone(), roles.clone()))
        .expect("valid config");
    config.access.block_degraded = true;
    let strict = Console::start(config, RemoteStore::new(store.clone(), roles.clone()))
        .expect("valid config");

    let resolution = lenient.current_resolution().await;
    assert!(resolution.is_degraded());
    assert_eq!(resolution.role(), Some(Role::User));

    // The fallback role is evaluated like any other unless degraded
    // resolutions are blocked.
    assert!(lenient.guard("/profile").await.is_render());
    assert_eq!(strict.guard("/profile").await.redirect_target(), Some("/"));
    assert_eq!(lenient.guard("/payroll").await.redirect_target(), Some("/"));
    assert!(strict.guard("/reports").await.is_render());

    roles.set_failing(false);
    assert!(lenient.guard("/payroll").await.is_render());
    assert!(strict.guard("/profile").await.is_render());
}

// ============================================================================
// CONFIGURED ROUTES
// ============================================================================

#[test]
fn test_routes_from_toml() {
    let config = ConsoleConfig::from_toml_str(
        r#"
        [access]
        login_route = "/signin"

        [[routes]]
        path = "/reports"
        allowed_roles = ["admin", "manager"]

        [[routes]]
        path = "/reports/audit"
        required_role = "admin"
        "#,
    )
    .expect("parse");
    config.validate().expect("valid");
    let guard = RouteGuard::from_config(&config);

    let manager = RoleResolution::Resolved {
        identity: identity_id(),
        role: Role::Manager,
        origin: RoleOrigin::Granted,
    };
    assert!(guard.check("/reports/q3", &manager).is_render());
    assert_eq!(guard.check("/reports/audit", &manager).redirect_target(), Some("/"));
    assert_eq!(
        guard.check("/reports", &RoleResolution::Unauthenticated).redirect_target(),
        Some("/signin")
    );
    // Routes from the file replace the stock table.
    assert!(guard.requirement_for("/payroll").is_unrestricted());
}

#[test]
fn test_restricted_login_route_is_rejected() {
    let mut config = ConsoleConfig::default();
    let restricted = AccessRequirement::at_least(Role::Manager);
    config.routes.push(RouteRule::new("/login", restricted));
    assert!(config.validate().is_err());
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// **Property 3: Hierarchy Gating**
    #[test]
    fn prop_navigation_matches_hierarchy(
        role in arb_role(),
        requirement in arb_requirement(),
        identity in arb_identity_id(),
    ) {
        let mut config = ConsoleConfig::default();
        config.routes = vec![RouteRule::new("/area", requirement.clone())];
        let guard = RouteGuard::from_config(&config);
        let resolution = RoleResolution::Resolved {
            identity,
            role,
            origin: RoleOrigin::Granted,
        };

        let navigation = guard.check("/area/page", &resolution);
        if expected_render(role, &requirement) {
            prop_assert_eq!(navigation, Navigation::Render);
        } else {
            prop_assert_eq!(navigation, Navigation::Redirect("/".to_string()));
        }
        assert_denied(decide(&RoleResolution::Unauthenticated, &requirement));
        if role == Role::Admin {
            assert_granted(decide(&resolution, &requirement));
        }
    }

    /// **Property 4: No Premature Decision**
    #[test]
    fn prop_gate_waits_for_resolution(
        role in arb_role(),
        requirement in arb_requirement(),
        first in arb_identity_id(),
        second in arb_identity_id(),
    ) {
        prop_assume!(first != second);
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))?;
        rt.block_on(async {
            let roles = MockRoleStore::new()
                .with_grant(first, role)
                .with_grant(second, role);
            let resolver = RoleResolver::new(Arc::new(roles));
            let guard = RouteGuard::from_config(&ConsoleConfig::default());
            let mut gate = AccessGate::new(requirement);

            prop_assert_eq!(gate.state(), GateState::Loading);
            prop_assert_eq!(guard.navigate("/payroll", gate.state()), Navigation::Pending);

            let resolution = resolver.resolve(&Identity::authenticated(first)).await;
            let settled = gate.settle(resolution);
            prop_assert!(settled.is_terminal());
            prop_assert_eq!(gate.observe_identity(&Identity::authenticated(first)), settled);

            let changed = gate.observe_identity(&Identity::authenticated(second));
            prop_assert_eq!(changed, GateState::Loading);
            prop_assert_eq!(guard.navigate("/payroll", gate.state()), Navigation::Pending);

            let resolution = resolver.resolve(&Identity::authenticated(second)).await;
            let again = gate.settle(resolution);
            prop_assert_eq!(again, settled);
            Ok(())
        })?;
    }
}
