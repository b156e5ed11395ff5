//! Route gating.
//!
//! Maps a path to its [`AccessRequirement`] and an [`AccessGate`] state to a
//! navigation outcome: render, keep waiting, or redirect.

use ledgerly_access::{
    decide_with, AccessGate, AccessRequirement, GatePolicy, GateState, RoleResolution,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ConsoleConfig, RouteRule};

/// What the shell should do with a navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "to", rename_all = "snake_case")]
pub enum Navigation {
    /// Access is still being resolved; render neither the view nor a
    /// redirect.
    Pending,
    Render,
    Redirect(String),
}

impl Navigation {
    pub fn is_render(&self) -> bool {
        matches!(self, Navigation::Render)
    }

    pub fn redirect_target(&self) -> Option<&str> {
        match self {
            Navigation::Redirect(to) => Some(to),
            _ => None,
        }
    }
}

/// Route table plus redirect targets.
#[derive(Debug, Clone)]
pub struct RouteGuard {
    rules: Vec<RouteRule>,
    login_route: String,
    default_route: String,
    policy: GatePolicy,
}

impl RouteGuard {
    pub fn from_config(config: &ConsoleConfig) -> Self {
        Self {
            rules: config.routes.clone(),
            login_route: config.access.login_route.clone(),
            default_route: config.access.default_route.clone(),
            policy: config.gate_policy(),
        }
    }

    pub fn login_route(&self) -> &str {
        &self.login_route
    }

    pub fn default_route(&self) -> &str {
        &self.default_route
    }

    /// Requirement of the most specific rule covering `path`.
    ///
    /// A rule covers its own path and every path below it on a segment
    /// boundary, so `/invoices` covers `/invoices/42` but not
    /// `/invoicesx`. Paths no rule covers are unrestricted.
    pub fn requirement_for(&self, path: &str) -> AccessRequirement {
        let path = normalize(path);
        self.rules
            .iter()
            .filter(|rule| covers(normalize(&rule.path), path))
            .max_by_key(|rule| normalize(&rule.path).len())
            .map(RouteRule::requirement)
            .unwrap_or_default()
    }

    /// A fresh gate for `path`.
    pub fn gate_for(&self, path: &str) -> AccessGate {
        AccessGate::with_policy(self.requirement_for(path), self.policy)
    }

    /// Turn a gate state into a navigation outcome.
    ///
    /// The login route always renders.
    pub fn navigate(&self, path: &str, state: GateState) -> Navigation {
        if normalize(path) == normalize(&self.login_route) {
            return Navigation::Render;
        }
        let navigation = match state {
            GateState::Loading => Navigation::Pending,
            GateState::Granted => Navigation::Render,
            GateState::DeniedUnauthenticated => Navigation::Redirect(self.login_route.clone()),
            GateState::DeniedInsufficientRole => Navigation::Redirect(self.default_route.clone()),
        };
        if let Some(to) = navigation.redirect_target() {
            debug!(path, to, state = ?state, "Redirecting navigation");
        }
        navigation
    }

    /// Decide `path` for a finished resolution in one step.
    pub fn check(&self, path: &str, resolution: &RoleResolution) -> Navigation {
        let state = decide_with(resolution, &self.requirement_for(path), self.policy);
        self.navigate(path, state)
    }
}

pub(crate) fn normalize(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

fn covers(rule: &str, path: &str) -> bool {
    if rule == "/" {
        return true;
    }
    path == rule
        || path
            .strip_prefix(rule)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerly_access::RoleOrigin;
    use ledgerly_core::{new_entity_id, IdentityId, Role};

    fn resolved(role: Role) -> RoleResolution {
        RoleResolution::Resolved {
            identity: IdentityId::new(new_entity_id()),
            role,
            origin: RoleOrigin::Granted,
        }
    }

    fn guard() -> RouteGuard {
        RouteGuard::from_config(&ConsoleConfig::default())
    }

    #[test]
    fn test_requirement_lookup() {
        let guard = guard();
        assert_eq!(
            guard.requirement_for("/payroll"),
            AccessRequirement::at_least(Role::Manager)
        );
        assert_eq!(
            guard.requirement_for("/invoices/42/"),
            AccessRequirement::at_least(Role::Manager)
        );
        assert!(guard.requirement_for("/invoicesx").is_unrestricted());
        assert!(guard.requirement_for("/").is_unrestricted());
        assert!(guard.requirement_for("/login").is_unrestricted());
    }

    #[test]
    fn test_longest_rule_wins() {
        let mut config = ConsoleConfig::default();
        config.routes.push(RouteRule::new(
            "/invoices/drafts",
            AccessRequirement::at_least(Role::Employee),
        ));
        let guard = RouteGuard::from_config(&config);

        assert_eq!(
            guard.requirement_for("/invoices/drafts/3"),
            AccessRequirement::at_least(Role::Employee)
        );
        assert_eq!(
            guard.requirement_for("/invoices/3"),
            AccessRequirement::at_least(Role::Manager)
        );
    }

    #[test]
    fn test_navigation_outcomes() {
        let guard = guard();
        assert_eq!(guard.navigate("/payroll", GateState::Loading), Navigation::Pending);
        assert_eq!(guard.navigate("/payroll", GateState::Granted), Navigation::Render);
        assert_eq!(
            guard.navigate("/payroll", GateState::DeniedUnauthenticated),
            Navigation::Redirect("/login".to_string())
        );
        assert_eq!(
            guard.navigate("/payroll", GateState::DeniedInsufficientRole),
            Navigation::Redirect("/".to_string())
        );
        assert_eq!(
            guard.navigate("/login", GateState::DeniedUnauthenticated),
            Navigation::Render
        );
    }

    #[test]
    fn test_check() {
        let guard = guard();
        assert!(guard.check("/employees", &resolved(Role::Manager)).is_render());
        assert_eq!(
            guard.check("/employees", &resolved(Role::Employee)).redirect_target(),
            Some("/")
        );
        assert!(guard.check("/users", &resolved(Role::Admin)).is_render());
        assert_eq!(
            guard.check("/dashboard", &RoleResolution::Unauthenticated).redirect_target(),
            Some("/login")
        );
        // Unrestricted paths still require a signed-in user.
        assert_eq!(
            guard.check("/reports", &RoleResolution::Unauthenticated).redirect_target(),
            Some("/login")
        );
    }

    #[test]
    fn test_gate_for_uses_policy() {
        let mut config = ConsoleConfig::default();
        config.access.block_degraded = true;
        let guard = RouteGuard::from_config(&config);

        let mut gate = guard.gate_for("/dashboard");
        assert_eq!(gate.state(), GateState::Loading);
        let degraded = RoleResolution::Resolved {
            identity: IdentityId::new(new_entity_id()),
            role: Role::Employee,
            origin: RoleOrigin::LookupFailed,
        };
        assert_eq!(gate.settle(degraded), GateState::DeniedInsufficientRole);
    }

    #[test]
    fn test_navigation_serializes_tagged() {
        let json = serde_json::to_value(Navigation::Redirect("/login".into())).expect("serialize");
        assert_eq!(json, serde_json::json!({ "action": "redirect", "to": "/login" }));
    }
}
