//! Access gate state machine.
//!
//! ```text
//!            settle(resolution)
//! Loading ─────────────────────┬──> DeniedUnauthenticated
//!    ^                         ├──> DeniedInsufficientRole
//!    │                         └──> Granted
//!    └──── identity or role inputs change
//! ```

use ledgerly_core::{Identity, Role};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::resolver::RoleResolution;

/// What a view or operation demands of the caller.
///
/// When both fields are set, `allowed_roles` decides and `required_role`
/// is ignored; the two are never intersected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessRequirement {
    /// Minimum role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<Role>,
    /// Explicit set of admitted roles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_roles: Option<Vec<Role>>,
}

impl AccessRequirement {
    /// Any authenticated caller.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn at_least(role: Role) -> Self {
        Self {
            required_role: Some(role),
            allowed_roles: None,
        }
    }

    pub fn any_of(roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            required_role: None,
            allowed_roles: Some(roles.into_iter().collect()),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.required_role.is_none() && self.allowed_roles.is_none()
    }

    /// Whether `role` satisfies this requirement, ignoring the top-role
    /// bypass.
    fn admits(&self, role: Role) -> bool {
        match (&self.allowed_roles, self.required_role) {
            (Some(allowed), _) => allowed.contains(&role),
            (None, Some(minimum)) => role.at_least(minimum),
            (None, None) => true,
        }
    }
}

/// Gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// Identity or role not resolved yet.
    #[default]
    Loading,
    DeniedUnauthenticated,
    DeniedInsufficientRole,
    Granted,
}

impl GateState {
    pub fn is_terminal(self) -> bool {
        self != Self::Loading
    }

    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }

    pub fn is_denied(self) -> bool {
        matches!(
            self,
            Self::DeniedUnauthenticated | Self::DeniedInsufficientRole
        )
    }
}

/// Gate policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Deny any restricted view to a resolution whose role lookup failed,
    /// instead of evaluating its fallback role.
    #[serde(default)]
    pub block_degraded: bool,
}

/// Decide `requirement` for `resolution` under the default policy.
pub fn decide(resolution: &RoleResolution, requirement: &AccessRequirement) -> GateState {
    decide_with(resolution, requirement, GatePolicy::default())
}

/// Decide `requirement` for `resolution`.
///
/// Order: unauthenticated, degraded blocking, top-role bypass, allowed
/// set, minimum role, unrestricted.
pub fn decide_with(
    resolution: &RoleResolution,
    requirement: &AccessRequirement,
    policy: GatePolicy,
) -> GateState {
    let Some(role) = resolution.role() else {
        return GateState::DeniedUnauthenticated;
    };
    if policy.block_degraded && resolution.is_degraded() && !requirement.is_unrestricted() {
        return GateState::DeniedInsufficientRole;
    }
    if role.is_top() || requirement.admits(role) {
        GateState::Granted
    } else {
        GateState::DeniedInsufficientRole
    }
}

/// Gate for one view, remembering the inputs it last settled on.
#[derive(Debug, Clone)]
pub struct AccessGate {
    requirement: AccessRequirement,
    policy: GatePolicy,
    state: GateState,
    settled_on: Option<RoleResolution>,
}

impl AccessGate {
    pub fn new(requirement: AccessRequirement) -> Self {
        Self::with_policy(requirement, GatePolicy::default())
    }

    pub fn with_policy(requirement: AccessRequirement, policy: GatePolicy) -> Self {
        Self {
            requirement,
            policy,
            state: GateState::Loading,
            settled_on: None,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn requirement(&self) -> &AccessRequirement {
        &self.requirement
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy
    }

    /// Report the current identity. Returns to `Loading` if it is not the
    /// identity the gate last settled on.
    pub fn observe_identity(&mut self, identity: &Identity) -> GateState {
        let settled_identity = self.settled_on.as_ref().and_then(RoleResolution::identity);
        let settled_anonymous = matches!(self.settled_on, Some(RoleResolution::Unauthenticated));
        let unchanged = match identity.authenticated_id() {
            Some(id) => settled_identity == Some(id),
            None => settled_anonymous,
        };
        if !unchanged {
            self.reset();
        }
        self.state
    }

    /// Return to `Loading` until the next [`settle`](Self::settle).
    pub fn reset(&mut self) {
        if self.state.is_terminal() {
            debug!(previous = ?self.state, "Access gate inputs changed");
        }
        self.state = GateState::Loading;
        self.settled_on = None;
    }

    /// Decide against a finished resolution.
    ///
    /// Settling again on the same resolution keeps the current state.
    pub fn settle(&mut self, resolution: RoleResolution) -> GateState {
        if self.state.is_terminal() && self.settled_on == Some(resolution) {
            return self.state;
        }
        self.state = decide_with(&resolution, &self.requirement, self.policy);
        self.settled_on = Some(resolution);
        debug!(state = ?self.state, role = ?resolution.role(), "Access gate settled");
        self.state
    }
}
