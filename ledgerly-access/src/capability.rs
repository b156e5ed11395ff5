//! Named permissions derived from the role order.
//!
//! Every capability has a minimum role and nothing else. Whether a role
//! holds a capability is answered by comparing ranks, so the whole rule set
//! is the table in [`Capability::MINIMUM_ROLES`].
//!
//! # Example
//!
//! ```
//! use ledgerly_access::Capability;
//! use ledgerly_core::Role;
//!
//! let manager = Capability::granted_to(Role::Manager);
//! assert!(manager.contains(Capability::MANAGE_EMPLOYEES));
//! assert!(!manager.contains(Capability::MANAGE_USERS));
//! assert_eq!(Capability::granted_to(Role::Admin), Capability::ALL);
//! ```

use bitflags::bitflags;
use ledgerly_core::Role;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Console permissions.
    ///
    /// | Capability | Minimum role |
    /// |------------|--------------|
    /// | [`VIEW_DASHBOARD`](Self::VIEW_DASHBOARD) | employee |
    /// | [`EDIT_RECORDS`](Self::EDIT_RECORDS) | employee |
    /// | [`MANAGE_INVOICES`](Self::MANAGE_INVOICES) | manager |
    /// | [`VIEW_PAYROLL`](Self::VIEW_PAYROLL) | manager |
    /// | [`MANAGE_EMPLOYEES`](Self::MANAGE_EMPLOYEES) | manager |
    /// | [`MANAGE_USERS`](Self::MANAGE_USERS) | admin |
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capability: u8 {
        /// Staff dashboard and reports.
        const VIEW_DASHBOARD   = 0b0000_0001;
        /// Create and edit clients, projects, tasks, leads and deals.
        const EDIT_RECORDS     = 0b0000_0010;
        /// Issue, edit and void invoices.
        const MANAGE_INVOICES  = 0b0000_0100;
        const VIEW_PAYROLL     = 0b0000_1000;
        const MANAGE_EMPLOYEES = 0b0001_0000;
        /// Grant and revoke roles.
        const MANAGE_USERS     = 0b0010_0000;
    }
}

impl Capability {
    /// All capabilities.
    pub const ALL: Self = Self::all();

    /// Minimum role per capability.
    pub const MINIMUM_ROLES: [(Capability, Role); 6] = [
        (Capability::VIEW_DASHBOARD, Role::Employee),
        (Capability::EDIT_RECORDS, Role::Employee),
        (Capability::MANAGE_INVOICES, Role::Manager),
        (Capability::VIEW_PAYROLL, Role::Manager),
        (Capability::MANAGE_EMPLOYEES, Role::Manager),
        (Capability::MANAGE_USERS, Role::Admin),
    ];

    /// Every capability `role` holds.
    #[must_use]
    pub fn granted_to(role: Role) -> Self {
        Self::MINIMUM_ROLES
            .iter()
            .filter(|(_, minimum)| role.at_least(*minimum))
            .fold(Self::empty(), |granted, (capability, _)| granted | *capability)
    }

    /// Lowest role holding every capability in `self`.
    #[must_use]
    pub fn minimum_role(self) -> Role {
        Self::MINIMUM_ROLES
            .iter()
            .filter(|(capability, _)| self.contains(*capability))
            .map(|(_, minimum)| *minimum)
            .max()
            .unwrap_or_else(Role::lowest)
    }

    #[must_use]
    pub fn is_granted_to(self, role: Role) -> bool {
        Self::granted_to(role).contains(self)
    }

    /// Parses a capability name (case-insensitive).
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::from_name(&name.trim().to_ascii_uppercase())
    }
}

/// True only for the top role.
pub fn can_manage_users(role: Role) -> bool {
    Capability::MANAGE_USERS.is_granted_to(role)
}

/// True for managers and above.
pub fn can_manage_employees(role: Role) -> bool {
    Capability::MANAGE_EMPLOYEES.is_granted_to(role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_user_holds_nothing() {
        assert!(Capability::granted_to(Role::User).is_empty());
    }

    #[test]
    fn test_grants_are_cumulative() {
        for pair in Role::ALL.windows(2) {
            let lower = Capability::granted_to(pair[0]);
            let higher = Capability::granted_to(pair[1]);
            assert!(higher.contains(lower));
        }
        assert_eq!(Capability::granted_to(Role::Admin), Capability::ALL);
    }

    #[test]
    fn test_manage_predicates() {
        assert!(can_manage_users(Role::Admin));
        assert!(!can_manage_users(Role::Manager));
        assert!(can_manage_employees(Role::Manager));
        assert!(can_manage_employees(Role::Admin));
        assert!(!can_manage_employees(Role::Employee));
    }

    #[test]
    fn test_minimum_role_of_combination() {
        let both = Capability::EDIT_RECORDS | Capability::VIEW_PAYROLL;
        assert_eq!(both.minimum_role(), Role::Manager);
        assert_eq!(Capability::empty().minimum_role(), Role::User);
    }

    #[test]
    fn test_parse() {
        assert_eq!(Capability::parse("view_payroll"), Some(Capability::VIEW_PAYROLL));
        assert_eq!(Capability::parse(" MANAGE_USERS "), Some(Capability::MANAGE_USERS));
        assert_eq!(Capability::parse("fly"), None);
    }

    #[test]
    fn test_every_flag_has_a_minimum_role() {
        let listed = Capability::MINIMUM_ROLES
            .iter()
            .fold(Capability::empty(), |acc, (c, _)| acc | *c);
        assert_eq!(listed, Capability::ALL);
    }

    fn arb_role() -> impl Strategy<Value = Role> {
        prop::sample::select(Role::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_manage_users_is_top_only(role in arb_role()) {
            prop_assert_eq!(can_manage_users(role), role == Role::Admin);
        }

        #[test]
        fn prop_grant_follows_rank(role in arb_role(), bits in 0u8..64) {
            let caps = Capability::from_bits_truncate(bits);
            prop_assert_eq!(caps.is_granted_to(role), role.at_least(caps.minimum_role()));
        }
    }
}
