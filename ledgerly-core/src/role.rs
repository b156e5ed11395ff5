//! Role hierarchy
//!
//! Roles form a closed, totally ordered set. Declaration order is privilege
//! order, so the derived `Ord` is the privilege relation and every
//! comparison in the access layer goes through it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A console role, lowest privilege first.
///
/// There is no default role. Code that needs a fallback asks for
/// [`Role::lowest`] by name:
///
/// ```compile_fail
/// let role = ledgerly_core::Role::default();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Self-service account with no staff access.
    User,
    Employee,
    Manager,
    /// Top privilege. Bypasses every requirement check.
    Admin,
}

impl Role {
    /// Every role, in ascending privilege.
    pub const ALL: [Role; 4] = [Role::User, Role::Employee, Role::Manager, Role::Admin];

    /// Position in the privilege order, starting at 0 for `User`.
    pub fn rank(self) -> u8 {
        match self {
            Role::User => 0,
            Role::Employee => 1,
            Role::Manager => 2,
            Role::Admin => 3,
        }
    }

    pub fn lowest() -> Self {
        Role::User
    }

    pub fn top() -> Self {
        Role::Admin
    }

    pub fn is_top(self) -> bool {
        self == Self::top()
    }

    /// True if this role carries at least the privilege of `other`.
    pub fn at_least(self, other: Role) -> bool {
        self.rank() >= other.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Employee => "employee",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored role string that names no known role.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown role: {0}")]
pub struct ParseRoleError(pub String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "employee" => Ok(Role::Employee),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            _ => Err(ParseRoleError(s.to_string())),
        }
    }
}
