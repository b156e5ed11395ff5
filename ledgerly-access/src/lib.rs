//! Ledgerly Access - Role Resolution and Gating
//!
//! Decides who may reach which view:
//! - [`RoleResolver`] maps the caller's identity to exactly one [`Role`],
//!   degrading to the lowest role when the role store cannot be read.
//! - [`Capability`] derives named permissions from the role order.
//! - [`AccessGate`] combines a resolution with a per-view
//!   [`AccessRequirement`] into a [`GateState`].
//!
//! Denial is a gate state, never an error.
//!
//! [`Role`]: ledgerly_core::Role

pub mod capability;
pub mod gate;
pub mod resolver;

pub use capability::{can_manage_employees, can_manage_users, Capability};
pub use gate::{decide, decide_with, AccessGate, AccessRequirement, GatePolicy, GateState};
pub use resolver::{IdentitySource, RoleOrigin, RoleResolution, RoleResolver, RoleStore};
