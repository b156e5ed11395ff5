//! Entity descriptors for the console's resources.
//!
//! One descriptor per table the console reads. Everything else an entity
//! needs (cache keys, invalidation, leases) is derived from the resource
//! name by [`EntityQuery`](crate::EntityQuery).

use ledgerly_core::ResourceName;

/// Configuration record for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityDescriptor {
    /// Remote table name.
    pub resource: &'static str,
    /// Human-readable label.
    pub label: &'static str,
}

impl EntityDescriptor {
    pub const fn new(resource: &'static str, label: &'static str) -> Self {
        Self { resource, label }
    }

    pub fn resource_name(&self) -> ResourceName {
        ResourceName::new(self.resource)
    }
}

pub const CLIENTS: EntityDescriptor = EntityDescriptor::new("clients", "Clients");
pub const PROJECTS: EntityDescriptor = EntityDescriptor::new("projects", "Projects");
pub const TASKS: EntityDescriptor = EntityDescriptor::new("tasks", "Tasks");
pub const INVOICES: EntityDescriptor = EntityDescriptor::new("invoices", "Invoices");
pub const INVOICE_ITEMS: EntityDescriptor =
    EntityDescriptor::new("invoice_items", "Invoice line items");
pub const EMPLOYEES: EntityDescriptor = EntityDescriptor::new("employees", "Employees");
pub const PAYROLL: EntityDescriptor = EntityDescriptor::new("payroll", "Payroll");
pub const LEADS: EntityDescriptor = EntityDescriptor::new("leads", "Leads");
pub const DEALS: EntityDescriptor = EntityDescriptor::new("deals", "Deals");
/// User profiles, including each user's stored role.
pub const PROFILES: EntityDescriptor = EntityDescriptor::new("profiles", "Profiles");

/// Every entity the console knows.
pub const CATALOG: [EntityDescriptor; 10] = [
    CLIENTS,
    PROJECTS,
    TASKS,
    INVOICES,
    INVOICE_ITEMS,
    EMPLOYEES,
    PAYROLL,
    LEADS,
    DEALS,
    PROFILES,
];

/// Look up a descriptor by resource name.
pub fn find(resource: &str) -> Option<EntityDescriptor> {
    CATALOG.iter().copied().find(|d| d.resource == resource)
}
