//! Ledgerly Console Runtime
//!
//! Process-level wiring for the back-office console:
//!
//! - [`config`]: TOML and environment configuration
//! - [`telemetry`]: tracing subscriber setup
//! - [`catalog`]: entity descriptors for every table the console reads
//! - [`entity`]: live, cached, typed queries per entity
//! - [`guard`]: route table and navigation decisions
//! - [`runtime`]: the [`Console`] that ties them together
//!
//! ```ignore
//! let console = Console::start(ConsoleConfig::load("ledgerly.toml")?, store)?;
//! let invoices = console.entity::<Invoice>(catalog::INVOICES);
//! let open = invoices.list(QueryParams::new().with("status", "open")).await?;
//! ```

pub mod catalog;
pub mod config;
pub mod entity;
pub mod guard;
pub mod runtime;
pub mod telemetry;

pub use catalog::EntityDescriptor;
pub use config::{
    default_routes, AccessSettings, BusSettings, CacheSettings, ConsoleConfig, RouteRule,
    SyncSettings,
};
pub use entity::EntityQuery;
pub use guard::{Navigation, RouteGuard};
pub use runtime::{Console, RemoteStore};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
