//! Console Configuration Module
//!
//! Configuration is loaded from a TOML file, then overridden from
//! environment variables, with defaults suitable for development.
//!
//! ```toml
//! [cache]
//! fetch_timeout_ms = 10000
//!
//! [access]
//! login_route = "/signin"
//! block_degraded = true
//!
//! [[routes]]
//! path = "/payroll"
//! required_role = "manager"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use ledgerly_access::{AccessRequirement, GatePolicy};
use ledgerly_core::{ConfigError, Role};
use ledgerly_storage::{BusConfig, CacheConfig};
use serde::{Deserialize, Serialize};

use crate::guard::{normalize, RouteGuard};

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Upper bound on one fetch, in milliseconds. 0 disables the bound.
    pub fetch_timeout_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Channel capacity hint for each upstream change stream.
    pub feed_buffer: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self { feed_buffer: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// While a resource's change stream is down, cached reads older than
    /// this are refetched on access.
    pub degraded_refetch_interval_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            degraded_refetch_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSettings {
    /// Where unauthenticated callers are sent.
    pub login_route: String,
    /// Where callers lacking the required role are sent.
    pub default_route: String,
    /// Deny restricted routes to sessions whose role lookup failed.
    pub block_degraded: bool,
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            login_route: "/login".to_string(),
            default_route: "/".to_string(),
            block_degraded: false,
        }
    }
}

/// Access requirement of one route and everything below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_roles: Option<Vec<Role>>,
}

impl RouteRule {
    pub fn new(path: impl Into<String>, requirement: AccessRequirement) -> Self {
        Self {
            path: path.into(),
            required_role: requirement.required_role,
            allowed_roles: requirement.allowed_roles,
        }
    }

    pub fn requirement(&self) -> AccessRequirement {
        AccessRequirement {
            required_role: self.required_role,
            allowed_roles: self.allowed_roles.clone(),
        }
    }
}

// ============================================================================
// CONSOLE CONFIGURATION
// ============================================================================

/// Complete console configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub cache: CacheSettings,
    pub bus: BusSettings,
    pub sync: SyncSettings,
    pub access: AccessSettings,
    pub routes: Vec<RouteRule>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            bus: BusSettings::default(),
            sync: SyncSettings::default(),
            access: AccessSettings::default(),
            routes: default_routes(),
        }
    }
}

/// Route table of the stock console.
pub fn default_routes() -> Vec<RouteRule> {
    vec![
        RouteRule::new("/dashboard", AccessRequirement::at_least(Role::Employee)),
        RouteRule::new("/clients", AccessRequirement::at_least(Role::Employee)),
        RouteRule::new("/projects", AccessRequirement::at_least(Role::Employee)),
        RouteRule::new("/crm", AccessRequirement::at_least(Role::Employee)),
        RouteRule::new("/invoices", AccessRequirement::at_least(Role::Manager)),
        RouteRule::new(
            "/employees",
            AccessRequirement::any_of([Role::Admin, Role::Manager]),
        ),
        RouteRule::new("/payroll", AccessRequirement::at_least(Role::Manager)),
        RouteRule::new("/users", AccessRequirement::at_least(Role::Admin)),
    ]
}

impl ConsoleConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_toml_str(&source)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply overrides from environment variables.
    ///
    /// Environment variables:
    /// - `LEDGERLY_FETCH_TIMEOUT_MS`: fetch bound in ms, 0 disables (default: 15000)
    /// - `LEDGERLY_FEED_BUFFER`: change stream buffer (default: 256)
    /// - `LEDGERLY_DEGRADED_REFETCH_MS`: refetch age while degraded (default: 30000)
    /// - `LEDGERLY_LOGIN_ROUTE`: login redirect target (default: /login)
    /// - `LEDGERLY_DEFAULT_ROUTE`: insufficient-role redirect target (default: /)
    /// - `LEDGERLY_BLOCK_DEGRADED`: "true" or "false" (default: false)
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("LEDGERLY_FETCH_TIMEOUT_MS") {
            self.cache.fetch_timeout_ms = parse_number("LEDGERLY_FETCH_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("LEDGERLY_FEED_BUFFER") {
            self.bus.feed_buffer = parse_number("LEDGERLY_FEED_BUFFER", &value)?;
        }
        if let Some(value) = lookup("LEDGERLY_DEGRADED_REFETCH_MS") {
            self.sync.degraded_refetch_interval_ms =
                parse_number("LEDGERLY_DEGRADED_REFETCH_MS", &value)?;
        }
        if let Some(value) = lookup("LEDGERLY_LOGIN_ROUTE") {
            self.access.login_route = value.trim().to_string();
        }
        if let Some(value) = lookup("LEDGERLY_DEFAULT_ROUTE") {
            self.access.default_route = value.trim().to_string();
        }
        if let Some(value) = lookup("LEDGERLY_BLOCK_DEGRADED") {
            self.access.block_degraded =
                matches!(value.trim().to_lowercase().as_str(), "true" | "1");
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, route) in [
            ("access.login_route", &self.access.login_route),
            ("access.default_route", &self.access.default_route),
        ] {
            if !route.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: route.clone(),
                    reason: "must be an absolute path".to_string(),
                });
            }
        }

        if self.bus.feed_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bus.feed_buffer".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for rule in &self.routes {
            if !seen.insert(normalize(&rule.path)) {
                return Err(ConfigError::InvalidValue {
                    field: "routes.path".to_string(),
                    value: rule.path.clone(),
                    reason: "duplicate route".to_string(),
                });
            }
            if rule.allowed_roles.as_ref().is_some_and(Vec::is_empty) {
                return Err(ConfigError::InvalidValue {
                    field: "routes.allowed_roles".to_string(),
                    value: rule.path.clone(),
                    reason: "allowed role set is empty".to_string(),
                });
            }
        }

        // Redirecting to a gated route would loop.
        let guard = RouteGuard::from_config(self);
        for (field, route) in [
            ("access.login_route", &self.access.login_route),
            ("access.default_route", &self.access.default_route),
        ] {
            if !guard.requirement_for(route).is_unrestricted() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: route.clone(),
                    reason: "redirect target is covered by a restricted route".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        match self.cache.fetch_timeout_ms {
            0 => CacheConfig::new().without_fetch_timeout(),
            ms => CacheConfig::new().with_fetch_timeout(Duration::from_millis(ms)),
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            feed_buffer: self.bus.feed_buffer,
        }
    }

    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            block_degraded: self.access.block_degraded,
        }
    }

    pub fn degraded_refetch_interval(&self) -> Duration {
        Duration::from_millis(self.sync.degraded_refetch_interval_ms)
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: "expected a non-negative integer".to_string(),
    })
}
