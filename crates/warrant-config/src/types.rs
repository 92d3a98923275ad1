//! Configuration types for the Warrant engine.
//!
//! Types here have no dependencies on other warrant crates. Key kinds are
//! kept as strings and converted to domain types by the engine. Every struct
//! implements [`Default`] so a bare `[section]` header produces a working
//! configuration.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Operator key and account policy.
    pub policy: PolicyConfig,
    /// Logging level, format and per-crate directives.
    pub logging: LoggingSection,
    /// Maintenance job behaviour.
    pub maintenance: MaintenanceSection,
    /// External key-info provider retry settings.
    pub provider: ProviderSection,
}

// ---------------------------------------------------------------------------
// PolicyConfig
// ---------------------------------------------------------------------------

/// Operator-configured key and account policy.
///
/// Process-wide and versioned by `revision`; passed explicitly to the
/// components that enforce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Bumped by operators whenever thresholds change.
    pub revision: u32,
    /// Scope bits every registered key must grant.
    pub minimum_mask: u64,
    /// Scope bits a key should grant to count as recommended.
    pub recommended_mask: u64,
    /// Recommended key kind (`Character`, `Account` or `Corporation`).
    pub recommended_kind: String,
    /// Refuse authorizations backed by keys that miss the recommendation.
    pub require_recommended_key: bool,
    /// Minimum password strength score (0-4) accepted at registration.
    pub required_password_strength: u8,
    /// Days of login history to retain.
    pub login_history_days: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            revision: 1,
            minimum_mask: 0,
            recommended_mask: 0,
            recommended_kind: "Character".to_owned(),
            require_recommended_key: false,
            required_password_strength: 3,
            login_history_days: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default level filter (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Output format (`pretty`, `compact`, `json`, `full`).
    pub format: String,
    /// Extra filter directives, e.g. `warrant_engine=debug`.
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directives: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// MaintenanceSection
// ---------------------------------------------------------------------------

/// Maintenance job behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct MaintenanceSection {
    /// Report what the legacy grant migration would do without writing.
    pub dry_run: bool,
    /// Drop credentials whose external expiry has passed.
    pub purge_expired_credentials: bool,
    /// Drop login history older than `policy.login_history_days`.
    pub prune_login_history: bool,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            dry_run: false,
            purge_expired_credentials: true,
            prune_login_history: true,
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderSection
// ---------------------------------------------------------------------------

/// Retry settings for the external key-info provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// Retries after the first failed lookup.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Cap on any single retry delay, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}
