//! Post-merge configuration validation.
//!
//! Validates that deserialized [`Config`](crate::Config) values are within
//! acceptable ranges and that cross-field invariants hold.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Key kinds the policy may recommend.
const KNOWN_KEY_KINDS: &[&str] = &["Character", "Account", "Corporation"];

/// Highest password strength score the external estimator reports.
const MAX_PASSWORD_STRENGTH: u8 = 4;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_policy(config)?;
    validate_logging(config)?;
    validate_provider(config)?;
    Ok(())
}

fn validate_policy(config: &Config) -> ConfigResult<()> {
    let p = &config.policy;

    if p.revision == 0 {
        return Err(ConfigError::ValidationError {
            field: "policy.revision".to_owned(),
            message: "revision starts at 1".to_owned(),
        });
    }

    if !KNOWN_KEY_KINDS.contains(&p.recommended_kind.as_str()) {
        return Err(ConfigError::ValidationError {
            field: "policy.recommended_kind".to_owned(),
            message: format!(
                "unknown key kind '{}'; expected one of: {}",
                p.recommended_kind,
                KNOWN_KEY_KINDS.join(", ")
            ),
        });
    }

    if p.recommended_mask < p.minimum_mask {
        return Err(ConfigError::ValidationError {
            field: "policy.recommended_mask".to_owned(),
            message: format!(
                "recommended_mask ({}) must not be below minimum_mask ({})",
                p.recommended_mask, p.minimum_mask
            ),
        });
    }

    if p.required_password_strength > MAX_PASSWORD_STRENGTH {
        return Err(ConfigError::ValidationError {
            field: "policy.required_password_strength".to_owned(),
            message: format!(
                "required_password_strength must be between 0 and {MAX_PASSWORD_STRENGTH}"
            ),
        });
    }

    if p.login_history_days == 0 {
        return Err(ConfigError::ValidationError {
            field: "policy.login_history_days".to_owned(),
            message: "login_history_days must be at least 1".to_owned(),
        });
    }

    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;

    if !matches!(
        l.level.as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(ConfigError::ValidationError {
            field: "logging.level".to_owned(),
            message: format!(
                "unknown level '{}'; expected one of: trace, debug, info, warn, error",
                l.level
            ),
        });
    }

    if !matches!(l.format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(ConfigError::ValidationError {
            field: "logging.format".to_owned(),
            message: format!(
                "unknown format '{}'; expected one of: pretty, compact, json, full",
                l.format
            ),
        });
    }

    Ok(())
}

/// Upper bound on retries against the key-info provider.
const MAX_PROVIDER_RETRIES: u32 = 10;

fn validate_provider(config: &Config) -> ConfigResult<()> {
    let p = &config.provider;

    if p.max_retries > MAX_PROVIDER_RETRIES {
        return Err(ConfigError::ValidationError {
            field: "provider.max_retries".to_owned(),
            message: format!("max_retries must not exceed {MAX_PROVIDER_RETRIES}"),
        });
    }

    if p.initial_backoff_ms > p.max_backoff_ms {
        return Err(ConfigError::ValidationError {
            field: "provider.initial_backoff_ms".to_owned(),
            message: format!(
                "initial_backoff_ms ({}) must not exceed max_backoff_ms ({})",
                p.initial_backoff_ms, p.max_backoff_ms
            ),
        });
    }

    Ok(())
}
