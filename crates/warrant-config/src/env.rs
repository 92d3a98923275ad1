//! Environment variable fallbacks.
//!
//! Env vars are fallback, not override: they only apply to fields that no
//! config file set. Values written by the embedded defaults do not count as
//! "set".

use std::collections::HashMap;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources};

/// Expected TOML type of an env-mapped field.
#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Str,
    Int,
    Bool,
}

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: FieldKind,
}

/// All supported `WARRANT_*` env var mappings.
const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "WARRANT_LOG_LEVEL",
        field_path: "logging.level",
        kind: FieldKind::Str,
    },
    EnvMapping {
        var_name: "WARRANT_LOG_FORMAT",
        field_path: "logging.format",
        kind: FieldKind::Str,
    },
    EnvMapping {
        var_name: "WARRANT_POLICY_MINIMUM_MASK",
        field_path: "policy.minimum_mask",
        kind: FieldKind::Int,
    },
    EnvMapping {
        var_name: "WARRANT_POLICY_RECOMMENDED_MASK",
        field_path: "policy.recommended_mask",
        kind: FieldKind::Int,
    },
    EnvMapping {
        var_name: "WARRANT_POLICY_RECOMMENDED_KIND",
        field_path: "policy.recommended_kind",
        kind: FieldKind::Str,
    },
    EnvMapping {
        var_name: "WARRANT_POLICY_REQUIRE_RECOMMENDED_KEY",
        field_path: "policy.require_recommended_key",
        kind: FieldKind::Bool,
    },
    EnvMapping {
        var_name: "WARRANT_MAINTENANCE_DRY_RUN",
        field_path: "maintenance.dry_run",
        kind: FieldKind::Bool,
    },
    EnvMapping {
        var_name: "WARRANT_PROVIDER_MAX_RETRIES",
        field_path: "provider.max_retries",
        kind: FieldKind::Int,
    },
];

/// Apply env var fallbacks for every mapped field no config file set.
///
/// Returns the number of fields filled from the environment.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] if a variable holds a value that cannot
/// be coerced to the field's type.
pub fn apply_env_fallbacks<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        if sources
            .get(mapping.field_path)
            .is_some_and(|layer| *layer != ConfigLayer::Defaults)
        {
            continue;
        }

        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };

        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var fallback"
        );

        let value = coerce(mapping, raw)?;
        set_field(merged, mapping.field_path, value);
        sources.insert(mapping.field_path.to_owned(), ConfigLayer::Environment);
        count = count.saturating_add(1);
    }

    Ok(count)
}

fn coerce(mapping: &EnvMapping, raw: &str) -> ConfigResult<toml::Value> {
    let trimmed = raw.trim();
    match mapping.kind {
        FieldKind::Str => Ok(toml::Value::String(trimmed.to_owned())),
        FieldKind::Int => trimmed
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|e| ConfigError::EnvError {
                var_name: mapping.var_name.to_owned(),
                message: format!("expected an integer: {e}"),
            }),
        FieldKind::Bool => trimmed
            .parse::<bool>()
            .map(toml::Value::Boolean)
            .map_err(|e| ConfigError::EnvError {
                var_name: mapping.var_name.to_owned(),
                message: format!("expected true or false: {e}"),
            }),
    }
}

/// Write `value` at a dotted `path`, creating intermediate tables.
fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}

/// Collect all current environment variables into a map.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_env_fills_default_field() {
        let mut merged: toml::Value = toml::from_str("[logging]\nlevel = \"info\"").unwrap();
        let mut sources = FieldSources::new();
        sources.insert("logging.level".to_owned(), ConfigLayer::Defaults);
        let env = make_env(&[("WARRANT_LOG_LEVEL", "debug")]);

        let count = apply_env_fallbacks(&mut merged, &mut sources, &env).unwrap();

        assert_eq!(count, 1);
        assert_eq!(merged["logging"]["level"].as_str(), Some("debug"));
        assert_eq!(
            sources.get("logging.level"),
            Some(&ConfigLayer::Environment)
        );
    }

    #[test]
    fn test_env_does_not_override_file() {
        let mut merged: toml::Value = toml::from_str("[policy]\nminimum_mask = 8").unwrap();
        let mut sources = FieldSources::new();
        sources.insert("policy.minimum_mask".to_owned(), ConfigLayer::User);
        let env = make_env(&[("WARRANT_POLICY_MINIMUM_MASK", "4")]);

        let count = apply_env_fallbacks(&mut merged, &mut sources, &env).unwrap();

        assert_eq!(count, 0);
        assert_eq!(merged["policy"]["minimum_mask"].as_integer(), Some(8));
    }

    #[test]
    fn test_env_coerces_types() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let mut sources = FieldSources::new();
        let env = make_env(&[
            ("WARRANT_POLICY_REQUIRE_RECOMMENDED_KEY", "true"),
            ("WARRANT_PROVIDER_MAX_RETRIES", " 5 "),
        ]);

        apply_env_fallbacks(&mut merged, &mut sources, &env).unwrap();

        assert_eq!(
            merged["policy"]["require_recommended_key"].as_bool(),
            Some(true)
        );
        assert_eq!(merged["provider"]["max_retries"].as_integer(), Some(5));
    }

    #[test]
    fn test_env_bad_integer() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let mut sources = FieldSources::new();
        let env = make_env(&[("WARRANT_POLICY_MINIMUM_MASK", "lots")]);

        let result = apply_env_fallbacks(&mut merged, &mut sources, &env);
        assert!(matches!(
            result,
            Err(ConfigError::EnvError { var_name, .. }) if var_name == "WARRANT_POLICY_MINIMUM_MASK"
        ));
    }
}
