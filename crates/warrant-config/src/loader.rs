//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `/etc/warrant/config.toml` (system)
//! 3. Merge `~/.warrant/config.toml`, or `$WARRANT_HOME/config.toml` (user)
//! 4. Merge an explicitly named file, if any
//! 5. Apply env var fallbacks for unset fields
//! 6. Deserialize merged tree → `Config`
//! 7. Validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::env::{apply_env_fallbacks, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources, deep_merge_tracking, record_leaves};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// A loaded configuration with provenance.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// The final configuration.
    pub config: Config,
    /// Which layer set each field.
    pub field_sources: FieldSources,
    /// Files that contributed, in merge order.
    pub loaded_files: Vec<String>,
}

/// Where [`load`] looks for configuration.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Treat this directory as the warrant home instead of discovering it.
    pub home_override: Option<PathBuf>,
    /// Merge this file last, above the user layer.
    pub explicit_file: Option<PathBuf>,
    /// Skip `/etc/warrant/config.toml`.
    pub skip_system: bool,
    /// Environment to consult. `None` reads the process environment.
    pub env: Option<HashMap<String, String>>,
}

/// Load the configuration with layered file precedence.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, an env var
/// cannot be coerced, or the merged configuration fails validation.
pub fn load(options: &LoadOptions) -> ConfigResult<ResolvedConfig> {
    let env_vars = options.env.clone().unwrap_or_else(collect_env_vars);

    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let mut field_sources = FieldSources::new();
    let mut loaded_files = Vec::new();
    record_leaves(&merged, "", &ConfigLayer::Defaults, &mut field_sources);

    let mut layers: Vec<(PathBuf, ConfigLayer)> = Vec::new();
    if !options.skip_system {
        layers.push((
            PathBuf::from("/etc/warrant/config.toml"),
            ConfigLayer::System,
        ));
    }
    if let Some(path) = user_config_path(options, &env_vars)? {
        layers.push((path, ConfigLayer::User));
    }
    if let Some(path) = &options.explicit_file {
        // An explicitly named file must exist.
        if !path.exists() {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        layers.push((path.clone(), ConfigLayer::Explicit));
    }

    for (path, layer) in layers {
        if let Some(overlay) = try_load_file(&path)? {
            deep_merge_tracking(&mut merged, &overlay, "", &layer, &mut field_sources);
            loaded_files.push(path.display().to_string());
            info!(path = %path.display(), layer = %layer, "loaded config");
        }
    }

    let env_count = apply_env_fallbacks(&mut merged, &mut field_sources, &env_vars)?;
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        field_sources,
        loaded_files,
    })
}

/// Load a config from a specific file path (no layering).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed or validated.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let Some(value) = try_load_file(path)? else {
        return Err(ConfigError::ReadError {
            path: path.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    };

    let config: Config = value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })?;

    validate::validate(&config)?;
    Ok(config)
}

/// Resolve the user-level config file path.
fn user_config_path(
    options: &LoadOptions,
    env_vars: &HashMap<String, String>,
) -> ConfigResult<Option<PathBuf>> {
    if let Some(home) = &options.home_override {
        return Ok(Some(home.join("config.toml")));
    }
    if let Some(warrant_home) = env_vars.get("WARRANT_HOME") {
        let path = PathBuf::from(warrant_home);
        if path.is_dir() {
            return Ok(Some(path.join("config.toml")));
        }
        tracing::warn!(path = %warrant_home, "WARRANT_HOME is not a directory; ignoring");
    }
    let home = home_directory()?;
    Ok(Some(home.join(".warrant").join("config.toml")))
}

/// Try to load a file, returning `None` if the file doesn't exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {} byte limit",
                content.len(),
                MAX_CONFIG_FILE_SIZE
            ),
        });
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(Some(value))
}

fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isolated(home: &Path) -> LoadOptions {
        LoadOptions {
            home_override: Some(home.to_path_buf()),
            explicit_file: None,
            skip_system: true,
            env: Some(HashMap::new()),
        }
    }

    #[test]
    fn test_defaults_deserialize_to_config() {
        let config: Config = toml::from_str(DEFAULTS_TOML).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_with_only_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = load(&isolated(dir.path())).unwrap();

        assert_eq!(resolved.config, Config::default());
        assert!(resolved.loaded_files.is_empty());
        assert_eq!(
            resolved.field_sources.get("policy.revision"),
            Some(&ConfigLayer::Defaults)
        );
    }

    #[test]
    fn test_user_then_explicit_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[policy]\nminimum_mask = 8\nrecommended_mask = 8\n",
        )
        .unwrap();
        let explicit = dir.path().join("ops.toml");
        std::fs::write(&explicit, "[policy]\nrecommended_mask = 12\n").unwrap();

        let mut options = isolated(dir.path());
        options.explicit_file = Some(explicit);
        let resolved = load(&options).unwrap();

        assert_eq!(resolved.config.policy.minimum_mask, 8);
        assert_eq!(resolved.config.policy.recommended_mask, 12);
        assert_eq!(
            resolved.field_sources.get("policy.minimum_mask"),
            Some(&ConfigLayer::User)
        );
        assert_eq!(
            resolved.field_sources.get("policy.recommended_mask"),
            Some(&ConfigLayer::Explicit)
        );
        assert_eq!(resolved.loaded_files.len(), 2);
    }

    #[test]
    fn test_env_fallback_applies_over_defaults_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[logging]\nlevel = \"warn\"\n").unwrap();

        let mut options = isolated(dir.path());
        options.env = Some(HashMap::from([
            ("WARRANT_LOG_LEVEL".to_owned(), "debug".to_owned()),
            ("WARRANT_LOG_FORMAT".to_owned(), "json".to_owned()),
        ]));
        let resolved = load(&options).unwrap();

        assert_eq!(resolved.config.logging.level, "warn");
        assert_eq!(resolved.config.logging.format, "json");
    }

    #[test]
    fn test_invalid_merged_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[policy]\nminimum_mask = 6\nrecommended_mask = 2\n",
        )
        .unwrap();

        let result = load(&isolated(dir.path()));
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = isolated(dir.path());
        options.explicit_file = Some(dir.path().join("absent.toml"));
        assert!(matches!(load(&options), Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_load_file_nonexistent() {
        let result = load_file(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[policy\nrevision = ").unwrap();
        assert!(matches!(
            load_file(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_oversized_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("huge.toml");
        let data = "x = \"".to_owned() + &"a".repeat(1_100_000) + "\"";
        std::fs::write(&file_path, data).unwrap();

        let result = try_load_file(&file_path);
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_resolved_config_serializes() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = load(&isolated(dir.path())).unwrap();
        let json = serde_json::to_value(&resolved).unwrap();
        assert_eq!(json["field_sources"]["policy.revision"], "defaults");
    }
}
