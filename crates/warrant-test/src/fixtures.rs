//! Test fixtures for common types.

use warrant_config::Config;
use warrant_core::{IdentityInfo, KeyInfo, KeyKind, KeyMask};

/// Build a key authority answer with the given identities.
#[must_use]
pub fn key_info(mask: u64, kind: KeyKind, identities: &[(u64, &str)]) -> KeyInfo {
    KeyInfo {
        mask: KeyMask(mask),
        kind,
        expires: None,
        identities: identities
            .iter()
            .map(|(id, name)| IdentityInfo::new(*id, *name))
            .collect(),
    }
}

/// A key authority answer that expires at `expires`.
#[must_use]
pub fn expiring_key_info(
    mask: u64,
    kind: KeyKind,
    identities: &[(u64, &str)],
    expires: chrono::DateTime<chrono::Utc>,
) -> KeyInfo {
    KeyInfo {
        expires: Some(expires),
        ..key_info(mask, kind, identities)
    }
}

/// Default configuration with a permissive password threshold, suitable for
/// tests that create users.
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.policy.required_password_strength = 0;
    config.provider.max_retries = 0;
    config.provider.initial_backoff_ms = 1;
    config.provider.max_backoff_ms = 1;
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_info_fixture() {
        let info = key_info(8, KeyKind::Account, &[(1, "A"), (2, "B")]);
        assert_eq!(info.mask, KeyMask(8));
        assert_eq!(info.identities.len(), 2);
        assert!(info.expires.is_none());
    }

    #[test]
    fn test_config_disables_retries() {
        let config = test_config();
        assert_eq!(config.provider.max_retries, 0);
        assert_eq!(config.policy.required_password_strength, 0);
    }
}
