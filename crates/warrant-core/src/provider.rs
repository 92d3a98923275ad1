//! Interface to the external key authority.
//!
//! The authority reports, for an API key, its current scope mask, kind,
//! expiry and the identities it proves ownership of. Lookups are network
//! calls: they fail, they are slow, and a key can be revoked between two
//! calls. Implementations live outside this workspace; tests use the mock
//! in `warrant-test`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::{KeyKind, KeyMask};
use crate::types::{IdentityId, KeyId};

/// An identity reported by the key authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    /// External identity id.
    pub id: IdentityId,
    /// Display name.
    pub name: String,
    /// Corporation the identity belongs to, if reported.
    #[serde(default)]
    pub corporation: Option<String>,
}

impl IdentityInfo {
    /// Create identity info with no corporation.
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id: IdentityId(id),
            name: name.into(),
            corporation: None,
        }
    }

    /// Set the corporation.
    #[must_use]
    pub fn with_corporation(mut self, corporation: impl Into<String>) -> Self {
        self.corporation = Some(corporation.into());
        self
    }
}

/// What the key authority reports about a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Current scope mask.
    pub mask: KeyMask,
    /// Key kind.
    pub kind: KeyKind,
    /// When the key stops working, if it expires at all.
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    /// Identities the key proves ownership of.
    #[serde(default)]
    pub identities: Vec<IdentityInfo>,
}

/// Errors returned by a [`KeyInfoProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The authority refused the key: it was deleted or its code changed.
    #[error("key {0} was revoked by the key authority")]
    Revoked(KeyId),

    /// Network failure, timeout or authority-side outage.
    #[error("transient key authority failure: {0}")]
    Transient(String),

    /// The authority answered with something that could not be understood.
    #[error("malformed key authority response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether another attempt could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Resolves key details from the external key authority.
#[async_trait::async_trait]
pub trait KeyInfoProvider: Send + Sync {
    /// Look up `key_id` using its verification code.
    async fn key_info(
        &self,
        key_id: KeyId,
        verification_code: &str,
    ) -> Result<KeyInfo, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ProviderError::Transient("timeout".into()).is_retryable());
        assert!(!ProviderError::Revoked(KeyId(1)).is_retryable());
        assert!(!ProviderError::Malformed("no rows".into()).is_retryable());
    }

    #[test]
    fn test_key_info_deserializes_without_optional_fields() {
        let info: KeyInfo =
            serde_json::from_str(r#"{"mask": 8, "kind": "Character"}"#).unwrap();
        assert_eq!(info.mask, KeyMask(8));
        assert!(info.expires.is_none());
        assert!(info.identities.is_empty());
    }

    #[test]
    fn test_identity_info_builder() {
        let info = IdentityInfo::new(90, "Alice").with_corporation("Test Alliance");
        assert_eq!(info.id, IdentityId(90));
        assert_eq!(info.corporation.as_deref(), Some("Test Alliance"));
    }
}
