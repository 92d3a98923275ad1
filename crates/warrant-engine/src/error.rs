//! Engine error types.

use std::fmt;
use std::sync::PoisonError;

use thiserror::Error;
use warrant_config::ConfigError;
use warrant_core::{ApplicationId, CredentialId, IdentityId, KeyId, KeyMask, ProviderError, UserId};
use warrant_permissions::PermissionError;

use crate::policy::PolicyOutcome;

/// Errors returned by engine operations.
///
/// None of these is fatal to the process. Request-level errors are surfaced
/// to the caller; maintenance jobs report per-record failures and can be
/// re-run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A credential with this key id is already stored, for any user.
    #[error("key {0} is already registered")]
    DuplicateKey(KeyId),

    /// The key mask is below the operator's minimum.
    #[error("key mask {mask} is below the minimum {minimum}")]
    InvalidMask {
        /// Mask of the offered key.
        mask: KeyMask,
        /// Configured minimum mask.
        minimum: KeyMask,
    },

    /// A credential backing one of the requested identities fails policy.
    #[error("key backing {identity} fails policy: {outcome}")]
    KeyPolicy {
        /// The identity whose credential failed.
        identity: IdentityId,
        /// Why it failed.
        outcome: PolicyOutcome,
    },

    /// The caller asked for permissions it does not hold.
    #[error("insufficient permission, missing: {}", .missing.join(", "))]
    InsufficientPermission {
        /// Requested permissions not covered by the caller's entitlement.
        missing: Vec<String>,
    },

    /// Merging a legacy grant group would drop data.
    #[error("cannot merge legacy grants of {user} for {application}: {reason}")]
    MigrationConsistency {
        /// Grant owner.
        user: UserId,
        /// Grant target.
        application: ApplicationId,
        /// What is inconsistent.
        reason: String,
    },

    /// The application has no short name yet.
    #[error("{0} has no short name and cannot be authorized")]
    ApplicationNotReady(ApplicationId),

    /// The short name was already set to something else.
    #[error("short name of {application} is already '{current}'")]
    ShortNameImmutable {
        /// The application.
        application: ApplicationId,
        /// Its existing short name.
        current: String,
    },

    /// The short name is not a usable permission namespace.
    #[error("invalid short name '{name}': {reason}")]
    InvalidShortName {
        /// Rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A unique name is already in use.
    #[error("name already taken: {0}")]
    NameTaken(String),

    /// Password strength score below the operator threshold.
    #[error("password strength {score} is below the required {required}")]
    WeakPassword {
        /// Estimated score.
        score: u8,
        /// Required score.
        required: u8,
    },

    /// The credential is marked invalid.
    #[error("{0} is no longer valid")]
    InvalidCredential(CredentialId),

    /// A grant was requested with an empty identity set.
    #[error("a grant must cover at least one identity")]
    NoIdentities,

    /// The referenced record does not exist or is not visible to the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// The key authority failed.
    #[error("key authority error: {0}")]
    Provider(#[from] ProviderError),

    /// Another run of the maintenance job is in progress.
    #[error("maintenance job '{0}' is already running")]
    MaintenanceBusy(String),

    /// Permission parsing or registry error.
    #[error(transparent)]
    Permission(#[from] PermissionError),

    /// Invalid engine configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Report serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A store lock was poisoned.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub(crate) fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub(crate) fn poisoned<T>(e: &PoisonError<T>) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_permission_lists_missing() {
        let err = EngineError::InsufficientPermission {
            missing: vec!["core.user.list".into(), "jabber.send".into()],
        };
        assert_eq!(
            err.to_string(),
            "insufficient permission, missing: core.user.list, jabber.send"
        );
    }

    #[test]
    fn test_provider_error_converts() {
        let err: EngineError = ProviderError::Revoked(KeyId(100)).into();
        assert!(matches!(err, EngineError::Provider(ProviderError::Revoked(KeyId(100)))));
    }
}
