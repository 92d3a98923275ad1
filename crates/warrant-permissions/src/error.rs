//! Permission-related error types.

use thiserror::Error;

/// Errors that can occur when parsing or registering permissions.
#[derive(Debug, Error)]
pub enum PermissionError {
    /// The permission string is malformed.
    #[error("invalid permission '{permission}': {reason}")]
    InvalidPermission {
        /// The rejected permission string.
        permission: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Wildcards can be held and granted but never registered as definitions.
    #[error("cannot register wildcard permission as a definition: {0}")]
    WildcardDefinition(String),

    /// Storage error (lock poisoned).
    #[error("storage error: {0}")]
    StorageError(String),
}

/// Result type for permission operations.
pub type PermissionResult<T> = Result<T, PermissionError>;
