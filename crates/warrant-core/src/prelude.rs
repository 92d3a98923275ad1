//! Prelude module - commonly used types for convenient import.
//!
//! Use `use warrant_core::prelude::*;` to import all essential types.

// Identifiers
pub use crate::{ApplicationId, CredentialId, GrantId, IdentityId, KeyId, UserId};

// Keys
pub use crate::{KeyKind, KeyMask};

// Retry
pub use crate::{Backoff, lookup_with_backoff};

// Key authority
pub use crate::{IdentityInfo, KeyInfo, KeyInfoProvider, ProviderError};
