//! Warrant Core - Foundation types for the Warrant credential and permission engine.
//!
//! This crate provides:
//! - Identifier types for users, credentials, identities, applications and grants
//! - API key masks and key kinds
//! - The [`KeyInfoProvider`] interface to the external key authority
//! - Exponential backoff for lookups at the key authority

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod key;
pub mod provider;
pub mod retry;
pub mod types;

pub use key::{KeyKind, KeyKindParseError, KeyMask};
pub use provider::{IdentityInfo, KeyInfo, KeyInfoProvider, ProviderError};
pub use retry::{Backoff, lookup_with_backoff};
pub use types::{ApplicationId, CredentialId, GrantId, IdentityId, KeyId, UserId};
