//! Warrant Engine - Credential and permission consistency engine.
//!
//! This crate keeps API keys, the in-game identities they prove, the
//! applications users authorize, and the grants tying them together
//! consistent with each other and with the operator's key policy.
//!
//! # Components
//!
//! - **Policy**: [`KeyPolicyValidator`] checks keys against minimum and
//!   recommended masks and kinds, and passwords against the strength threshold.
//! - **Credentials**: [`CredentialStore`] with global key id uniqueness and
//!   duplicate purging for imported data.
//! - **Identities**: [`IdentityDirectory`] resolves keys through the
//!   external [`KeyInfoProvider`], moves identities between owners and
//!   keeps every user's primary identity valid.
//! - **Applications**: [`ApplicationRegistry`] with write-once short names
//!   that become permission namespaces.
//! - **Grants**: [`GrantManager`] authorizes applications for identity sets
//!   and answers permission checks.
//! - **Maintenance**: [`MaintenanceRunner`] runs purges, orphan removal,
//!   legacy grant migration and expiry as single-flight jobs.
//!
//! [`Engine`] wires all of these from a [`warrant_config::Config`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warrant_engine::prelude::*;
//!
//! let engine = Engine::new(&config, Arc::new(provider))?;
//! let user = engine.create_user("alice", 4)?;
//! let (credential, identities) = engine.add_key(user.id, KeyId(100), "code").await?;
//! ```
//!
//! [`KeyInfoProvider`]: warrant_core::KeyInfoProvider

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod application;
pub mod credential;
pub mod engine;
/// Error types and results for the engine.
pub mod error;
pub mod grant;
pub mod identity;
pub mod maintenance;
pub mod migration;
pub mod policy;
pub mod users;

pub use application::{Application, ApplicationRegistry, validate_short_name};
pub use credential::{
    Credential, CredentialStore, LIST_ALL_PERMISSION, PurgeReport, PurgedCredential, Violation,
};
pub use engine::{Engine, MANAGE_APPLICATIONS_PERMISSION, UserDeletion};
pub use error::{EngineError, EngineResult};
pub use grant::{Grant, GrantChanges, GrantFormat, GrantManager, GrantStore, RevokeTarget};
pub use identity::{
    BindOutcome, Detached, Identity, IdentityDirectory, IdentityStore, OrphanReport,
    PrimaryChange,
};
pub use maintenance::{
    DuplicatePurgeReport, ExpiryReport, MaintenanceReport, MaintenanceRunner, RefreshReport,
};
pub use migration::{
    LEGACY_GRANT_MIGRATION_VERSION, MergedGroup, MigrationFailure, MigrationReport,
    migrate_legacy_grants,
};
pub use policy::{KeyPolicy, KeyPolicyValidator, PolicyOutcome};
pub use users::{LoginRecord, User, UserStore};
