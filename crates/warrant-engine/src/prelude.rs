//! Prelude module - commonly used types for convenient import.
//!
//! Use `use warrant_engine::prelude::*;` to import all essential types.

// Errors
pub use crate::{EngineError, EngineResult};

// Facade
pub use crate::{Engine, UserDeletion};

// Records
pub use crate::{Application, Credential, Grant, Identity, User};

// Components
pub use crate::{
    ApplicationRegistry, CredentialStore, GrantManager, IdentityDirectory, KeyPolicyValidator,
    MaintenanceRunner, UserStore,
};

// Outcomes and reports
pub use crate::{
    GrantChanges, MaintenanceReport, MigrationReport, OrphanReport, PolicyOutcome, PrimaryChange,
    RevokeTarget,
};

// Core identifiers, re-exported for callers that only depend on the engine
pub use warrant_core::{
    ApplicationId, CredentialId, GrantId, IdentityId, KeyId, KeyKind, KeyMask, UserId,
};
pub use warrant_permissions::Permission;
