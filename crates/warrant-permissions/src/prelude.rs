//! Prelude module - commonly used types for convenient import.
//!
//! Use `use warrant_permissions::prelude::*;` to import all essential types.

// Errors
pub use crate::{PermissionError, PermissionResult};

// Permissions and matching
pub use crate::{Permission, Segment, matches, satisfies_any};

// Registry
pub use crate::{PermissionDefinition, PermissionRegistry};
