//! Warrant Permissions - hierarchical, wildcard-capable permission tokens.
//!
//! This crate provides:
//! - [`Permission`] parsing into exact and wildcard segments
//! - Segment-aligned matching ([`matches`], [`satisfies_any`])
//! - A [`PermissionRegistry`] of permission definitions
//!
//! # Example
//!
//! ```
//! use warrant_permissions::{Permission, PermissionRegistry, matches};
//!
//! let registry = PermissionRegistry::with_core().unwrap();
//! registry.init_perms([("jabber.send", "Send chat messages")]).unwrap();
//!
//! let held = [Permission::new("jabber.*").unwrap()];
//! assert!(matches(&held, &Permission::new("jabber.send").unwrap()));
//! assert!(!matches(&held, &Permission::new("core.user.list").unwrap()));
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
pub mod matcher;
mod permission;
mod registry;

pub use error::{PermissionError, PermissionResult};
pub use matcher::{matches, missing, satisfies_any};
pub use permission::{Permission, SEPARATOR, Segment, WILDCARD};
pub use registry::{CORE_PERMISSIONS, PermissionDefinition, PermissionRegistry};
