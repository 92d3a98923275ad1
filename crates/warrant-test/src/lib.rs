//! Warrant Test - Shared test utilities for the Warrant engine.
//!
//! This crate provides a scripted key authority and fixtures that can be
//! used across Warrant crates as a dev-dependency.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! warrant-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use warrant_core::{KeyId, KeyKind};
//! use warrant_test::{MockKeyInfoProvider, key_info};
//!
//! let provider = MockKeyInfoProvider::new()
//!     .with_key(KeyId(100), key_info(8, KeyKind::Character, &[(1, "Alice")]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;
