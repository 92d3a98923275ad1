//! Common imports for tests.
//!
//! ```rust,ignore
//! use warrant_test::prelude::*;
//! ```

pub use crate::fixtures::{expiring_key_info, key_info, test_config};
pub use crate::mocks::MockKeyInfoProvider;
