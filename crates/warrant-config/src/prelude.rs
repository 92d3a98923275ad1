//! Common imports for working with warrant configuration.
//!
//! ```
//! use warrant_config::prelude::*;
//! ```

pub use crate::{
    Config, ConfigError, ConfigLayer, ConfigResult, LoadOptions, LoggingSection,
    MaintenanceSection, PolicyConfig, ProviderSection, ResolvedConfig,
};
