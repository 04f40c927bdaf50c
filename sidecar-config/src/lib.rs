//! Configuration for the restore engine.
//!
//! [`load_config`] resolves a [`SidecarConfig`] from the environment or a
//! file and checks it with [`apply_guard_rails`]; its logging section
//! drives [`init_tracing`].

#![allow(missing_docs)]

pub mod loader;
pub mod logging;
pub mod models;
pub mod validation;

pub use loader::{
    CONFIG_INLINE_ENV, CONFIG_PATH_ENV, ConfigFormat, ConfigLoad, ConfigLoadError,
    ConfigSource, discover, load_config,
};
pub use logging::init_tracing;
pub use models::{LoggingConfig, SidecarConfig};
pub use validation::{
    ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails,
};
