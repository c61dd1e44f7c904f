//! # migrate-rs-core
//!
//! Core types for the migrate-rs workspace: the error taxonomy, driver
//! configuration, configuration loading, and logging setup. Every other
//! crate in the workspace builds on these.
//!
//! ## Modules
//!
//! - [`error`] - `MigrateError` and the result alias
//! - [`settings`] - `DriverConfig` and its nested settings
//! - [`settings_loader`] - TOML / JSON / environment / URI loading
//! - [`logging`] - tracing subscriber setup and run spans

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{DropFailure, MigrateError, MigrateResult};
pub use settings::{DriverConfig, LockingSettings, LogSettings};
