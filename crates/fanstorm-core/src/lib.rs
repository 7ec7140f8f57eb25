//! # Fanstorm Core
//!
//! Data model shared by every fanstorm crate: ramp plans, virtual user
//! identities, broadcast sessions, progress samples and the run
//! configuration that ties them together.

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::ConfigError;
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
