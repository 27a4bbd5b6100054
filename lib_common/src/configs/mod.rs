//! # Configuration Modules
//!
//! Loading and validation of the relay service definitions.

/// JSON service entries, the directory merge rule and validation errors.
pub mod config_rtk;

pub use config_rtk::{load_config, ConfigError, Entry, HandshakeSpec, RelayConfig, StationMode, WebInterface};
