//! # lib_common
//!
//! Shared library of the RTK relay workspace. Each top-level folder is gated by
//! a cargo feature of the same name so binaries only pull what they use.

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "loggers")]
pub mod loggers;
