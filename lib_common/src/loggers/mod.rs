/// Installs the process-wide `tracing` subscriber (console + rolling JSON file).
pub mod tracing_setup;
/// Base64 mirror of raw station bytes, one line per read.
pub mod raw_audit;

pub use raw_audit::{FrameAudit, RawAuditLog};
pub use tracing_setup::{init_tracing, LogSettings};
