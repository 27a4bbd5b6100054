//! # Raw Station Audit
//!
//! Diagnostic mirror of everything a station sends: each read becomes one
//! base64 line in `<dir>/<service>_raw.log` (rolled daily). Writes go through a
//! lossy non-blocking worker, so a slow disk drops lines instead of stalling
//! ingestion.

use std::io::{self, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling;

/// Fire-and-forget sink for raw received bytes.
pub trait FrameAudit: Send + Sync {
    /// Records one chunk exactly as it was read.
    fn record(&self, raw: &[u8]);
}

/// Base64 line writer backed by a daily rolling file.
pub struct RawAuditLog {
    writer: NonBlocking,
    _guard: WorkerGuard,
}

impl RawAuditLog {
    /// Opens (creating `dir` if needed) the audit file for `service`.
    pub fn open(dir: &Path, service: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let appender = rolling::daily(dir, format!("{}_raw.log", service));
        let (writer, guard) = NonBlockingBuilder::default().lossy(true).finish(appender);
        Ok(Self { writer, _guard: guard })
    }
}

impl FrameAudit for RawAuditLog {
    fn record(&self, raw: &[u8]) {
        let mut line = STANDARD.encode(raw);
        line.push('\n');
        let mut writer = self.writer.clone();
        if let Err(e) = writer.write_all(line.as_bytes()) {
            log::debug!("Raw audit line dropped: {}", e);
        }
    }
}

impl std::fmt::Debug for RawAuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawAuditLog").finish_non_exhaustive()
    }
}
