//! # Station Ingestion
//!
//! Keeps exactly one authoritative link to the correction source of a service.
//!
//! - **`dial`**: the station is a TCP server; connect, run, reconnect with a
//!   fixed backoff.
//! - **`accept`**: the station dials us; every inbound socket is a candidate
//!   and the **`arbiter`** promotes the first one to finish its handshake.
//! - **`connection`**: the per-socket reader/parser/writer task both share.
//!
//! Both topologies feed the same [`Attachment`]: a frame channel drained by the
//! service actor plus the service's status view.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::StationMode;
use crate::core::error::RelayError;
use crate::core::rtcm::FilterSpec;
use crate::loggers::FrameAudit;

/// Accept-mode listener and its accept loop.
pub mod accept;
/// Candidate bookkeeping and promotion rules.
pub mod arbiter;
/// One station socket: reads, parsing, outbound writes, handshake.
pub mod connection;
/// Dial-mode reconnect loop.
pub mod dial;

pub use arbiter::{Arbiter, Candidate, TickOutcome};
pub use connection::{
    AcceptAny, Attachment, ConnectionOptions, Handshake, HandshakeFactory, LinkEnd, ProbeHandshake, Role,
    StationConnection,
};

/// Timeouts and intervals of the station side.
#[derive(Debug, Clone)]
pub struct LinkTimings {
    /// Bound on a single connect attempt (dial).
    pub connect_timeout: Duration,
    /// Bound on a single read.
    pub read_timeout: Duration,
    /// Consecutive read timeouts before the link is closed.
    pub max_idle_reads: u32,
    /// Pause after a failed connect attempt (dial).
    pub reconnect_backoff: Duration,
    /// How long a candidate may take to complete its handshake (accept).
    pub handshake_timeout: Duration,
    /// Candidate arbitration period (accept).
    pub arbitration_tick: Duration,
    /// Bound on writing probe or outbound bytes.
    pub write_timeout: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(3),
            max_idle_reads: 10,
            reconnect_backoff: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(10),
            arbitration_tick: Duration::from_millis(200),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl LinkTimings {
    /// Millisecond-scale timings for loopback tests.
    pub fn fast() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(50),
            max_idle_reads: 4,
            reconnect_backoff: Duration::from_millis(50),
            handshake_timeout: Duration::from_millis(300),
            arbitration_tick: Duration::from_millis(20),
            write_timeout: Duration::from_millis(500),
        }
    }
}

/// Outbound queue of whichever link is currently authoritative.
#[derive(Debug, Clone, Default)]
pub struct ActiveOutbound(Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>);

impl ActiveOutbound {
    fn set(&self, tx: mpsc::UnboundedSender<Bytes>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Queues `bytes` for the active link, returning how many were queued.
    pub fn send(&self, bytes: Bytes) -> Result<usize, RelayError> {
        let len = bytes.len();
        let guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(bytes).map(|_| len).map_err(|_| RelayError::NoActiveStation),
            None => Err(RelayError::NoActiveStation),
        }
    }
}

/// Everything a station manager needs to build connections.
#[derive(Clone)]
pub struct StationContext {
    /// Service name, for logs.
    pub service: Arc<str>,
    /// Message type filter for every connection.
    pub filter: FilterSpec,
    /// Timeouts.
    pub timings: LinkTimings,
    /// Output of the authoritative link.
    pub attachment: Attachment,
    /// Raw mirror of every read.
    pub audit: Option<Arc<dyn FrameAudit>>,
    /// Per-read debug logging.
    pub verbose: bool,
    /// Handshake for accepted candidates.
    pub handshake: HandshakeFactory,
}

impl StationContext {
    fn options(&self, id: u64) -> ConnectionOptions {
        ConnectionOptions {
            id,
            service: Arc::clone(&self.service),
            filter: self.filter.clone(),
            timings: self.timings.clone(),
            audit: self.audit.clone(),
            verbose: self.verbose,
        }
    }
}

/// Sleeps for `delay`; returns false if cancelled first.
pub(crate) async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// # Station Handle
///
/// Owns the dial or accept manager task of one service.
pub struct StationHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    active: ActiveOutbound,
    local_addr: Option<SocketAddr>,
}

impl StationHandle {
    /// Starts the manager matching `mode`. Accept mode binds its listener
    /// before returning so bind failures surface here.
    pub async fn start(
        mode: &StationMode,
        ctx: StationContext,
        parent: &CancellationToken,
    ) -> Result<Self, RelayError> {
        let cancel = parent.child_token();
        let active = ActiveOutbound::default();

        let (task, local_addr) = match mode {
            StationMode::Dial { address, port } => {
                let task = tokio::spawn(dial::run(address.clone(), *port, ctx, active.clone(), cancel.clone()));
                (task, None)
            }
            StationMode::Accept { port } => {
                let listener = TcpListener::bind(("0.0.0.0", *port))
                    .await
                    .map_err(|source| RelayError::Bind { what: "station", port: *port, source })?;
                let local = listener.local_addr()?;
                let task = tokio::spawn(accept::run(listener, ctx, active.clone(), cancel.clone()));
                (task, Some(local))
            }
        };

        Ok(Self {
            cancel,
            task: Some(task),
            active,
            local_addr,
        })
    }

    /// Station listener address (accept mode only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Queues bytes for the authoritative link.
    pub fn send(&self, bytes: Bytes) -> Result<usize, RelayError> {
        self.active.send(bytes)
    }

    /// Waits for the manager task to end. Cancel-safe.
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(e) = task.await {
                log::error!("Station manager task failed: {}", e);
            }
            self.task = None;
        }
    }

    /// Stops the manager and every connection it owns, then waits.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        self.wait().await;
    }
}
