//! # Core Relay Engine
//!
//! Everything between a station socket and the rover sockets.
//!
//! ## Core Components:
//!
//! - **`rtcm`**: the pure RTCM3 framer. Buffers raw reads, resynchronizes on
//!   noise and CRC failures, filters by message type.
//!
//! - **`station`**: keeps one authoritative station link per service, either by
//!   dialing out with reconnect, or by accepting inbound sockets and promoting
//!   the first one that completes its handshake.
//!
//! - **`dispatcher`** / **`session`** / **`server`**: the downstream side. Each
//!   consumer gets a task and a small drop-oldest queue; broadcasting never
//!   waits on a socket.
//!
//! - **`status`**: the per-service state machine read by the dashboard.
//!
//! - **`service`**, **`control`**, **`command`**, **`supervisor`**: wiring of one
//!   configured entry, its line-oriented control port, and the restart loop
//!   around all of them.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Line commands of the control port and their replies.
pub mod command;
/// Control port listener.
pub mod control;
/// Fan-out of frames to downstream sessions.
pub mod dispatcher;
/// Error type of the engine.
pub mod error;
/// RTCM3 framing, CRC-24Q and message type filtering.
pub mod rtcm;
/// Downstream listener owning a dispatcher.
pub mod server;
/// One running relay service.
pub mod service;
/// Per-consumer task and its bounded queue.
pub mod session;
/// Station link management: dial, accept, arbitration.
pub mod station;
/// Service status state machine and table.
pub mod status;
/// Restart loop and configuration reconciliation.
pub mod supervisor;

// --- Public API Re-exports ---
pub use command::{AdminCommand, CommandReply};
pub use dispatcher::Dispatcher;
pub use error::RelayError;
pub use rtcm::{FilterSpec, Frame, FrameParser, ParseEvent};
pub use server::DownstreamServer;
pub use service::{RtkService, ServiceDeps, ServiceExit};
pub use session::{SessionInfo, SessionTimings};
pub use station::{LinkTimings, StationHandle};
pub use status::{RtkState, ServiceStatus, StatusSink, StatusSnapshot, StatusTracker, Transition};
pub use supervisor::{ApplySummary, Supervisor, DEFAULT_RESTART_BACKOFF};
