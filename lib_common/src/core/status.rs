//! # Service Status Tracking
//!
//! Keeps one [`StatusRecord`] per relay service and applies the transitions
//! reported by the station links. The tracker is shared through the
//! [`StatusSink`] trait and handed to each service as a [`ServiceStatus`]
//! bound to its name, so nothing here is process-global.
//!
//! ## State Machine
//!
//! ```text
//!   Unknown/Offline --Connected--> Online
//!   any non-terminal --Received--> Receiving   (stamps last_received_at)
//!   any non-terminal --Disconnected--> Offline
//!   any --Terminated--> Terminated             (final)
//! ```
//!
//! `Connected` never downgrades a `Receiving` service: a new station link
//! replacing an old one keeps showing data flow until it actually stops.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Local};
use serde::Serialize;

/// Externally visible state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RtkState {
    /// Registered, no link seen yet.
    Unknown,
    /// Station link established.
    Online,
    /// Data is flowing.
    Receiving,
    /// Station link lost.
    Offline,
    /// Service stopped for good.
    Terminated,
}

impl fmt::Display for RtkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RtkState::Unknown => "unknown",
            RtkState::Online => "online",
            RtkState::Receiving => "receiving",
            RtkState::Offline => "offline",
            RtkState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Event reported by a station link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A station link became authoritative.
    Connected,
    /// A structurally valid frame arrived.
    Received,
    /// The authoritative link ended.
    Disconnected,
    /// The service was stopped.
    Terminated,
}

impl RtkState {
    /// Applies `transition`, returning the next state.
    pub fn apply(self, transition: Transition) -> RtkState {
        match (self, transition) {
            (RtkState::Terminated, _) => RtkState::Terminated,
            (_, Transition::Terminated) => RtkState::Terminated,
            (RtkState::Unknown | RtkState::Offline, Transition::Connected) => RtkState::Online,
            (state, Transition::Connected) => state,
            (_, Transition::Received) => RtkState::Receiving,
            (_, Transition::Disconnected) => RtkState::Offline,
        }
    }
}

/// Status of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    /// Current state.
    pub state: RtkState,
    /// When the last frame arrived, if ever.
    pub last_received_at: Option<DateTime<Local>>,
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self {
            state: RtkState::Unknown,
            last_received_at: None,
        }
    }
}

/// Receiver of status transitions, shared by all services.
pub trait StatusSink: Send + Sync {
    /// Creates the record for `name`, or resets it to `Unknown` on restart.
    fn register(&self, name: &str);
    /// Drops the record for a service that no longer exists.
    fn forget(&self, name: &str);
    /// Applies a transition. Unregistered names are ignored.
    fn report(&self, name: &str, transition: Transition);
}

/// Serializable view of the whole table, for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Time the snapshot was taken.
    pub server_time: DateTime<Local>,
    /// Time the tracker was created.
    pub started_at: DateTime<Local>,
    /// One row per service, ordered by name.
    pub services: Vec<ServiceRow>,
}

/// One dashboard row.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRow {
    /// Service name.
    pub name: String,
    /// Current state.
    pub state: RtkState,
    /// Last frame time.
    pub last_received_at: Option<DateTime<Local>>,
}

/// # Status Tracker
///
/// The in-memory status table. Reads take a snapshot so callers never hold the
/// lock while formatting or doing I/O.
#[derive(Debug)]
pub struct StatusTracker {
    records: RwLock<BTreeMap<String, StatusRecord>>,
    started_at: DateTime<Local>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    /// Creates an empty table stamped with the current time.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            started_at: Local::now(),
        }
    }

    /// Current record of `name`.
    pub fn get(&self, name: &str) -> Option<StatusRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// When the tracker was created.
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Copies the whole table.
    pub fn snapshot(&self) -> StatusSnapshot {
        let services = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, record)| ServiceRow {
                name: name.clone(),
                state: record.state,
                last_received_at: record.last_received_at,
            })
            .collect();
        StatusSnapshot {
            server_time: Local::now(),
            started_at: self.started_at,
            services,
        }
    }
}

impl StatusSink for StatusTracker {
    fn register(&self, name: &str) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), StatusRecord::default());
    }

    fn forget(&self, name: &str) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    fn report(&self, name: &str, transition: Transition) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = records.get_mut(name) else {
            return;
        };
        let next = record.state.apply(transition);
        if next != record.state {
            log::info!("{}: status {} -> {}", name, record.state, next);
        }
        if transition == Transition::Received && record.state != RtkState::Terminated {
            record.last_received_at = Some(Local::now());
        }
        record.state = next;
    }
}

/// A [`StatusSink`] bound to one service name.
#[derive(Clone)]
pub struct ServiceStatus {
    name: Arc<str>,
    sink: Arc<dyn StatusSink>,
}

impl ServiceStatus {
    /// Binds `sink` to `name`.
    pub fn new(name: &str, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            name: Arc::from(name),
            sink,
        }
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports a transition for this service.
    pub fn report(&self, transition: Transition) {
        self.sink.report(&self.name, transition);
    }
}

impl fmt::Debug for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceStatus").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_does_not_downgrade_receiving() {
        assert_eq!(RtkState::Receiving.apply(Transition::Connected), RtkState::Receiving);
        assert_eq!(RtkState::Online.apply(Transition::Connected), RtkState::Online);
        assert_eq!(RtkState::Offline.apply(Transition::Connected), RtkState::Online);
        assert_eq!(RtkState::Unknown.apply(Transition::Connected), RtkState::Online);
    }

    #[test]
    fn terminated_is_final() {
        for t in [Transition::Connected, Transition::Received, Transition::Disconnected] {
            assert_eq!(RtkState::Terminated.apply(t), RtkState::Terminated);
        }
        assert_eq!(RtkState::Receiving.apply(Transition::Terminated), RtkState::Terminated);
    }

    #[test]
    fn tracker_stamps_receive_time_and_ignores_unknown_names() {
        let tracker = StatusTracker::new();
        tracker.register("base");
        tracker.report("ghost", Transition::Connected);
        assert!(tracker.get("ghost").is_none());

        tracker.report("base", Transition::Connected);
        assert_eq!(tracker.get("base").unwrap().state, RtkState::Online);
        assert!(tracker.get("base").unwrap().last_received_at.is_none());

        tracker.report("base", Transition::Received);
        let record = tracker.get("base").unwrap();
        assert_eq!(record.state, RtkState::Receiving);
        assert!(record.last_received_at.is_some());

        tracker.report("base", Transition::Disconnected);
        assert_eq!(tracker.get("base").unwrap().state, RtkState::Offline);
        assert!(tracker.get("base").unwrap().last_received_at.is_some());
    }

    #[test]
    fn register_resets_and_snapshot_is_ordered() {
        let tracker = Arc::new(StatusTracker::new());
        let status = ServiceStatus::new("zeta", tracker.clone());
        tracker.register("zeta");
        tracker.register("alpha");
        status.report(Transition::Terminated);
        tracker.register("zeta");
        assert_eq!(tracker.get("zeta").unwrap().state, RtkState::Unknown);

        let names: Vec<String> = tracker.snapshot().services.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);

        tracker.forget("alpha");
        assert_eq!(tracker.snapshot().services.len(), 1);
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RtkState::Receiving).unwrap(), "\"receiving\"");
    }
}
