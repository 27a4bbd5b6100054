//! # Service Supervisor
//!
//! Runs one supervised task per configured service. A service that ends
//! without being asked to (listener lost, actor panic) is started again after
//! a fixed backoff. `apply` reconciles the running set with a freshly loaded
//! configuration: removed names are stopped, changed entries restarted, equal
//! ones left alone.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::Entry;
use crate::core::service::{RtkService, ServiceDeps, ServiceExit};
use crate::core::station::pause;
use crate::core::status::Transition;

/// Default pause before restarting a failed service.
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(3);

struct Supervised {
    entry: Entry,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// What a call to [`Supervisor::apply`] changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    /// Newly started names.
    pub started: Vec<String>,
    /// Names restarted because their entry changed.
    pub restarted: Vec<String>,
    /// Names stopped because they are gone.
    pub stopped: Vec<String>,
    /// Names left running untouched.
    pub unchanged: Vec<String>,
}

/// # Supervisor
///
/// Owner of every running service of the process.
pub struct Supervisor {
    deps: ServiceDeps,
    backoff: Duration,
    root: CancellationToken,
    services: BTreeMap<String, Supervised>,
}

impl Supervisor {
    /// Creates a supervisor with no services.
    pub fn new(deps: ServiceDeps, backoff: Duration) -> Self {
        Self {
            deps,
            backoff,
            root: CancellationToken::new(),
            services: BTreeMap::new(),
        }
    }

    /// Names of the supervised services.
    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Reconciles the running services with `entries`.
    pub async fn apply(&mut self, entries: &BTreeMap<String, Entry>) -> ApplySummary {
        let mut summary = ApplySummary::default();

        let gone: Vec<String> = self
            .services
            .keys()
            .filter(|name| !entries.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            self.stop_one(&name).await;
            self.deps.status.forget(&name);
            summary.stopped.push(name);
        }

        for (name, entry) in entries {
            match self.services.get(name) {
                Some(running) if running.entry == *entry && !running.task.is_finished() => {
                    summary.unchanged.push(name.clone());
                    continue;
                }
                Some(_) => {
                    self.stop_one(name).await;
                    summary.restarted.push(name.clone());
                }
                None => summary.started.push(name.clone()),
            }
            self.start_one(entry.clone());
        }

        log::info!(
            "Configuration applied: {} started, {} restarted, {} stopped, {} unchanged",
            summary.started.len(),
            summary.restarted.len(),
            summary.stopped.len(),
            summary.unchanged.len()
        );
        summary
    }

    /// Stops every service and waits for all of them.
    pub async fn shutdown(&mut self) {
        self.root.cancel();
        let names = self.names();
        for name in names {
            self.stop_one(&name).await;
        }
    }

    fn start_one(&mut self, entry: Entry) {
        let cancel = self.root.child_token();
        let task = tokio::spawn(supervise(entry.clone(), self.deps.clone(), self.backoff, cancel.clone()));
        self.services.insert(entry.name.clone(), Supervised { entry, cancel, task });
    }

    async fn stop_one(&mut self, name: &str) {
        if let Some(supervised) = self.services.remove(name) {
            supervised.cancel.cancel();
            if let Err(e) = supervised.task.await {
                log::error!("{}: supervisor task failed: {}", name, e);
            }
        }
    }
}

async fn supervise(entry: Entry, deps: ServiceDeps, backoff: Duration, cancel: CancellationToken) {
    let name = entry.name.clone();
    deps.status.register(&name);

    loop {
        match RtkService::start(entry.clone(), deps.clone(), &cancel).await {
            Ok(mut service) => {
                let exit = tokio::select! {
                    _ = cancel.cancelled() => {
                        service.stop().await;
                        break;
                    }
                    exit = service.wait() => exit,
                };
                if exit == ServiceExit::Stopped && cancel.is_cancelled() {
                    break;
                }
                log::warn!("{}: service ended ({:?}), restarting in {:?}", name, exit, backoff);
            }
            Err(e) if !e.is_retryable() => {
                log::error!("{}: cannot start: {}", name, e);
                break;
            }
            Err(e) => {
                log::error!("{}: failed to start: {}, retrying in {:?}", name, e, backoff);
            }
        }

        if !pause(&cancel, backoff).await {
            break;
        }
    }

    deps.status.report(&name, Transition::Terminated);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::net::{TcpListener, TcpStream};

    use crate::configs::StationMode;
    use crate::core::station::LinkTimings;
    use crate::core::status::{RtkState, StatusTracker};

    async fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port()
    }

    fn entry(name: &str, listen_port: u16, station_port: u16) -> Entry {
        Entry {
            name: name.to_string(),
            listen_port,
            station: StationMode::Accept { port: station_port },
            control_port: None,
            filter: None,
            enable_log: false,
            enable_raw: false,
            handshake: None,
        }
    }

    fn supervisor(tracker: &Arc<StatusTracker>) -> Supervisor {
        let mut deps = ServiceDeps::new(tracker.clone());
        deps.link_timings = LinkTimings::fast();
        Supervisor::new(deps, Duration::from_millis(50))
    }

    async fn eventually_listening(port: u16) -> bool {
        for _ in 0..100 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn apply_reconciles_and_shutdown_terminates() {
        let tracker = Arc::new(StatusTracker::new());
        let mut sup = supervisor(&tracker);

        let (a_listen, a_station, b_listen, b_station) = (free_port().await, free_port().await, free_port().await, free_port().await);
        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), entry("a", a_listen, a_station));
        entries.insert("b".to_string(), entry("b", b_listen, b_station));

        let summary = sup.apply(&entries).await;
        assert_eq!(summary.started, vec!["a".to_string(), "b".to_string()]);
        assert!(eventually_listening(a_listen).await);
        assert!(eventually_listening(b_listen).await);

        let summary = sup.apply(&entries).await;
        assert_eq!(summary.unchanged.len(), 2);

        let new_listen = free_port().await;
        entries.remove("b");
        entries.insert("a".to_string(), entry("a", new_listen, a_station));
        let summary = sup.apply(&entries).await;
        assert_eq!(summary.stopped, vec!["b".to_string()]);
        assert_eq!(summary.restarted, vec!["a".to_string()]);
        assert!(tracker.get("b").is_none());
        assert!(eventually_listening(new_listen).await);
        assert!(TcpStream::connect(("127.0.0.1", b_listen)).await.is_err());

        sup.shutdown().await;
        assert_eq!(tracker.get("a").unwrap().state, RtkState::Terminated);
        assert!(sup.names().is_empty());
    }

    #[tokio::test]
    async fn service_that_cannot_bind_is_retried_until_port_frees() {
        let tracker = Arc::new(StatusTracker::new());
        let mut sup = supervisor(&tracker);

        let blocker = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();
        let station_port = free_port().await;
        let mut entries = BTreeMap::new();
        entries.insert("late".to_string(), entry("late", port, station_port));

        sup.apply(&entries).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        drop(blocker);

        assert!(eventually_listening(port).await);
        sup.shutdown().await;
    }
}
