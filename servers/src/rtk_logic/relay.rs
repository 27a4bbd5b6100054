//! # Relay Runtime
//!
//! Glue between the process and the engine: owns the status tracker and the
//! supervisor, starts the dashboard, and re-applies the configuration
//! directory on `SIGHUP`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lib_common::configs::{load_config, RelayConfig};
use lib_common::core::{ServiceDeps, StatusTracker, Supervisor, DEFAULT_RESTART_BACKOFF};

use crate::rtk_logic::dashboard;

/// Everything [`run`] needs, resolved by `main` before logging starts.
pub struct RelaySetup {
    /// Directory re-read on reload.
    pub conf_dir: PathBuf,
    /// Configuration loaded at startup.
    pub config: RelayConfig,
    /// Directory for `<service>_raw.log` files.
    pub raw_log_dir: PathBuf,
    /// Dashboard port, if enabled.
    pub web_port: Option<u16>,
}

/// Runs the relay until `shutdown_guard` is cancelled.
pub async fn run(setup: RelaySetup, shutdown_guard: tokio_graceful::ShutdownGuard) {
    let tracker = Arc::new(StatusTracker::new());

    let mut deps = ServiceDeps::new(tracker.clone());
    deps.raw_log_dir = Some(setup.raw_log_dir);
    let mut supervisor = Supervisor::new(deps, DEFAULT_RESTART_BACKOFF);

    if setup.config.entries.is_empty() {
        tracing::warn!(dir = %setup.conf_dir.display(), "No valid service entries configured");
    }
    supervisor.apply(&setup.config.entries).await;

    if let Some(port) = setup.web_port {
        let tracker = tracker.clone();
        shutdown_guard.spawn_task_fn(move |guard| async move {
            if let Err(e) = dashboard::serve(port, tracker, guard).await {
                tracing::error!(port, "Dashboard failed: {:#}", e);
            }
        });
    } else {
        tracing::info!("Dashboard disabled");
    }

    wait_for_shutdown(&setup.conf_dir, &mut supervisor, &shutdown_guard).await;

    tracing::info!("Stopping {} services", supervisor.names().len());
    supervisor.shutdown().await;
}

/// Loads `conf_dir` again and reconciles the running services with it.
///
/// An unreadable directory keeps the current services untouched.
pub async fn reload(conf_dir: &Path, supervisor: &mut Supervisor) {
    match load_config(conf_dir) {
        Ok(config) => {
            let summary = supervisor.apply(&config.entries).await;
            tracing::info!(
                started = ?summary.started,
                restarted = ?summary.restarted,
                stopped = ?summary.stopped,
                rejected = config.rejected.len(),
                "Configuration reloaded"
            );
        }
        Err(e) => tracing::error!("Reload failed, keeping current services: {}", e),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(
    conf_dir: &Path,
    supervisor: &mut Supervisor,
    shutdown_guard: &tokio_graceful::ShutdownGuard,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!("SIGHUP handler unavailable, reload disabled: {}", e);
            shutdown_guard.cancelled().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown_guard.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    shutdown_guard.cancelled().await;
                    break;
                }
                tracing::info!("SIGHUP received, reloading {}", conf_dir.display());
                reload(conf_dir, supervisor).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(
    _conf_dir: &Path,
    _supervisor: &mut Supervisor,
    shutdown_guard: &tokio_graceful::ShutdownGuard,
) {
    shutdown_guard.cancelled().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::{TcpListener, TcpStream};

    async fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port()
    }

    async fn listening(port: u16) -> bool {
        for _ in 0..100 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn write_config(dir: &Path, listen: u16, station: u16) {
        let body = serde_json::json!({
            "entry": {
                "base": {
                    "stationMode": "client",
                    "stationPort": station,
                    "listenPort": listen
                }
            }
        });
        std::fs::write(dir.join("config.json"), body.to_string()).unwrap();
    }

    #[tokio::test]
    async fn reload_applies_new_directory_contents() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(StatusTracker::new());
        let mut supervisor = Supervisor::new(ServiceDeps::new(tracker.clone()), Duration::from_millis(50));
        let conf_dir = dir.path();

        let (first, station) = (free_port().await, free_port().await);
        write_config(dir.path(), first, station);
        reload(conf_dir, &mut supervisor).await;
        assert!(listening(first).await);

        let second = free_port().await;
        write_config(dir.path(), second, station);
        reload(conf_dir, &mut supervisor).await;
        assert!(listening(second).await);
        assert_eq!(supervisor.names(), vec!["base".to_string()]);

        std::fs::remove_file(dir.path().join("config.json")).unwrap();
        reload(conf_dir, &mut supervisor).await;
        assert!(supervisor.names().is_empty());
        assert!(tracker.get("base").is_none());

        supervisor.shutdown().await;
    }
}
