//! # RTK Correction Relay
//!
//! Receives RTCM3 correction streams from GNSS base stations and fans them out
//! to any number of rover clients, one relay service per configured entry.
//!
//! ## Core Responsibilities:
//! - **Configuration:** reads `config.json` and the other `*.json` files of the
//!   configuration directory; `SIGHUP` re-reads them and reconciles the
//!   running services.
//! - **Logging:** console plus a daily rolling JSON file, optional per-service
//!   raw audit of every received chunk.
//! - **Dashboard:** optional HTTP status page when `webInterface.allow` is set.
//! - **Lifecycle:** graceful shutdown on Ctrl+C / SIGTERM through
//!   `tokio-graceful`, bounded to ten seconds.

#![forbid(unsafe_code)]

mod rtk_logic;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_graceful::Shutdown;

use lib_common::configs::load_config;
use lib_common::loggers::{init_tracing, LogSettings};

use rtk_logic::options::Options;
use rtk_logic::relay::{self, RelaySetup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let options = Options::parse();

    let config = load_config(&options.conf_dir)
        .with_context(|| format!("cannot read configuration directory {}", options.conf_dir.display()))?;

    let log_dir = options.resolve_log_dir(&config);
    let _log_guard = init_tracing(&LogSettings {
        log_dir: log_dir.clone(),
        file_prefix: "server_rtk.log".to_string(),
        level: options.log_level.clone(),
        ansi: true,
    })
    .context("cannot initialize logging")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        conf_dir = %options.conf_dir.display(),
        log_dir = %log_dir.display(),
        services = config.entries.len(),
        "server_rtk starting"
    );
    for rejected in &config.rejected {
        tracing::error!("Configuration skipped: {}", rejected);
    }

    let setup = RelaySetup {
        conf_dir: options.conf_dir.clone(),
        web_port: options.resolve_web_port(&config),
        raw_log_dir: log_dir.join("raw"),
        config,
    };

    let shutdown: Shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| relay::run(setup, guard));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            tracing::info!("shutdown: gracefully {}s after shutdown signal received", elapsed.as_secs_f64());
        }
        Err(e) => {
            tracing::warn!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    tracing::info!("Bye!");
    Ok(())
}
