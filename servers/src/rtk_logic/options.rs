use clap::Parser;
use std::path::{Path, PathBuf};

use lib_common::configs::{RelayConfig, WebInterface};

#[derive(Parser, Debug, Clone)]
#[command(about = "RTK correction relay: one station in, many rovers out", version)]
pub struct Options {
    #[arg(long, env = "RTK_CONF_DIR", default_value = "./conf", help = "Directory holding config.json and extra *.json entry files.")]
    pub conf_dir: PathBuf,

    #[arg(long, env = "RTK_LOG_DIR", help = "Directory for log files. Defaults to logPath from config.json, then ./logs.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "RTK_LOG_LEVEL", default_value = "info", help = "Logging level (trace, debug, info, warn, error) used when RUST_LOG is unset.")]
    pub log_level: String,

    #[arg(long, env = "RTK_WEB_PORT", help = "Overrides webInterface.port of config.json.")]
    pub web_port: Option<u16>,
}

impl Options {
    /// Command line and environment first, then an existing `logPath`, then `./logs`.
    pub fn resolve_log_dir(&self, config: &RelayConfig) -> PathBuf {
        if let Some(dir) = &self.log_dir {
            return dir.clone();
        }
        match &config.log_path {
            Some(path) if Path::new(path).is_dir() => path.clone(),
            _ => PathBuf::from("./logs"),
        }
    }

    /// Dashboard port, if the dashboard is enabled.
    pub fn resolve_web_port(&self, config: &RelayConfig) -> Option<u16> {
        match config.web_interface {
            Some(WebInterface { port, allow: true }) => Some(self.web_port.unwrap_or(port)),
            _ => None,
        }
    }
}
