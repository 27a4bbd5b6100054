//! # Relay Service Configuration
//!
//! Reads the service definitions from a configuration directory.
//!
//! `config.json` is the main file. Every other `*.json` file in the same
//! directory may contribute extra `entry` items, visited in file-name order; an
//! entry name that is already defined is never overridden, so the main file
//! always wins.
//!
//! ```json
//! {
//!   "entry": {
//!     "base1": {
//!       "stationMode": "client",
//!       "stationPort": 5001,
//!       "listenPort": 6001,
//!       "controlPort": 7001,
//!       "filter": [1005, 1077],
//!       "enableRaw": "true"
//!     }
//!   },
//!   "webInterface": { "port": 8080, "allow": "true" },
//!   "logPath": "/var/log/rtk"
//! }
//! ```
//!
//! Entries are validated one by one: a malformed entry is logged and skipped,
//! the others still load.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Name of the main configuration file inside the configuration directory.
pub const MAIN_CONFIG_FILE: &str = "config.json";

/// Everything that can go wrong while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file or the directory could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A file is not valid JSON or has the wrong top-level shape.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// An entry has the wrong shape (e.g. a string where a list is expected).
    #[error("entry '{name}' is malformed: {source}")]
    MalformedEntry {
        /// Entry name.
        name: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// A required key is absent.
    #[error("entry '{name}' is missing '{field}'")]
    MissingField {
        /// Entry name.
        name: String,
        /// Missing key.
        field: &'static str,
    },
    /// `stationMode` is neither `server` nor `client`.
    #[error("entry '{name}': unrecognized station mode \"{mode}\", should be \"server\" or \"client\"")]
    UnrecognizedStationMode {
        /// Entry name.
        name: String,
        /// Value found.
        mode: String,
    },
    /// `stationMode` is `server` but no address to dial was given.
    #[error("entry '{name}': station mode is \"server\" but stationIpAddress is not set")]
    MissingStationAddress {
        /// Entry name.
        name: String,
    },
    /// A port value is not a number in 1..=65535.
    #[error("entry '{name}': invalid {field} '{value}'")]
    InvalidPort {
        /// Entry name.
        name: String,
        /// Key holding the port.
        field: &'static str,
        /// Value found.
        value: String,
    },
    /// A handshake byte string is not valid hex.
    #[error("entry '{name}': {field} is not valid hex: {source}")]
    InvalidHex {
        /// Entry name.
        name: String,
        /// Key holding the hex string.
        field: &'static str,
        /// Underlying error.
        #[source]
        source: hex::FromHexError,
    },
}

/// How the station link is established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationMode {
    /// The station is a server (`stationMode: "server"`): we dial it.
    Dial {
        /// Host name or IP address of the station.
        address: String,
        /// Station TCP port.
        port: u16,
    },
    /// The station is a client (`stationMode: "client"`): we accept it.
    Accept {
        /// Local port the station connects to.
        port: u16,
    },
}

impl fmt::Display for StationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationMode::Dial { address, port } => write!(f, "dial {}:{}", address, port),
            StationMode::Accept { port } => write!(f, "accept :{}", port),
        }
    }
}

/// Bytes exchanged to confirm an inbound station before it may become active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeSpec {
    /// Sent to every new inbound candidate, if non-empty.
    pub probe: Vec<u8>,
    /// The candidate is confirmed once these bytes appear in what it sends.
    pub reply: Vec<u8>,
}

/// # Service Entry
///
/// One validated relay service. Immutable once built; compared by value to
/// decide whether a reload changes anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Service name (key in the `entry` map).
    pub name: String,
    /// Downstream listen port.
    pub listen_port: u16,
    /// Station link topology.
    pub station: StationMode,
    /// Optional line-oriented control port.
    pub control_port: Option<u16>,
    /// `None` when no filter key is present, `Some(vec![])` to allow all.
    pub filter: Option<Vec<u16>>,
    /// Per-read and per-frame debug logging.
    pub enable_log: bool,
    /// Base64 mirror of every raw read.
    pub enable_raw: bool,
    /// Handshake for inbound stations; `None` accepts the first data.
    pub handshake: Option<HandshakeSpec>,
}

/// Status dashboard settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebInterface {
    /// HTTP port.
    pub port: u16,
    /// Whether the dashboard is served at all.
    pub allow: bool,
}

/// The merged, validated configuration directory.
#[derive(Debug, Default)]
pub struct RelayConfig {
    /// Valid entries by name.
    pub entries: BTreeMap<String, Entry>,
    /// Dashboard settings, if the main file has them.
    pub web_interface: Option<WebInterface>,
    /// Preferred log directory, if the main file names one.
    pub log_path: Option<PathBuf>,
    /// Problems that caused files or entries to be skipped.
    pub rejected: Vec<ConfigError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    entry: BTreeMap<String, Value>,
    web_interface: Option<WebInterfaceFile>,
    log_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebInterfaceFile {
    port: Option<Scalar>,
    allow: Option<Scalar>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryFile {
    station_mode: Option<String>,
    station_ip_address: Option<String>,
    station_port: Option<Scalar>,
    listen_port: Option<Scalar>,
    control_port: Option<Scalar>,
    filter: Option<Vec<u16>>,
    enable_log: Option<Scalar>,
    enable_raw: Option<Scalar>,
    handshake_probe: Option<String>,
    handshake_reply: Option<String>,
}

/// Ports and flags appear both as JSON scalars and as strings in the wild.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Number(u64),
    Text(String),
}

impl Scalar {
    fn is_true(&self) -> bool {
        match self {
            Scalar::Bool(b) => *b,
            Scalar::Number(n) => *n != 0,
            Scalar::Text(s) => s.trim().eq_ignore_ascii_case("true"),
        }
    }

    fn to_port(&self) -> Option<u16> {
        let value = match self {
            Scalar::Number(n) => u16::try_from(*n).ok(),
            Scalar::Text(s) => s.trim().parse::<u16>().ok(),
            Scalar::Bool(_) => None,
        }?;
        (value != 0).then_some(value)
    }

    fn describe(&self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }
}

fn port(name: &str, field: &'static str, value: Option<&Scalar>) -> Result<Option<u16>, ConfigError> {
    match value {
        None => Ok(None),
        Some(scalar) => scalar.to_port().map(Some).ok_or_else(|| ConfigError::InvalidPort {
            name: name.to_string(),
            field,
            value: scalar.describe(),
        }),
    }
}

fn required_port(name: &str, field: &'static str, value: Option<&Scalar>) -> Result<u16, ConfigError> {
    port(name, field, value)?.ok_or_else(|| ConfigError::MissingField {
        name: name.to_string(),
        field,
    })
}

fn hex_field(name: &str, field: &'static str, value: Option<&str>) -> Result<Vec<u8>, ConfigError> {
    match value.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(text) => hex::decode(text).map_err(|source| ConfigError::InvalidHex {
            name: name.to_string(),
            field,
            source,
        }),
    }
}

impl Entry {
    /// Validates one JSON entry.
    pub fn from_json(name: &str, value: &Value) -> Result<Self, ConfigError> {
        let raw: EntryFile =
            serde_json::from_value(value.clone()).map_err(|source| ConfigError::MalformedEntry {
                name: name.to_string(),
                source,
            })?;

        let station_port = required_port(name, "stationPort", raw.station_port.as_ref())?;
        let listen_port = required_port(name, "listenPort", raw.listen_port.as_ref())?;
        let control_port = port(name, "controlPort", raw.control_port.as_ref())?;

        let mode = raw
            .station_mode
            .as_deref()
            .map(|m| m.trim().to_lowercase())
            .ok_or_else(|| ConfigError::MissingField {
                name: name.to_string(),
                field: "stationMode",
            })?;

        let station = match mode.as_str() {
            "server" => {
                let address = raw
                    .station_ip_address
                    .as_deref()
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| ConfigError::MissingStationAddress { name: name.to_string() })?;
                StationMode::Dial {
                    address: address.to_string(),
                    port: station_port,
                }
            }
            "client" => StationMode::Accept { port: station_port },
            _ => {
                return Err(ConfigError::UnrecognizedStationMode {
                    name: name.to_string(),
                    mode,
                })
            }
        };

        let probe = hex_field(name, "handshakeProbe", raw.handshake_probe.as_deref())?;
        let reply = hex_field(name, "handshakeReply", raw.handshake_reply.as_deref())?;
        // A handshake nobody can answer would strand every candidate.
        if !probe.is_empty() && reply.is_empty() {
            return Err(ConfigError::MissingField {
                name: name.to_string(),
                field: "handshakeReply",
            });
        }
        let handshake = (!reply.is_empty()).then_some(HandshakeSpec { probe, reply });

        Ok(Entry {
            name: name.to_string(),
            listen_port,
            station,
            control_port,
            filter: raw.filter,
            enable_log: raw.enable_log.as_ref().is_some_and(Scalar::is_true),
            enable_raw: raw.enable_raw.as_ref().is_some_and(Scalar::is_true),
            handshake,
        })
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// # Load Configuration
///
/// Reads `config.json` plus the other JSON files of `dir` and validates every
/// entry. Only an unreadable directory is an error; broken files and entries
/// are logged, collected in [`RelayConfig::rejected`] and skipped.
pub fn load_config(dir: &Path) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    let main_path = dir.join(MAIN_CONFIG_FILE);
    let main = match read_file(&main_path) {
        Ok(file) => file,
        Err(e) => {
            log::error!("Failed to load main configuration: {}", e);
            config.rejected.push(e);
            ConfigFile::default()
        }
    };

    config.web_interface = main.web_interface.as_ref().and_then(|web| {
        let port = web.port.as_ref().and_then(Scalar::to_port)?;
        Some(WebInterface {
            port,
            allow: web.allow.as_ref().is_some_and(Scalar::is_true),
        })
    });
    config.log_path = main.log_path.as_ref().map(PathBuf::from);

    let mut merged = main.entry;

    let listing = fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut extra_files: Vec<PathBuf> = listing
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension().is_some_and(|ext| ext == "json")
                && p.file_name().is_some_and(|n| n != MAIN_CONFIG_FILE)
        })
        .collect();
    extra_files.sort();

    for path in extra_files {
        match read_file(&path) {
            Ok(file) => {
                for (name, value) in file.entry {
                    if merged.contains_key(&name) {
                        log::debug!("Entry '{}' in {} is already defined, ignored", name, path.display());
                        continue;
                    }
                    merged.insert(name, value);
                }
            }
            Err(e) => {
                log::error!("Failed to load extra configuration: {}", e);
                config.rejected.push(e);
            }
        }
    }

    for (name, value) in merged {
        match Entry::from_json(&name, &value) {
            Ok(entry) => {
                config.entries.insert(name, entry);
            }
            Err(e) => {
                log::error!("Failed to parse configuration: {}", e);
                config.rejected.push(e);
            }
        }
    }

    Ok(config)
}
