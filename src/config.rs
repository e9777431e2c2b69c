//! Node configuration.
//!
//! A [`NodeConfig`] is built once at startup and shared read-only (behind an
//! `Arc`) with the coordinator and server. Sources, lowest precedence first:
//!
//! 1. [`NodeConfig::default`]
//! 2. an optional TOML file ([`NodeConfig::load_file`])
//! 3. `LOGFAN_*` environment variables ([`NodeConfig::apply_env`])
//! 4. command-line flags (applied by the CLI)
//!
//! ```toml
//! listen = "0.0.0.0:1234"
//! log_dir = "/var/log/app"
//! peers = ["10.0.0.2:1234", "10.0.0.3:1234"]
//! read_timeout_ms = 30000
//!
//! [filter]
//! program = "grep"
//! args = ["-a"]
//! ```
//!
//! Peer files list one `address:port` per line; blank lines and `#` comments
//! are ignored. Any malformed entry rejects the whole file.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::search::FilterCommand;

/// Port used when an address omits one.
pub const DEFAULT_PORT: u16 = 1234;

/// Errors while assembling the configuration. All are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid peer on line {line} ({entry:?}): {reason}; expected <address>:<port>")]
    InvalidPeer {
        line: usize,
        entry: String,
        reason: String,
    },

    #[error("invalid listen address {value:?}: {reason}")]
    InvalidListen { value: String, reason: String },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// A peer coordinator endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Peer {
    pub address: String,
    pub port: u16,
}

impl Peer {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint())
    }
}

impl FromStr for Peer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| "unterminated IPv6 literal or missing port".to_string())?;
            if host.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(format!("{host:?} is not an IPv6 address"));
            }
            (host, port)
        } else {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| "missing port".to_string())?;
            if host.contains(':') {
                return Err("IPv6 addresses must be written as [addr]:port".to_string());
            }
            (host, port)
        };

        if host.is_empty() {
            return Err("missing address".to_string());
        }
        if host.chars().any(char::is_whitespace) {
            return Err("address contains whitespace".to_string());
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("port {port:?} is not a number in 1-65535"))?;
        if port == 0 {
            return Err("port 0 is not connectable".to_string());
        }
        Ok(Peer::new(host, port))
    }
}

impl TryFrom<String> for Peer {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Peer> for String {
    fn from(peer: Peer) -> Self {
        peer.endpoint()
    }
}

/// Parse a peer file. Line numbers in errors are 1-based.
pub fn parse_peers(contents: &str) -> Result<Vec<Peer>, ConfigError> {
    let mut peers = Vec::new();
    for (idx, raw) in contents.lines().enumerate() {
        let entry = raw.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        let peer = entry.parse().map_err(|reason| ConfigError::InvalidPeer {
            line: idx + 1,
            entry: entry.to_string(),
            reason,
        })?;
        peers.push(peer);
    }
    Ok(peers)
}

pub fn load_peers_file(path: &Path) -> Result<Vec<Peer>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let peers = parse_peers(&contents)?;
    tracing::debug!(path = %path.display(), peers = peers.len(), "peers_loaded");
    Ok(peers)
}

/// Accepts `host:port`, `:port` or a bare port (all interfaces).
pub fn parse_listen(value: &str) -> Result<SocketAddr, ConfigError> {
    let trimmed = value.trim();
    let invalid = |reason: &str| ConfigError::InvalidListen {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let port_only = trimmed.strip_prefix(':').unwrap_or(trimmed);
    if !port_only.is_empty() && port_only.bytes().all(|b| b.is_ascii_digit()) {
        let port = port_only
            .parse::<u16>()
            .map_err(|_| invalid("port out of range"))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    trimmed
        .parse()
        .map_err(|_| invalid("expected <ip>:<port> or <port>"))
}

/// Everything a node needs, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the query endpoint binds to.
    pub listen: SocketAddr,
    /// Directory whose files are searched for local matches.
    pub log_dir: PathBuf,
    /// Peer coordinators queried on every fan-out.
    pub peers: Vec<Peer>,
    pub filter: FilterCommand,
    /// Bound on establishing a peer connection.
    pub dial_timeout: Duration,
    /// Bound on each read from a peer stream.
    pub read_timeout: Duration,
    /// Bound on receiving a request after a client connects.
    pub request_timeout: Duration,
    /// A query is fanned out while its hop count is below this.
    pub max_hops: u32,
    /// Capacity of each session's merge sink (lines).
    pub sink_capacity: usize,
    pub max_connections: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            log_dir: PathBuf::from("logs"),
            peers: Vec::new(),
            filter: FilterCommand::default(),
            dial_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            max_hops: 1,
            sink_capacity: 256,
            max_connections: 64,
        }
    }
}

/// On-disk shape of the TOML config. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen: Option<String>,
    log_dir: Option<PathBuf>,
    peers: Option<Vec<Peer>>,
    peers_file: Option<PathBuf>,
    filter: Option<FilterCommand>,
    dial_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    max_hops: Option<u32>,
    sink_capacity: Option<usize>,
    max_connections: Option<usize>,
}

impl NodeConfig {
    /// Defaults overlaid with a TOML file. A relative `peers_file` is resolved
    /// against the config file's directory.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&contents).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;

        let mut cfg = Self::default();
        if let Some(listen) = file.listen {
            cfg.listen = parse_listen(&listen)?;
        }
        if let Some(dir) = file.log_dir {
            cfg.log_dir = dir;
        }
        if let Some(peers) = file.peers {
            cfg.peers = peers;
        }
        if let Some(peers_file) = file.peers_file {
            let peers_file = match path.parent() {
                Some(base) if peers_file.is_relative() => base.join(peers_file),
                _ => peers_file,
            };
            cfg.peers.extend(load_peers_file(&peers_file)?);
        }
        if let Some(filter) = file.filter {
            cfg.filter = filter;
        }
        if let Some(ms) = file.dial_timeout_ms {
            cfg.dial_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.read_timeout_ms {
            cfg.read_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.request_timeout_ms {
            cfg.request_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = file.max_hops {
            cfg.max_hops = n;
        }
        if let Some(n) = file.sink_capacity {
            cfg.sink_capacity = n;
        }
        if let Some(n) = file.max_connections {
            cfg.max_connections = n;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlay `LOGFAN_*` environment variables (a `.env` file is honoured).
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = dotenvy::var("LOGFAN_LISTEN") {
            self.listen = parse_listen(&val)?;
        }
        if let Ok(val) = dotenvy::var("LOGFAN_LOG_DIR") {
            self.log_dir = PathBuf::from(val);
        }
        if let Ok(val) = dotenvy::var("LOGFAN_PEERS") {
            self.peers = parse_peers(&val.replace(',', "\n"))?;
        }
        if let Ok(val) = dotenvy::var("LOGFAN_FILTER") {
            self.filter.program = val;
        }
        if let Ok(val) = dotenvy::var("LOGFAN_DIAL_TIMEOUT_MS") {
            self.dial_timeout = Duration::from_millis(env_number("LOGFAN_DIAL_TIMEOUT_MS", &val)?);
        }
        if let Ok(val) = dotenvy::var("LOGFAN_READ_TIMEOUT_MS") {
            self.read_timeout = Duration::from_millis(env_number("LOGFAN_READ_TIMEOUT_MS", &val)?);
        }
        if let Ok(val) = dotenvy::var("LOGFAN_REQUEST_TIMEOUT_MS") {
            self.request_timeout =
                Duration::from_millis(env_number("LOGFAN_REQUEST_TIMEOUT_MS", &val)?);
        }
        if let Ok(val) = dotenvy::var("LOGFAN_MAX_HOPS") {
            self.max_hops = env_number("LOGFAN_MAX_HOPS", &val)?;
        }
        if let Ok(val) = dotenvy::var("LOGFAN_SINK_CAPACITY") {
            self.sink_capacity = env_number("LOGFAN_SINK_CAPACITY", &val)?;
        }
        if let Ok(val) = dotenvy::var("LOGFAN_MAX_CONNECTIONS") {
            self.max_connections = env_number("LOGFAN_MAX_CONNECTIONS", &val)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sink_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sink_capacity".into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_connections".into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn env_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: "expected a non-negative integer".to_string(),
    })
}
