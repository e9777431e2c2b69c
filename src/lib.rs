pub mod config;
pub mod daemon;
pub mod fanout;
pub mod search;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{ConfigError, DEFAULT_PORT, NodeConfig, Peer, load_peers_file, parse_listen};
use daemon::{ClientConfig, LogServer, PeerClient};
use search::Query;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "logfan",
    version,
    about = "Search log files across a fleet of machines"
)]
pub struct Cli {
    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a node: answer queries from the local log directory and fan them out to peers
    Serve {
        /// TOML config file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Listen address: `host:port`, `:port` or a bare port
        #[arg(long, short = 'l')]
        listen: Option<String>,

        /// Directory whose files are searched
        #[arg(long, short = 'd')]
        log_dir: Option<PathBuf>,

        /// Peers file, one `address:port` per line
        #[arg(long, short = 'p')]
        peers: Option<PathBuf>,
    },
    /// Send a pattern to a node and print every matching line as it arrives
    Query {
        /// Node to query, `host` or `host:port`
        #[arg(short, long, default_value = "localhost")]
        address: String,

        /// One JSON object per line instead of raw lines
        #[arg(long)]
        json: bool,

        /// Give up when the node sends nothing for this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Pattern handed to the filter on every node
        pattern: String,
    },
    /// Check that a node is up and show its configuration
    Health {
        /// Node to check, `host` or `host:port`
        #[arg(short, long, default_value = "localhost")]
        address: String,

        #[arg(long)]
        json: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, matches!(cli.command, Commands::Serve { .. }));

    match cli.command {
        Commands::Serve {
            config,
            listen,
            log_dir,
            peers,
        } => serve(config, listen, log_dir, peers).await,
        Commands::Query {
            address,
            json,
            timeout_ms,
            pattern,
        } => query(&address, json, timeout_ms, pattern).await,
        Commands::Health { address, json } => health(&address, json).await,
    }
}

/// Log to stderr. `RUST_LOG` overrides the level chosen by `-v`.
pub fn init_tracing(verbose: u8, daemon: bool) {
    let level = match verbose.saturating_add(u8::from(daemon)) {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Build the node configuration: defaults, then the config file, then
/// `LOGFAN_*` variables, then command-line flags.
pub fn resolve_config(
    config_path: Option<PathBuf>,
    listen: Option<String>,
    log_dir: Option<PathBuf>,
    peers_file: Option<PathBuf>,
) -> Result<NodeConfig, ConfigError> {
    let mut config = match config_path {
        Some(path) => NodeConfig::load_file(&path)?,
        None => NodeConfig::default(),
    };
    config.apply_env()?;

    if let Some(listen) = listen {
        config.listen = parse_listen(&listen)?;
    }
    if let Some(dir) = log_dir {
        config.log_dir = dir;
    }
    if let Some(path) = peers_file {
        config.peers = load_peers_file(&path)?;
    }
    config.validate()?;
    Ok(config)
}

async fn serve(
    config_path: Option<PathBuf>,
    listen: Option<String>,
    log_dir: Option<PathBuf>,
    peers_file: Option<PathBuf>,
) -> Result<()> {
    let config = Arc::new(resolve_config(config_path, listen, log_dir, peers_file)?);
    let server = LogServer::bind(config.clone())
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown_requested");
        }
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    Ok(())
}

async fn query(address: &str, json: bool, timeout_ms: Option<u64>, pattern: String) -> Result<()> {
    let endpoint = node_endpoint(address)?;
    let client = PeerClient::new(ClientConfig {
        read_timeout: timeout_ms.map(Duration::from_millis),
        ..ClientConfig::default()
    });

    let mut remote = client.open(&endpoint, &Query::new(pattern)).await?;
    let mut out = std::io::stdout();
    while let Some(line) = remote.next_line().await? {
        if json {
            writeln!(out, "{}", json!({ "line": line }))?;
        } else {
            writeln!(out, "{line}")?;
        }
        out.flush()?;
    }
    Ok(())
}

async fn health(address: &str, json: bool) -> Result<()> {
    let endpoint = node_endpoint(address)?;
    let client = PeerClient::new(ClientConfig::default());
    let status = client.health(&endpoint).await?;

    if json {
        println!(
            "{}",
            json!({
                "address": endpoint,
                "uptime_secs": status.uptime_secs,
                "version": status.version,
                "peers": status.peers,
                "log_dir": status.log_dir,
            })
        );
    } else {
        println!("{endpoint}: up {}s, protocol v{}", status.uptime_secs, status.version);
        println!("log dir: {}", status.log_dir);
        println!("peers: {}", status.peers.len());
        for peer in &status.peers {
            println!("  {peer}");
        }
    }
    Ok(())
}

/// `host` gets the default port; `host:port` and `[v6]:port` are taken as given.
fn node_endpoint(address: &str) -> Result<String, ConfigError> {
    let candidate = if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_PORT}")
    };
    candidate
        .parse::<Peer>()
        .map(|peer| peer.endpoint())
        .map_err(|reason| ConfigError::InvalidValue {
            key: "address".to_string(),
            value: address.to_string(),
            reason,
        })
}
