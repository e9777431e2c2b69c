//! Network layer: the node server, the client used to reach other nodes, and
//! the frame protocol they share.
//!
//! ## Architecture
//!
//! ```text
//!   logfan query ──► coordinator ──┬─► local filter over log_dir
//!                                  ├─► peer A (hops=1, local only)
//!                                  └─► peer B (hops=1, local only)
//!
//!   Every arrow is one TCP connection carrying one request and a stream of
//!   Line frames closed by Done or Error.
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use log_fanout::daemon::{LogServer, PeerClient, ClientConfig};
//!
//! let server = LogServer::bind(config).await?;
//! tokio::spawn(server.run(shutdown_rx));
//!
//! let client = PeerClient::new(ClientConfig::default());
//! let mut stream = client.open("node-a:1234", &Query::new("ERROR")).await?;
//! while let Some(line) = stream.next_line().await? {
//!     println!("{line}");
//! }
//! ```

pub mod client;
pub mod core;
pub mod protocol;

pub use client::{ClientConfig, PeerClient, PeerError, RemoteStream};
pub use core::LogServer;
pub use protocol::{PROTOCOL_VERSION, Request, Response};
