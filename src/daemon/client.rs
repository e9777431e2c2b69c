//! Client side of the query protocol.
//!
//! [`PeerClient`] is used both by a coordinator to pull results from its
//! peers and by the `logfan query` command to talk to a coordinator. It tells
//! three outcomes apart: the remote could not be reached or went away
//! ([`PeerError::Unavailable`]), the remote answered with an error
//! ([`PeerError::Remote`]), or the stream ended normally.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::error::Elapsed;
use tracing::debug;

use super::protocol::{
    ErrorCode, FramedMessage, HealthStatus, Request, Response, TransportError, read_frame,
    write_frame,
};
use crate::config::{NodeConfig, Peer};
use crate::search::Query;

/// Timeouts applied to every call.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on establishing the TCP connection.
    pub dial_timeout: Duration,
    /// Bound on each frame read. `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(2),
            read_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl From<&NodeConfig> for ClientConfig {
    fn from(cfg: &NodeConfig) -> Self {
        Self {
            dial_timeout: cfg.dial_timeout,
            read_timeout: Some(cfg.read_timeout),
        }
    }
}

/// How a call to a remote coordinator ended, other than normally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Dial failure, timeout, or connection lost mid-stream.
    #[error("{peer} unavailable: {reason}")]
    Unavailable { peer: String, reason: String },

    /// The remote's own query failed.
    #[error("{peer} reported {code} error: {message}")]
    Remote {
        peer: String,
        code: ErrorCode,
        message: String,
    },

    /// The remote sent something that is not a valid frame.
    #[error("{peer} sent a malformed stream: {reason}")]
    Transport { peer: String, reason: String },

    /// Our own consumer went away while lines were still arriving.
    #[error("stopped reading from {peer}: query cancelled")]
    Cancelled { peer: String },
}

impl PeerError {
    fn from_transport(peer: &str, err: TransportError) -> Self {
        match err {
            TransportError::Io(e) => PeerError::Unavailable {
                peer: peer.to_string(),
                reason: e.to_string(),
            },
            other => PeerError::Transport {
                peer: peer.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerClient {
    config: ClientConfig,
    request_counter: Arc<AtomicU64>,
}

impl PeerClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            request_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start a query on `endpoint` (`host:port`) and return its line stream.
    pub async fn open(&self, endpoint: &str, query: &Query) -> Result<RemoteStream, PeerError> {
        let (stream, request_id) = self.call(endpoint, Request::Query(query.clone())).await?;
        debug!(peer = endpoint, request_id = %request_id, hops = query.hops, "remote_stream_opened");
        Ok(RemoteStream {
            peer: endpoint.to_string(),
            stream,
            read_timeout: self.config.read_timeout,
            received: 0,
            partial: String::new(),
            done: false,
        })
    }

    /// Run `query` on `peer` and push every line it returns into `sink`.
    ///
    /// The sink is not closed. Returns the number of lines forwarded.
    pub async fn forward(
        &self,
        peer: &Peer,
        query: &Query,
        sink: &mpsc::Sender<String>,
    ) -> Result<usize, PeerError> {
        let endpoint = peer.endpoint();
        let mut remote = self.open(&endpoint, query).await?;
        let mut forwarded = 0usize;
        while let Some(line) = remote.next_line().await? {
            sink.send(line).await.map_err(|_| PeerError::Cancelled {
                peer: endpoint.clone(),
            })?;
            forwarded += 1;
        }
        Ok(forwarded)
    }

    pub async fn health(&self, endpoint: &str) -> Result<HealthStatus, PeerError> {
        let (mut stream, _) = self.call(endpoint, Request::Health).await?;
        let frame = read_bounded(endpoint, self.config.read_timeout, &mut stream).await?;
        match frame {
            Some(FramedMessage {
                payload: Response::Health(status),
                ..
            }) => Ok(status),
            Some(FramedMessage {
                payload: Response::Error(e),
                ..
            }) => Err(PeerError::Remote {
                peer: endpoint.to_string(),
                code: e.code,
                message: e.message,
            }),
            Some(other) => Err(PeerError::Transport {
                peer: endpoint.to_string(),
                reason: format!("unexpected response to health check: {:?}", other.payload),
            }),
            None => Err(PeerError::Unavailable {
                peer: endpoint.to_string(),
                reason: "connection closed before responding".to_string(),
            }),
        }
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", std::process::id(), n)
    }

    async fn connect(&self, endpoint: &str) -> Result<TcpStream, PeerError> {
        match tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(PeerError::Unavailable {
                peer: endpoint.to_string(),
                reason: format!("dial failed: {e}"),
            }),
            Err(_) => Err(PeerError::Unavailable {
                peer: endpoint.to_string(),
                reason: format!(
                    "dial timed out after {}ms",
                    self.config.dial_timeout.as_millis()
                ),
            }),
        }
    }

    async fn call(&self, endpoint: &str, request: Request) -> Result<(TcpStream, String), PeerError> {
        let mut stream = self.connect(endpoint).await?;
        let request_id = self.next_request_id();
        write_frame(&mut stream, &FramedMessage::new(request_id.clone(), request))
            .await
            .map_err(|e| PeerError::from_transport(endpoint, e))?;
        Ok((stream, request_id))
    }
}

/// Lines of one remote query, read lazily. Dropping it closes the connection.
pub struct RemoteStream {
    peer: String,
    stream: TcpStream,
    read_timeout: Option<Duration>,
    received: u64,
    /// Leading pieces of a line split across frames.
    partial: String,
    done: bool,
}

impl RemoteStream {
    /// Next line, `Ok(None)` once the remote finished successfully.
    ///
    /// The stream ends at the first error; later calls return `Ok(None)`.
    pub async fn next_line(&mut self) -> Result<Option<String>, PeerError> {
        if self.done {
            return Ok(None);
        }
        let next = self.read_line().await;
        if !matches!(next, Ok(Some(_))) {
            self.done = true;
        }
        next
    }

    async fn read_line(&mut self) -> Result<Option<String>, PeerError> {
        loop {
            let frame = read_bounded(&self.peer, self.read_timeout, &mut self.stream).await?;
            let Some(frame) = frame else {
                return Err(PeerError::Unavailable {
                    peer: self.peer.clone(),
                    reason: "connection closed mid-stream".to_string(),
                });
            };

            match frame.payload {
                Response::LinePart(piece) => self.partial.push_str(&piece),
                Response::Line(line) => {
                    self.received += 1;
                    if self.partial.is_empty() {
                        return Ok(Some(line));
                    }
                    let mut whole = std::mem::take(&mut self.partial);
                    whole.push_str(&line);
                    return Ok(Some(whole));
                }
                Response::Done { lines } => {
                    debug!(peer = %self.peer, lines, received = self.received, "remote_stream_done");
                    return Ok(None);
                }
                Response::Error(e) => {
                    return Err(PeerError::Remote {
                        peer: self.peer.clone(),
                        code: e.code,
                        message: e.message,
                    });
                }
                Response::Health(_) => {
                    return Err(PeerError::Transport {
                        peer: self.peer.clone(),
                        reason: "health response inside a query stream".to_string(),
                    });
                }
            }
        }
    }
}

async fn read_bounded(
    peer: &str,
    limit: Option<Duration>,
    stream: &mut TcpStream,
) -> Result<Option<FramedMessage<Response>>, PeerError> {
    match with_limit(limit, read_frame::<_, Response>(stream)).await {
        Ok(result) => result.map_err(|e| PeerError::from_transport(peer, e)),
        Err(_) => Err(PeerError::Unavailable {
            peer: peer.to_string(),
            reason: format!(
                "no response within {}ms",
                limit.map(|d| d.as_millis()).unwrap_or_default()
            ),
        }),
    }
}

async fn with_limit<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output, Elapsed> {
    match limit {
        Some(d) => tokio::time::timeout(d, fut).await,
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::ErrorResponse;
    use std::time::Instant;
    use tokio::net::TcpListener;

    /// Accept one connection, read the request, then reply with `frames`.
    async fn scripted_peer(frames: Vec<Response>) -> (String, tokio::task::JoinHandle<Request>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let req = read_frame::<_, Request>(&mut sock).await.unwrap().unwrap();
            for frame in frames {
                write_frame(&mut sock, &FramedMessage::new(req.request_id.clone(), frame))
                    .await
                    .unwrap();
            }
            req.payload
        });
        (addr, handle)
    }

    fn fast_client() -> PeerClient {
        PeerClient::new(ClientConfig {
            dial_timeout: Duration::from_millis(500),
            read_timeout: Some(Duration::from_millis(300)),
        })
    }

    #[tokio::test]
    async fn test_forward_pushes_lines_and_sends_query() {
        let (addr, peer) = scripted_peer(vec![
            Response::Line("a".into()),
            Response::Line("aba".into()),
            Response::Done { lines: 2 },
        ])
        .await;
        let peer_cfg: Peer = addr.parse().unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let n = fast_client()
            .forward(&peer_cfg, &Query::new("a").forwarded(), &tx)
            .await
            .unwrap();
        assert_eq!(n, 2);
        drop(tx);
        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("aba"));
        assert_eq!(rx.recv().await, None);

        let request = peer.await.unwrap();
        assert_eq!(
            request,
            Request::Query(Query {
                pattern: "a".into(),
                hops: 1
            })
        );
    }

    #[tokio::test]
    async fn test_remote_error_is_distinguished() {
        let (addr, _peer) = scripted_peer(vec![
            Response::Line("partial".into()),
            Response::Error(ErrorResponse::new(ErrorCode::LocalSearch, "no logs")),
        ])
        .await;
        let mut remote = fast_client().open(&addr, &Query::new("x")).await.unwrap();
        assert_eq!(remote.next_line().await.unwrap().as_deref(), Some("partial"));
        let err = remote.next_line().await.unwrap_err();
        assert!(matches!(
            err,
            PeerError::Remote { code: ErrorCode::LocalSearch, ref message, .. } if message == "no logs"
        ));
        // Terminal: no further reads.
        assert_eq!(remote.next_line().await, Ok(None));
    }

    #[tokio::test]
    async fn test_connection_lost_mid_stream_is_unavailable() {
        let (addr, _peer) = scripted_peer(vec![Response::Line("one".into())]).await;
        let mut remote = fast_client().open(&addr, &Query::new("x")).await.unwrap();
        assert_eq!(remote.next_line().await.unwrap().as_deref(), Some("one"));
        assert!(matches!(
            remote.next_line().await,
            Err(PeerError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_dial_refused_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = fast_client()
            .open(&addr, &Query::new("x"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PeerError::Unavailable { ref reason, .. } if reason.starts_with("dial")));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _hold = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });

        let started = Instant::now();
        let mut remote = fast_client().open(&addr, &Query::new("x")).await.unwrap();
        let err = remote.next_line().await.unwrap_err();
        assert!(matches!(err, PeerError::Unavailable { ref reason, .. } if reason.contains("no response")));
        assert!(started.elapsed() < Duration::from_secs(5));

        // The stream is over; no second read on a possibly misaligned socket.
        let again = Instant::now();
        assert_eq!(remote.next_line().await, Ok(None));
        assert!(again.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_split_line_is_reassembled() {
        let (addr, _peer) = scripted_peer(vec![
            Response::LinePart("abc".into()),
            Response::LinePart("def".into()),
            Response::Line("g".into()),
            Response::Line("next".into()),
            Response::Done { lines: 2 },
        ])
        .await;
        let mut remote = fast_client().open(&addr, &Query::new("x")).await.unwrap();
        assert_eq!(remote.next_line().await.unwrap().as_deref(), Some("abcdefg"));
        assert_eq!(remote.next_line().await.unwrap().as_deref(), Some("next"));
        assert_eq!(remote.next_line().await, Ok(None));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _peer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_frame::<_, Request>(&mut sock).await;
            sock.write_all(&[0, 0, 0, 2, 0xc1, 0xc1]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut remote = fast_client().open(&addr, &Query::new("x")).await.unwrap();
        assert!(matches!(
            remote.next_line().await,
            Err(PeerError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_forward_reports_cancelled_sink() {
        let (addr, _peer) = scripted_peer(vec![
            Response::Line("a".into()),
            Response::Done { lines: 1 },
        ])
        .await;
        let peer_cfg: Peer = addr.parse().unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = fast_client()
            .forward(&peer_cfg, &Query::new("a"), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_health_roundtrip() {
        let status = HealthStatus {
            uptime_secs: 3,
            version: crate::daemon::protocol::PROTOCOL_VERSION,
            peers: vec!["b:1".into()],
            log_dir: "logs".into(),
        };
        let (addr, peer) = scripted_peer(vec![Response::Health(status.clone())]).await;
        assert_eq!(fast_client().health(&addr).await.unwrap(), status);
        assert_eq!(peer.await.unwrap(), Request::Health);
    }
}
