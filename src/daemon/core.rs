//! Server side of the query protocol.
//!
//! [`LogServer`] accepts TCP connections and serves one request per
//! connection. A query that may still fan out goes to the [`Coordinator`]; a
//! query forwarded from another coordinator is answered from the local log
//! directory alone. Lines are written to the client as they arrive, followed
//! by a `Done` or `Error` frame.
//!
//! If the client disconnects mid-stream the query is cancelled: filter
//! processes are killed and peer connections closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::protocol::{
    ErrorCode, ErrorResponse, FramedMessage, HealthStatus, PROTOCOL_VERSION, Request, Response,
    read_frame, write_frame,
};
use crate::config::NodeConfig;
use crate::fanout::{Coordinator, QuerySession, SessionEvent};
use crate::search::{LocalStream, Query};

pub struct LogServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

struct ServerState {
    config: Arc<NodeConfig>,
    coordinator: Coordinator,
    start_time: Instant,
    total_requests: AtomicU64,
    active_connections: AtomicUsize,
}

impl LogServer {
    /// Bind `config.listen`.
    pub async fn bind(config: Arc<NodeConfig>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(Self::from_listener(listener, config))
    }

    /// Serve on an already bound listener; `config.listen` is ignored.
    pub fn from_listener(listener: TcpListener, config: Arc<NodeConfig>) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState {
                coordinator: Coordinator::new(config.clone()),
                config,
                start_time: Instant::now(),
                total_requests: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// In-flight queries are aborted on shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(
            addr = %addr,
            log_dir = %self.state.config.log_dir.display(),
            peers = self.state.config.peers.len(),
            max_connections = self.state.config.max_connections,
            "server_listening"
        );

        let mut connections = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = self.state.clone();
                        connections.spawn(async move { state.serve_connection(stream, peer).await });
                    }
                    Err(e) => {
                        error!(error = %e, "accept_failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(
            active = connections.len(),
            served = self.state.total_requests.load(Ordering::Relaxed),
            "server_stopping"
        );
        connections.shutdown().await;
        Ok(())
    }
}

/// Counts one connection in `active_connections` for as long as it lives.
struct ConnectionSlot<'a>(&'a AtomicUsize);

impl Drop for ConnectionSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Either a full fan-out or a local-only search.
enum ResultSource {
    Fanout(QuerySession),
    Local(LocalStream),
}

impl ResultSource {
    async fn next_event(&mut self) -> Option<SessionEvent> {
        match self {
            ResultSource::Fanout(session) => session.next_event().await,
            ResultSource::Local(stream) => stream.next_event().await,
        }
    }

    async fn cancel(self) {
        match self {
            ResultSource::Fanout(session) => session.cancel().await,
            ResultSource::Local(stream) => stream.cancel().await,
        }
    }
}

impl ServerState {
    fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let active = self.active_connections.fetch_add(1, Ordering::AcqRel);
        let _slot = ConnectionSlot(&self.active_connections);
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        if active >= self.config.max_connections {
            warn!(
                client = %peer,
                active,
                max = self.config.max_connections,
                "max_connections_reached"
            );
            send_error(&mut writer, "overloaded", ErrorCode::Overloaded, "too many connections").await;
            return;
        }

        let request = match tokio::time::timeout(
            self.config.request_timeout,
            read_frame::<_, Request>(&mut reader),
        )
        .await
        {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => {
                debug!(client = %peer, "client_closed_before_request");
                return;
            }
            Ok(Err(e)) if e.is_connection() => {
                debug!(client = %peer, error = %e, "request_read_failed");
                return;
            }
            Ok(Err(e)) => {
                warn!(client = %peer, error = %e, "request_decode_failed");
                send_error(&mut writer, "error", ErrorCode::InvalidInput, e.to_string()).await;
                return;
            }
            Err(_) => {
                debug!(client = %peer, "request_timeout");
                return;
            }
        };
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if request.version != PROTOCOL_VERSION {
            warn!(
                client = %peer,
                theirs = request.version,
                ours = PROTOCOL_VERSION,
                "protocol_version_mismatch"
            );
            let message = format!(
                "protocol version {} not supported, expected {}",
                request.version, PROTOCOL_VERSION
            );
            send_error(&mut writer, &request.request_id, ErrorCode::VersionMismatch, message).await;
            return;
        }

        match request.payload {
            Request::Health => {
                let status = HealthStatus {
                    uptime_secs: self.uptime_secs(),
                    version: PROTOCOL_VERSION,
                    peers: self.config.peers.iter().map(|p| p.endpoint()).collect(),
                    log_dir: self.config.log_dir.display().to_string(),
                };
                let frame = FramedMessage::new(request.request_id, Response::Health(status));
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!(client = %peer, error = %e, "health_write_failed");
                }
            }
            Request::Query(query) => {
                self.stream_query(request.request_id, query, peer, reader, writer)
                    .await
            }
        }
    }

    async fn stream_query(
        &self,
        request_id: String,
        query: Query,
        peer: SocketAddr,
        reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
    ) {
        info!(
            request_id = %request_id,
            client = %peer,
            pattern = %query.pattern,
            hops = query.hops,
            "query_received"
        );

        let mut source = if query.may_fan_out(self.config.max_hops) {
            ResultSource::Fanout(self.coordinator.handle_query(query))
        } else {
            let local = self.coordinator.local();
            ResultSource::Local(local.spawn(query.pattern, self.config.sink_capacity))
        };

        let disconnected = wait_for_disconnect(reader);
        tokio::pin!(disconnected);

        let started = Instant::now();
        let mut lines = 0u64;
        loop {
            let next = tokio::select! {
                event = source.next_event() => Some(event),
                _ = &mut disconnected => None,
            };
            let Some(event) = next else {
                info!(request_id = %request_id, client = %peer, lines, "client_disconnected");
                source.cancel().await;
                return;
            };

            let frames = match event {
                Some(SessionEvent::Line(line)) => {
                    lines += 1;
                    Response::line_frames(line)
                }
                Some(SessionEvent::Finished(Ok(()))) => vec![Response::Done { lines }],
                Some(SessionEvent::Finished(Err(e))) => vec![Response::Error(ErrorResponse::new(
                    ErrorCode::LocalSearch,
                    e.to_string(),
                ))],
                None => return,
            };
            let terminal = frames.last().is_some_and(Response::is_terminal);

            for frame in frames {
                let Err(e) = write_frame(&mut writer, &FramedMessage::new(request_id.clone(), frame)).await
                else {
                    continue;
                };
                if e.is_connection() {
                    info!(request_id = %request_id, client = %peer, error = %e, "client_write_failed");
                } else {
                    warn!(request_id = %request_id, error = %e, "response_encode_failed");
                    send_error(&mut writer, &request_id, ErrorCode::Internal, e.to_string()).await;
                }
                source.cancel().await;
                return;
            }

            if terminal {
                info!(
                    request_id = %request_id,
                    lines,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "query_complete"
                );
                return;
            }
        }
    }
}

/// Resolves once the client closes its side of the connection or it breaks.
///
/// A half-close counts as a disconnect: clients keep their write side open
/// until the stream ends.
async fn wait_for_disconnect(mut reader: OwnedReadHalf) {
    let mut scratch = [0u8; 256];
    loop {
        match reader.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn send_error(
    writer: &mut OwnedWriteHalf,
    request_id: &str,
    code: ErrorCode,
    message: impl Into<String>,
) {
    let frame = FramedMessage::new(request_id, Response::Error(ErrorResponse::new(code, message)));
    if let Err(e) = write_frame(writer, &frame).await {
        debug!(error = %e, code = %code, "error_write_failed");
    }
}
