use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log_fanout::config::{NodeConfig, Peer};
use log_fanout::daemon::protocol::{FramedMessage, Request, Response, read_frame, write_frame};
use log_fanout::daemon::{ClientConfig, LogServer, PeerClient};
use log_fanout::search::{FilterCommand, Query};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A temporary log directory populated with `(file name, contents)` pairs.
#[allow(dead_code)]
pub fn log_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, contents) in files {
        std::fs::write(dir.path().join(name), contents).unwrap();
    }
    dir
}

/// Write an executable shell script usable as a filter program.
#[allow(dead_code)]
pub fn filter_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

#[allow(dead_code)]
pub fn script_filter(path: &Path) -> FilterCommand {
    FilterCommand {
        program: path.display().to_string(),
        args: Vec::new(),
        no_match_code: 1,
    }
}

/// Node configuration with short timeouts suited to tests.
#[allow(dead_code)]
pub fn node_config(log_dir: &Path, peers: Vec<Peer>) -> NodeConfig {
    NodeConfig {
        log_dir: log_dir.to_path_buf(),
        peers,
        dial_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ..NodeConfig::default()
    }
}

/// A node serving on an ephemeral local port until dropped.
#[allow(dead_code)]
pub struct TestNode {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn start(config: NodeConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::start_on(listener, config)
    }

    /// Serve on a listener bound beforehand, so peers can know each other's ports.
    pub fn start_on(listener: TcpListener, config: NodeConfig) -> Self {
        let server = LogServer::from_listener(listener, Arc::new(config));
        let addr = server.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            server.run(rx).await.unwrap();
        });
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub fn peer(&self) -> Peer {
        Peer::new("127.0.0.1", self.addr.port())
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

#[allow(dead_code)]
pub fn test_client() -> PeerClient {
    PeerClient::new(ClientConfig {
        dial_timeout: Duration::from_millis(500),
        read_timeout: Some(Duration::from_secs(10)),
    })
}

/// Run `pattern` against `endpoint` and return every line, failing the test on error.
#[allow(dead_code)]
pub async fn query_lines(endpoint: &str, pattern: &str) -> Vec<String> {
    let mut remote = test_client()
        .open(endpoint, &Query::new(pattern))
        .await
        .unwrap();
    let mut lines = Vec::new();
    while let Some(line) = remote.next_line().await.unwrap() {
        lines.push(line);
    }
    lines
}

/// A port nothing listens on.
#[allow(dead_code)]
pub fn dead_peer() -> Peer {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Peer::new("127.0.0.1", port)
}

/// A peer that accepts one query, optionally answers with `frames`, then
/// reports through the handle when the caller closed the connection.
#[allow(dead_code)]
pub async fn fake_peer(frames: Vec<Response>, hold: bool) -> (Peer, JoinHandle<Option<Request>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        use tokio::io::AsyncReadExt;

        let (mut sock, _) = listener.accept().await.ok()?;
        let request = read_frame::<_, Request>(&mut sock).await.ok()??;
        for frame in frames {
            write_frame(&mut sock, &FramedMessage::new(request.request_id.clone(), frame))
                .await
                .ok()?;
        }
        if hold {
            // Returns once the other side closes.
            let mut buf = [0u8; 16];
            while let Ok(n) = sock.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        }
        Some(request.payload)
    });
    (Peer::new("127.0.0.1", port), handle)
}

/// Poll `cond` until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Whether `pid` is gone or a zombie.
#[allow(dead_code)]
pub fn process_exited(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}
