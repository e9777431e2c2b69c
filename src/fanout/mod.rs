//! Fan-out coordination.
//!
//! A [`Coordinator`] answers a query by running the local search and
//! forwarding the query to every configured peer, all concurrently, and
//! merging their lines into one bounded channel. The caller reads the merged
//! stream through a [`QuerySession`], which yields lines in arrival order and
//! then exactly one terminal [`SessionEvent::Finished`].
//!
//! Only the local branch decides the terminal status. A peer that cannot be
//! reached, times out or fails is logged and contributes whatever lines it
//! managed to send.

pub mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub use session::{BranchGuard, FanoutSession, SessionState};

use crate::config::{NodeConfig, Peer};
use crate::daemon::client::{ClientConfig, PeerClient};
use crate::search::{LocalSearch, LocalSearchError, Query};

/// What a query stream yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// One matched line, from any branch.
    Line(String),
    /// Terminal status. Always the last event.
    Finished(Result<(), LocalSearchError>),
}

pub struct Coordinator {
    config: Arc<NodeConfig>,
    local: LocalSearch,
    client: PeerClient,
    next_session: AtomicU64,
}

impl Coordinator {
    pub fn new(config: Arc<NodeConfig>) -> Self {
        let local = LocalSearch::new(config.log_dir.clone(), config.filter.clone());
        let client = PeerClient::new(ClientConfig::from(config.as_ref()));
        Self {
            config,
            local,
            client,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn local(&self) -> &LocalSearch {
        &self.local
    }

    /// Start answering `query`. Returns immediately; branches run on their own tasks.
    ///
    /// Peers are only contacted when the query has not yet used up
    /// `max_hops`; they receive it with the hop count incremented.
    pub fn handle_query(&self, query: Query) -> QuerySession {
        let id = format!("q{}", self.next_session.fetch_add(1, Ordering::Relaxed));
        let peers: &[Peer] = if query.may_fan_out(self.config.max_hops) {
            self.config.peers.as_slice()
        } else {
            debug!(session = %id, hops = query.hops, "hop_limit_reached");
            &[]
        };

        let session = Arc::new(FanoutSession::new(id.clone(), 1 + peers.len()));
        let (tx, rx) = mpsc::channel(self.config.sink_capacity.max(1));
        let mut tasks = JoinSet::new();

        let guard = BranchGuard::new("local", tx.clone(), session.clone());
        let local = self.local.clone();
        let pattern = query.pattern.clone();
        tasks.spawn(async move {
            match local.search_into(&pattern, guard.sink()).await {
                Ok(stats) => debug!(
                    session = %guard.session().id(),
                    files = stats.files,
                    lines = stats.lines,
                    "local_branch_done"
                ),
                Err(LocalSearchError::Cancelled) => {
                    debug!(session = %guard.session().id(), "local_branch_cancelled")
                }
                Err(e) => {
                    warn!(session = %guard.session().id(), error = %e, "local_branch_failed");
                    guard.session().record_error(e);
                }
            }
        });

        let forwarded = query.forwarded();
        for peer in peers {
            let guard = BranchGuard::new(peer.endpoint(), tx.clone(), session.clone());
            let client = self.client.clone();
            let peer = peer.clone();
            let forwarded = forwarded.clone();
            tasks.spawn(async move {
                match client.forward(&peer, &forwarded, guard.sink()).await {
                    Ok(lines) => debug!(
                        session = %guard.session().id(),
                        peer = %guard.label(),
                        lines,
                        "peer_branch_done"
                    ),
                    Err(e) => warn!(
                        session = %guard.session().id(),
                        peer = %guard.label(),
                        error = %e,
                        "peer_failed"
                    ),
                }
            });
        }
        drop(tx);

        info!(
            session = %id,
            pattern = %query.pattern,
            hops = query.hops,
            peers = peers.len(),
            "query_started"
        );

        QuerySession {
            rx,
            session,
            tasks,
            finished: false,
        }
    }
}

/// The merged output of one query.
///
/// Dropping a session aborts every branch still running; [`QuerySession::cancel`]
/// does the same and waits for them.
pub struct QuerySession {
    rx: mpsc::Receiver<String>,
    session: Arc<FanoutSession>,
    tasks: JoinSet<()>,
    finished: bool,
}

impl QuerySession {
    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Next line, then the terminal status once every branch has finished and
    /// every line was read. `None` after that.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.finished {
            return None;
        }
        if let Some(line) = self.rx.recv().await {
            return Some(SessionEvent::Line(line));
        }

        // Every sender is gone, so every branch has at least reached its guard's drop.
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
        self.finished = true;
        self.session.mark_closed();
        let outcome = self.session.outcome();
        debug!(session = %self.session.id(), ok = outcome.is_ok(), "query_finished");
        Some(SessionEvent::Finished(outcome))
    }

    /// Abort all branches, kill their filter processes and close their peer
    /// connections, then wait for them to stop.
    pub async fn cancel(mut self) {
        self.rx.close();
        self.tasks.shutdown().await;
        self.finished = true;
        self.session.mark_closed();
        info!(session = %self.session.id(), "query_cancelled");
    }

    /// Read the whole stream. Lines are returned even when the query failed.
    pub async fn collect(mut self) -> (Vec<String>, Result<(), LocalSearchError>) {
        let mut lines = Vec::new();
        while let Some(event) = self.next_event().await {
            match event {
                SessionEvent::Line(line) => lines.push(line),
                SessionEvent::Finished(outcome) => return (lines, outcome),
            }
        }
        (lines, self.session.outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir, peers: Vec<Peer>) -> Arc<NodeConfig> {
        Arc::new(NodeConfig {
            log_dir: dir.path().to_path_buf(),
            peers,
            dial_timeout: Duration::from_millis(300),
            read_timeout: Duration::from_millis(500),
            ..NodeConfig::default()
        })
    }

    fn dead_peer() -> Peer {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Peer::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_local_only_query() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("log0.log"), "abc1\nxyz\nabc2\n").unwrap();
        let coordinator = Coordinator::new(config_for(&tmp, Vec::new()));

        let (lines, outcome) = coordinator.handle_query(Query::new("abc")).collect().await;
        assert_eq!(lines, vec!["abc1", "abc2"]);
        assert_eq!(outcome, Ok(()));
    }

    #[tokio::test]
    async fn test_unreachable_peer_does_not_fail_query() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("log0.log"), "hit\n").unwrap();
        let coordinator = Coordinator::new(config_for(&tmp, vec![dead_peer()]));

        let (lines, outcome) = coordinator.handle_query(Query::new("hit")).collect().await;
        assert_eq!(lines, vec!["hit"]);
        assert_eq!(outcome, Ok(()));
    }

    #[tokio::test]
    async fn test_local_failure_is_terminal_status() {
        let tmp = TempDir::new().unwrap();
        let mut config = (*config_for(&tmp, Vec::new())).clone();
        config.log_dir = tmp.path().join("missing");
        let coordinator = Coordinator::new(Arc::new(config));

        let (lines, outcome) = coordinator.handle_query(Query::new("x")).collect().await;
        assert!(lines.is_empty());
        assert!(matches!(outcome, Err(LocalSearchError::ReadDir { .. })));
    }

    #[tokio::test]
    async fn test_finished_is_last_and_once() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("log0.log"), "a\n").unwrap();
        let coordinator = Coordinator::new(config_for(&tmp, Vec::new()));

        let mut session = coordinator.handle_query(Query::new("a"));
        assert_eq!(session.next_event().await, Some(SessionEvent::Line("a".into())));
        assert_eq!(session.next_event().await, Some(SessionEvent::Finished(Ok(()))));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.next_event().await, None);
    }

    #[tokio::test]
    async fn test_forwarded_query_skips_peers() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("log0.log"), "a\n").unwrap();
        // A peer that would hang the read if contacted.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = Peer::new("127.0.0.1", listener.local_addr().unwrap().port());
        let coordinator = Coordinator::new(config_for(&tmp, vec![peer]));

        let started = std::time::Instant::now();
        let (lines, outcome) = coordinator
            .handle_query(Query::new("a").forwarded())
            .collect()
            .await;
        assert_eq!(lines, vec!["a"]);
        assert_eq!(outcome, Ok(()));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_session_ids_are_distinct() {
        let tmp = TempDir::new().unwrap();
        let coordinator = Coordinator::new(config_for(&tmp, Vec::new()));
        let a = coordinator.handle_query(Query::new("a"));
        let b = coordinator.handle_query(Query::new("a"));
        assert_ne!(a.id(), b.id());
        a.cancel().await;
        b.cancel().await;
    }
}
