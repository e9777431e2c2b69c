//! Per-query completion tracking.
//!
//! A [`FanoutSession`] counts the branches that have not finished yet and
//! keeps the first local error. Each branch holds a [`BranchGuard`], which owns
//! that branch's only handle on the merge sink. Dropping the guard releases the
//! sender before decrementing the counter, so the branch that brings the
//! counter to zero has also released the last sender, and the sink is closed
//! by that drop. The consumer never has to race a separate "done" signal
//! against the data channel: it drains until the channel reports closed.

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use crate::search::LocalSearchError;

/// Lifecycle of one query session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// At least one branch is still producing.
    Fanning,
    /// Every branch has finished; buffered lines may still be unread.
    Draining,
    /// Everything was forwarded and the terminal status delivered.
    Closed,
}

/// Shared state of one query: pending-branch counter and first-error slot.
#[derive(Debug)]
pub struct FanoutSession {
    id: String,
    pending: AtomicUsize,
    first_error: OnceLock<LocalSearchError>,
    closed: AtomicBool,
}

impl FanoutSession {
    pub fn new(id: impl Into<String>, branches: usize) -> Self {
        Self {
            id: id.into(),
            pending: AtomicUsize::new(branches),
            first_error: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Branches that have not terminated yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            SessionState::Closed
        } else if self.pending() > 0 {
            SessionState::Fanning
        } else {
            SessionState::Draining
        }
    }

    /// Record a fatal error. The first write wins; later ones are dropped.
    /// Returns whether this call filled the slot.
    pub fn record_error(&self, error: LocalSearchError) -> bool {
        self.first_error.set(error).is_ok()
    }

    pub fn first_error(&self) -> Option<&LocalSearchError> {
        self.first_error.get()
    }

    /// Terminal status: the first recorded error, else success.
    pub fn outcome(&self) -> Result<(), LocalSearchError> {
        match self.first_error.get() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn branch_finished(&self, branch: &str) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "branch counter underflow");
        let remaining = previous - 1;
        debug!(session = %self.id, branch, remaining, "branch_finished");
        if remaining == 0 {
            debug!(session = %self.id, "session_drained");
        }
    }
}

/// One branch's handle on the session: its sink sender plus the obligation to
/// count itself out exactly once.
///
/// Field order matters: `sink` is dropped before `exit`, so the sender is gone
/// by the time the counter is decremented.
pub struct BranchGuard {
    sink: mpsc::Sender<String>,
    exit: BranchExit,
}

struct BranchExit {
    label: String,
    session: Arc<FanoutSession>,
}

impl BranchGuard {
    pub fn new(
        label: impl Into<String>,
        sink: mpsc::Sender<String>,
        session: Arc<FanoutSession>,
    ) -> Self {
        Self {
            sink,
            exit: BranchExit {
                label: label.into(),
                session,
            },
        }
    }

    pub fn label(&self) -> &str {
        &self.exit.label
    }

    /// The branch's producer side of the merge sink.
    pub fn sink(&self) -> &mpsc::Sender<String> {
        &self.sink
    }

    pub fn session(&self) -> &FanoutSession {
        &self.exit.session
    }
}

impl Drop for BranchExit {
    fn drop(&mut self) {
        self.session.branch_finished(&self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_wins() {
        let session = FanoutSession::new("s", 1);
        assert!(session.record_error(LocalSearchError::Cancelled));
        assert!(!session.record_error(LocalSearchError::Spawn {
            program: "grep".into(),
            reason: "later".into(),
        }));
        assert_eq!(session.first_error(), Some(&LocalSearchError::Cancelled));
        assert_eq!(session.outcome(), Err(LocalSearchError::Cancelled));
    }

    #[test]
    fn test_outcome_ok_without_error() {
        let session = FanoutSession::new("s", 0);
        assert_eq!(session.outcome(), Ok(()));
    }

    #[test]
    fn test_state_transitions() {
        let session = Arc::new(FanoutSession::new("s", 2));
        let (tx, _rx) = mpsc::channel::<String>(1);
        let a = BranchGuard::new("local", tx.clone(), session.clone());
        let b = BranchGuard::new("peer", tx, session.clone());
        assert_eq!(session.state(), SessionState::Fanning);
        drop(a);
        assert_eq!(session.pending(), 1);
        assert_eq!(session.state(), SessionState::Fanning);
        drop(b);
        assert_eq!(session.state(), SessionState::Draining);
        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_last_guard_closes_sink_after_buffered_lines() {
        let session = Arc::new(FanoutSession::new("s", 2));
        let (tx, mut rx) = mpsc::channel::<String>(8);
        let a = BranchGuard::new("a", tx.clone(), session.clone());
        let b = BranchGuard::new("b", tx, session.clone());

        a.sink().send("from a".into()).await.unwrap();
        drop(a);
        b.sink().send("from b".into()).await.unwrap();
        drop(b);

        assert_eq!(session.pending(), 0);
        // Everything enqueued before the close is still delivered.
        assert_eq!(rx.recv().await.as_deref(), Some("from a"));
        assert_eq!(rx.recv().await.as_deref(), Some("from b"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_guard_dropped_by_abort_still_counts_out() {
        let session = Arc::new(FanoutSession::new("s", 1));
        let (tx, mut rx) = mpsc::channel::<String>(1);
        let guard = BranchGuard::new("stuck", tx, session.clone());
        let task = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        task.abort();
        let _ = task.await;
        assert_eq!(session.pending(), 0);
        assert_eq!(rx.recv().await, None);
    }
}
