//! Local log search.
//!
//! - **[`framing`]**: byte-exact `\n` splitting of filter output.
//! - **[`local`]**: runs the external filter over every file in the log
//!   directory and streams matched lines into a sink.
//!
//! The types shared with the fan-out layer and the wire protocol ([`Query`],
//! [`LocalSearchError`]) live here.

pub mod framing;
pub mod local;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use framing::LineFramer;
pub use local::{FilterCommand, LocalSearch, LocalStream};

/// One search request. Immutable once issued; every branch reads the same copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Pattern handed verbatim to the filter process.
    pub pattern: String,
    /// How many coordinators this query has already passed through.
    /// Clients send 0; each forward to a peer adds 1.
    pub hops: u32,
}

impl Query {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            hops: 0,
        }
    }

    /// The copy sent on to peers.
    pub fn forwarded(&self) -> Self {
        Self {
            pattern: self.pattern.clone(),
            hops: self.hops.saturating_add(1),
        }
    }

    /// Whether a node allowing `max_hops` levels should forward this query.
    pub fn may_fan_out(&self, max_hops: u32) -> bool {
        self.hops < max_hops
    }
}

/// Failures of the local branch. Any of these is the terminal status of a query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocalSearchError {
    #[error("could not read logs in {path}: {reason}")]
    ReadDir { path: PathBuf, reason: String },

    #[error("could not start filter `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    #[error("failed reading filter output for {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("filter exited with {status} on {path}: {stderr}")]
    FilterFailed {
        path: PathBuf,
        status: String,
        stderr: String,
    },

    /// The consumer went away before the search finished.
    #[error("search cancelled")]
    Cancelled,
}

/// Counters reported when a local search completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    /// Files the filter ran over.
    pub files: usize,
    /// Lines forwarded to the sink.
    pub lines: usize,
}
