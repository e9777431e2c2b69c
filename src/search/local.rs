//! Local log search: one filter process per log file, output streamed line by line.
//!
//! The filter (by default `grep`) is invoked directly, never through a shell,
//! as `program <args..> -e <pattern> <file>`. Matching semantics are entirely
//! the filter's; this module only frames its stdout and interprets its exit
//! status.
//!
//! Two entry points decide who closes the output:
//!
//! - [`LocalSearch::search_into`] writes into a sink the caller owns and leaves
//!   it open, so several producers can share one sink (the fan-out path).
//! - [`LocalSearch::spawn`] owns its sink and closes it when the search ends.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::framing::{LineFramer, line_to_string};
use super::{LocalSearchError, SearchStats};
use crate::fanout::SessionEvent;

/// Read size for filter stdout. Lines longer than this are re-assembled by the framer.
const READ_CHUNK: usize = 64 * 1024;

/// The external line filter and how to read its exit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCommand {
    /// Program to run, resolved through `PATH` when not absolute.
    pub program: String,
    /// Extra arguments placed before `-e <pattern> <file>`.
    pub args: Vec<String>,
    /// Exit code meaning "ran fine, nothing matched".
    pub no_match_code: i32,
}

impl Default for FilterCommand {
    fn default() -> Self {
        Self {
            program: "grep".to_string(),
            args: Vec::new(),
            no_match_code: 1,
        }
    }
}

impl FilterCommand {
    fn command(&self, pattern: &str, path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-e")
            .arg(pattern)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn accepts(&self, code: Option<i32>) -> bool {
        matches!(code, Some(0)) || code == Some(self.no_match_code)
    }
}

/// Searches every file of one log directory.
#[derive(Debug, Clone)]
pub struct LocalSearch {
    log_dir: PathBuf,
    filter: FilterCommand,
}

impl LocalSearch {
    pub fn new(log_dir: impl Into<PathBuf>, filter: FilterCommand) -> Self {
        Self {
            log_dir: log_dir.into(),
            filter,
        }
    }

    /// Run the filter over every file, sending matched lines into `sink`.
    ///
    /// The sink is left open. Files are processed in name order and each
    /// file's lines keep their order. The first failure aborts the remaining
    /// files; lines already sent stay sent.
    pub async fn search_into(
        &self,
        pattern: &str,
        sink: &mpsc::Sender<String>,
    ) -> Result<SearchStats, LocalSearchError> {
        let files = list_log_files(&self.log_dir).await?;
        let mut stats = SearchStats::default();

        for path in &files {
            let lines = self.grep_file(pattern, path, sink).await?;
            stats.files += 1;
            stats.lines += lines;
            debug!(file = %path.display(), lines, "filter_file_done");
        }

        debug!(
            dir = %self.log_dir.display(),
            files = stats.files,
            lines = stats.lines,
            "local_search_complete"
        );
        Ok(stats)
    }

    /// Run the search on its own task with its own sink, closed when the search ends.
    pub fn spawn(&self, pattern: impl Into<String>, capacity: usize) -> LocalStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let search = self.clone();
        let pattern = pattern.into();
        let handle = tokio::spawn(async move { search.search_into(&pattern, &tx).await });
        LocalStream {
            rx,
            handle,
            finished: false,
        }
    }

    async fn grep_file(
        &self,
        pattern: &str,
        path: &Path,
        sink: &mpsc::Sender<String>,
    ) -> Result<usize, LocalSearchError> {
        let mut child = self
            .filter
            .command(pattern, path)
            .spawn()
            .map_err(|e| LocalSearchError::Spawn {
                program: self.filter.program.clone(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| LocalSearchError::Spawn {
            program: self.filter.program.clone(),
            reason: "stdout was not captured".to_string(),
        })?;
        let stderr = child.stderr.take();
        let capture_stderr = async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            Ok::<_, LocalSearchError>(buf)
        };

        // On error the child is dropped here and killed.
        let (lines, stderr) = tokio::try_join!(forward_lines(stdout, path, sink), capture_stderr)?;

        let status = child.wait().await.map_err(|e| LocalSearchError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if self.filter.accepts(status.code()) {
            return Ok(lines);
        }

        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
        warn!(
            file = %path.display(),
            status = %status,
            stderr = %stderr,
            "filter_failed"
        );
        Err(LocalSearchError::FilterFailed {
            path: path.to_path_buf(),
            status: status.to_string(),
            stderr,
        })
    }
}

/// List the files of `dir` in name order, following symlinks.
///
/// Sub-directories and entries that are not regular files are skipped, as
/// are dangling links.
pub async fn list_log_files(dir: &Path) -> Result<Vec<PathBuf>, LocalSearchError> {
    let read_err = |e: std::io::Error| LocalSearchError::ReadDir {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_err)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        let path = entry.path();
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => files.push(path),
            Ok(_) => debug!(path = %path.display(), "skipping_non_file"),
            Err(e) => debug!(path = %path.display(), error = %e, "skipping_unreadable_entry"),
        }
    }
    files.sort();
    Ok(files)
}

/// Frame `reader` into lines and send each one as soon as it is complete.
async fn forward_lines<R>(
    mut reader: R,
    path: &Path,
    sink: &mpsc::Sender<String>,
) -> Result<usize, LocalSearchError>
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut sent = 0usize;

    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| LocalSearchError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if n == 0 {
            break;
        }
        framer.push(&chunk[..n]);
        while let Some(line) = framer.next_line() {
            sink.send(line_to_string(line))
                .await
                .map_err(|_| LocalSearchError::Cancelled)?;
            sent += 1;
        }
    }

    if let Some(tail) = framer.finish() {
        sink.send(line_to_string(tail))
            .await
            .map_err(|_| LocalSearchError::Cancelled)?;
        sent += 1;
    }

    Ok(sent)
}

/// A local search running on its own task. Dropping it aborts the search.
pub struct LocalStream {
    rx: mpsc::Receiver<String>,
    handle: JoinHandle<Result<SearchStats, LocalSearchError>>,
    finished: bool,
}

impl LocalStream {
    /// Next matched line, or `None` once the search has ended and every line was read.
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Same shape as [`crate::fanout::QuerySession::next_event`].
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.finished {
            return None;
        }
        if let Some(line) = self.rx.recv().await {
            return Some(SessionEvent::Line(line));
        }
        self.finished = true;
        Some(SessionEvent::Finished(self.join().await.map(|_| ())))
    }

    /// Wait for the search to end, discarding lines not read yet.
    pub async fn finish(mut self) -> Result<SearchStats, LocalSearchError> {
        while self.rx.recv().await.is_some() {}
        self.finished = true;
        self.join().await
    }

    /// Abort the search and wait for its task, killing any running filter.
    pub async fn cancel(mut self) {
        self.rx.close();
        self.handle.abort();
        let _ = (&mut self.handle).await;
        self.finished = true;
    }

    async fn join(&mut self) -> Result<SearchStats, LocalSearchError> {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(LocalSearchError::Cancelled),
        }
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
