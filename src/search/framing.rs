//! Line framing for filter-process output.
//!
//! The filter writes matched lines to a pipe that is read in arbitrary chunks,
//! so a line may straddle any number of reads. [`LineFramer`] re-assembles
//! them with the following rule, independent of line length:
//!
//! - a line is every byte up to (not including) the next `\n`; the delimiter
//!   is consumed;
//! - at end of input, leftover bytes without a trailing `\n` form one final
//!   line;
//! - at end of input with nothing left over, no further line is produced (a
//!   trailing `\n` never yields an empty line).

/// Incremental `\n` splitter over a byte stream.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Start of the first unconsumed byte in `buf`.
    start: usize,
    /// Bytes in `buf[start..scanned]` are known to contain no `\n`.
    scanned: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the underlying stream.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.start > 0 && self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
            self.scanned = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete (`\n`-terminated) line, without its delimiter.
    ///
    /// Returns `None` once only an unterminated tail remains; push more input
    /// or call [`LineFramer::finish`].
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let from = self.scanned.max(self.start);
        match self.buf[from..].iter().position(|&b| b == b'\n') {
            Some(offset) => {
                let end = from + offset;
                let line = self.buf[self.start..end].to_vec();
                self.start = end + 1;
                self.scanned = self.start;
                Some(line)
            }
            None => {
                self.compact();
                self.scanned = self.buf.len();
                None
            }
        }
    }

    /// Signal end of input and take the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.start >= self.buf.len() {
            self.buf.clear();
            self.start = 0;
            self.scanned = 0;
            return None;
        }
        let tail = self.buf.split_off(self.start);
        self.buf.clear();
        self.start = 0;
        self.scanned = 0;
        Some(tail)
    }

    /// Bytes received but not yet returned as a line.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.start
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.scanned -= self.start.min(self.scanned);
            self.start = 0;
        }
    }
}

/// Decode a framed line for the string-typed result stream.
///
/// Filter output is not guaranteed to be UTF-8; invalid sequences are
/// replaced rather than failing the whole query.
pub fn line_to_string(line: Vec<u8>) -> String {
    match String::from_utf8(line) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}
