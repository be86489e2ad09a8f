//! Worker processes and diagnostic line reassembly.

use std::collections::TryReserveError;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::Child;

use tracing::debug;

use super::report::{Reporter, SupervisorEvent};

/// Bytes read from a diagnostic pipe per forwarding step.
pub const READ_CHUNK: usize = 128;

/// Longest unterminated line a worker may have buffered.
pub const MAX_LINE_LEN: usize = 65534;

/// Errors that can occur while forwarding a worker's diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("{0}")]
    Read(#[from] io::Error),

    #[error("Diagnostic line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Cannot allocate memory for diagnostic line: {0}")]
    OutOfMemory(#[from] TryReserveError),
}

// ============================================================================
// Error Buffer
// ============================================================================

/// Diagnostic bytes read from a worker but not yet terminated by a newline.
///
/// Invariant: between calls the buffer never contains `\n`; every complete
/// line is taken out by [`ErrorBuffer::next_line`] right after a fill.
#[derive(Debug, Default)]
pub struct ErrorBuffer {
    bytes: Vec<u8>,
    /// Leading bytes already known to hold no newline
    scanned: usize,
}

impl ErrorBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Appends at most [`READ_CHUNK`] bytes read from `reader`.
    ///
    /// Returns the number of bytes appended; `0` means end of file. Fails
    /// without reading when the chunk could push the buffer past
    /// [`MAX_LINE_LEN`].
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<usize, ForwardError> {
        if self.bytes.len() > MAX_LINE_LEN - READ_CHUNK {
            return Err(ForwardError::LineTooLong {
                limit: MAX_LINE_LEN,
            });
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = reader.read(&mut chunk)?;
        self.bytes.try_reserve(n)?;
        self.bytes.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Removes and returns the first complete line, without its newline.
    pub fn next_line(&mut self) -> Option<String> {
        let Some(offset) = self.bytes[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.bytes.len();
            return None;
        };
        let end = self.scanned + offset;
        self.scanned = 0;
        let mut line: Vec<u8> = self.bytes.drain(..=end).collect();
        line.pop();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Removes and returns whatever unterminated bytes remain.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.bytes.is_empty() {
            return None;
        }
        self.scanned = 0;
        let rest = std::mem::take(&mut self.bytes);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

// ============================================================================
// Worker Process
// ============================================================================

/// Result of one forwarding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were read (and any complete lines reported)
    Data,
    /// The write end is closed everywhere
    Eof,
    /// Nothing to read right now
    Empty,
}

/// One live subprocess handling one connection.
#[derive(Debug)]
pub struct WorkerProcess {
    /// Handle used for non-blocking reaping
    child: Child,

    /// Cached pid, the worker's only stable identity
    pid: u32,

    /// Read end of the worker's stderr pipe
    diagnostics: File,

    /// Partial diagnostic line
    buffer: ErrorBuffer,

    /// Pipe hung up or failed; no longer polled
    muted: bool,
}

impl WorkerProcess {
    /// Wraps a freshly spawned child and the read end of its stderr pipe.
    pub fn new(child: Child, diagnostics: OwnedFd) -> Self {
        Self {
            pid: child.id(),
            child,
            diagnostics: File::from(diagnostics),
            buffer: ErrorBuffer::new(),
            muted: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn diagnostic_fd(&self) -> RawFd {
        self.diagnostics.as_raw_fd()
    }

    /// Number of buffered, unterminated diagnostic bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub(crate) fn set_muted(&mut self) {
        self.muted = true;
    }

    /// Checks without blocking whether the worker has exited.
    ///
    /// Returns the raw wait status once it has.
    pub(crate) fn try_reap(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(|status| status.into_raw()))
    }

    /// Reads one chunk of diagnostics and reports every completed line.
    pub(crate) fn forward<R: Reporter>(
        &mut self,
        reporter: &mut R,
    ) -> Result<ReadOutcome, ForwardError> {
        let outcome = match self.buffer.fill_from(&mut self.diagnostics) {
            Ok(0) => ReadOutcome::Eof,
            Ok(_) => ReadOutcome::Data,
            Err(ForwardError::Read(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(ReadOutcome::Empty);
            }
            Err(e) => return Err(e),
        };

        while let Some(line) = self.buffer.next_line() {
            reporter.report(SupervisorEvent::Line {
                pid: self.pid,
                line,
            });
        }
        Ok(outcome)
    }

    /// Reports the buffered partial line as if it were complete.
    ///
    /// Used when the line outgrew [`MAX_LINE_LEN`]; the rest of it arrives
    /// as the next line.
    pub(crate) fn flush_partial<R: Reporter>(&mut self, reporter: &mut R) {
        if let Some(line) = self.buffer.take_remainder() {
            reporter.report(SupervisorEvent::Line {
                pid: self.pid,
                line,
            });
        }
    }

    /// Forwards everything still in the pipe, then flushes the partial line.
    ///
    /// Called once the worker has exited. At most `max_reads` chunks are
    /// read so a grandchild that inherited stderr cannot stall reaping.
    pub(crate) fn drain<R: Reporter>(&mut self, reporter: &mut R, max_reads: usize) {
        for _ in 0..max_reads {
            match self.forward(reporter) {
                Ok(ReadOutcome::Data) => continue,
                Ok(ReadOutcome::Eof | ReadOutcome::Empty) => break,
                Err(e @ ForwardError::LineTooLong { .. }) => {
                    reporter.report(SupervisorEvent::ForwardFailed {
                        pid: self.pid,
                        reason: e.to_string(),
                    });
                    self.flush_partial(reporter);
                }
                Err(e) => {
                    debug!(pid = self.pid, error = %e, "Stopped draining diagnostics");
                    break;
                }
            }
        }

        self.flush_partial(reporter);
    }
}
