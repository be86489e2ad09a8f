//! The connection/process supervisor.
//!
//! A [`Supervisor`] owns the listener, the process table and the reporter.
//! Each call to [`Supervisor::tick`] performs one pass of
//!
//! 1. **reap**: collect exited workers, flushing what they wrote last
//! 2. **poll**: wait for the listener and the diagnostic pipes
//! 3. **forward**: turn diagnostic bytes into operator lines
//! 4. **admit**: accept at most one connection and spawn its worker
//!
//! Everything runs on the calling thread. The only blocking call is
//! `poll(2)`, and it is bounded whenever the table is full or a pipe is
//! muted, so exited workers are noticed without a child signal.

mod report;
mod table;
mod worker;

pub use report::{Reporter, SupervisorEvent, TracingReporter};
pub use table::{grown_capacity, ProcessTable, TableError};
pub use worker::{ErrorBuffer, ForwardError, ReadOutcome, WorkerProcess, MAX_LINE_LEN, READ_CHUNK};

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::process::Stdio;

use tracing::{debug, info, warn};

use crate::limits::AdmissionLimit;
use crate::listener::{Listener, ShellCommand};
use crate::nbio::{self, cvt};
use crate::remote::{accept_remote, is_transient_accept_error};

/// Environment variable carrying the peer label into each worker.
pub const REMOTE_ENV: &str = "REMOTE";

/// Poll timeout (milliseconds) while the listener is excluded or a pipe is muted.
pub const AT_CAPACITY_WAIT_MS: libc::c_int = 50;

/// Upper bound on chunks read from an exited worker's pipe.
const DRAIN_READS: usize = 512;

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while admitting a connection.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Could not create diagnostic pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("Could not duplicate connection descriptor: {0}")]
    Duplicate(#[source] io::Error),

    #[error("Could not start worker: {0}")]
    Spawn(#[source] io::Error),
}

/// Errors that end a tick early.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("Could not poll for events: {0}")]
    Poll(#[source] io::Error),

    #[error("Could not accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("Could not admit connection from '{remote}': {source}")]
    Admission {
        remote: String,
        #[source]
        source: AdmissionError,
    },
}

/// What a successful tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was forwarded or admitted
    Idle,
    /// A worker was reaped or admitted, or its pipe produced output
    Active,
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct Supervisor<R: Reporter = TracingReporter> {
    listener: Listener,
    command: ShellCommand,
    limit: AdmissionLimit,
    reporter: R,
    /// Created on the first tick
    table: Option<ProcessTable>,
}

impl<R: Reporter> Supervisor<R> {
    pub fn new(listener: Listener, command: ShellCommand, limit: AdmissionLimit, reporter: R) -> Self {
        Self {
            listener,
            command,
            limit,
            reporter,
            table: None,
        }
    }

    /// Runs one reap, poll, forward, admit pass.
    pub fn tick(&mut self) -> Result<TickOutcome, TickError> {
        let listener_fd = self.listener.as_fd().as_raw_fd();
        let table = self
            .table
            .get_or_insert_with(|| ProcessTable::new(listener_fd));

        let reaped = reap(table, &mut self.reporter);

        let accepting = table.len() < self.limit.get();
        // Anything reaped was already reported; only peek for more work
        let timeout = if reaped {
            0
        } else {
            wait_timeout(accepting, table.any_muted())
        };
        let idle = if reaped {
            TickOutcome::Active
        } else {
            TickOutcome::Idle
        };
        let ready = match poll(table.poll_slots(accepting), timeout) {
            Ok(ready) => ready,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(idle),
            Err(e) => return Err(TickError::Poll(e)),
        };
        if ready == 0 {
            return Ok(idle);
        }

        let mut active = reaped | forward(table, &mut self.reporter);

        if accepting && table.listener_ready() {
            active |= admit(
                table,
                &self.listener,
                &self.command,
                &mut self.reporter,
            )?;
        }

        Ok(if active {
            TickOutcome::Active
        } else {
            TickOutcome::Idle
        })
    }

    /// Number of tracked workers (`nproc`).
    pub fn nproc(&self) -> usize {
        self.table.as_ref().map_or(0, ProcessTable::len)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.table.as_ref().map(ProcessTable::pids).unwrap_or_default()
    }

    pub fn limit(&self) -> AdmissionLimit {
        self.limit
    }

    pub fn table(&self) -> Option<&ProcessTable> {
        self.table.as_ref()
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Tears the supervisor down, closing every diagnostic pipe and the listener.
    ///
    /// Running workers are left alone; they keep their connections.
    pub fn shutdown(self) {
        info!(
            address = %self.listener.address(),
            workers = self.nproc(),
            "Supervisor shutting down"
        );
    }
}

fn wait_timeout(accepting: bool, any_muted: bool) -> libc::c_int {
    if accepting && !any_muted {
        -1
    } else {
        AT_CAPACITY_WAIT_MS
    }
}

fn poll(slots: &mut [libc::pollfd], timeout: libc::c_int) -> io::Result<usize> {
    let ready = cvt(unsafe {
        libc::poll(slots.as_mut_ptr(), slots.len() as libc::nfds_t, timeout)
    })?;
    Ok(ready as usize)
}

/// Removes every worker that has exited since the last tick.
///
/// Returns whether any worker was removed.
fn reap<R: Reporter>(table: &mut ProcessTable, reporter: &mut R) -> bool {
    let mut reaped = false;
    let mut index = 0;
    while let Some(worker) = table.worker_mut(index) {
        let pid = worker.pid();
        match worker.try_reap() {
            Ok(Some(status)) => {
                worker.drain(reporter, DRAIN_READS);
                reporter.report(SupervisorEvent::Exited { pid, status });
                // The last worker now sits at `index`
                table.remove(index);
                reaped = true;
            }
            Ok(None) => index += 1,
            Err(e) => {
                warn!(pid, error = %e, "Could not wait for worker, dropping it");
                table.remove(index);
                reaped = true;
            }
        }
    }
    reaped
}

/// Forwards diagnostics for every worker the last poll flagged.
fn forward<R: Reporter>(table: &mut ProcessTable, reporter: &mut R) -> bool {
    let mut active = false;

    for index in 0..table.len() {
        let revents = table.revents(index);
        if revents == 0 {
            continue;
        }
        let Some(worker) = table.worker_mut(index) else {
            break;
        };
        let pid = worker.pid();

        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            reporter.report(SupervisorEvent::PipeError { pid });
            table.mute(index);
            continue;
        }
        if revents & (libc::POLLIN | libc::POLLHUP) == 0 {
            continue;
        }

        match worker.forward(reporter) {
            Ok(ReadOutcome::Data) => active = true,
            Ok(ReadOutcome::Eof) => {
                debug!(pid, "Diagnostic pipe closed");
                table.mute(index);
                active = true;
            }
            Ok(ReadOutcome::Empty) => {}
            Err(e) => {
                let overflowed = !matches!(e, ForwardError::Read(_));
                reporter.report(SupervisorEvent::ForwardFailed {
                    pid,
                    reason: e.to_string(),
                });
                if overflowed {
                    // Emit the capped line and keep reading
                    worker.flush_partial(reporter);
                    active = true;
                } else {
                    table.mute(index);
                }
            }
        }
    }

    active
}

/// Accepts one pending connection and spawns its worker.
///
/// Returns `false` when the wakeup turned out to be spurious.
fn admit<R: Reporter>(
    table: &mut ProcessTable,
    listener: &Listener,
    command: &ShellCommand,
    reporter: &mut R,
) -> Result<bool, TickError> {
    let (connection, peer) = match accept_remote(listener.as_fd()) {
        Ok(accepted) => accepted,
        Err(e) if is_transient_accept_error(&e) => {
            debug!(error = %e, "Ignoring transient accept failure");
            return Ok(false);
        }
        Err(e) => return Err(TickError::Accept(e)),
    };

    let remote = peer.label();
    let worker = match spawn(table, command, connection, &remote) {
        Ok(worker) => worker,
        Err(source) => return Err(TickError::Admission { remote, source }),
    };

    reporter.report(SupervisorEvent::Created {
        pid: worker.pid(),
        remote,
    });
    table.push(worker);
    Ok(true)
}

/// Starts `sh -c <command>` on a connection.
///
/// The connection becomes the worker's stdin and stdout and is closed in
/// the parent when this returns, whether or not the spawn succeeded.
fn spawn(
    table: &mut ProcessTable,
    command: &ShellCommand,
    connection: OwnedFd,
    remote: &str,
) -> Result<WorkerProcess, AdmissionError> {
    let (diagnostics, stderr) = nbio::nonblocking_pipe().map_err(AdmissionError::Pipe)?;
    table.reserve_one()?;
    let stdin = connection.try_clone().map_err(AdmissionError::Duplicate)?;

    let mut child = command.command();
    child
        .env(REMOTE_ENV, remote)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(connection))
        .stderr(Stdio::from(stderr));
    let spawned = child.spawn();
    // Closes the parent's copies of the connection and the write end
    drop(child);

    let child = spawned.map_err(AdmissionError::Spawn)?;
    Ok(WorkerProcess::new(child, diagnostics))
}
