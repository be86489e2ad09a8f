//! Operator-facing supervisor events.
//!
//! The `Display` form of every event is the exact line operators (and
//! scripts scraping the output) see.

use std::fmt;

use tracing::{info, warn};

/// Something the operator should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A worker was spawned for a connection
    Created { pid: u32, remote: String },

    /// A worker was reaped; `status` is the raw wait status
    Exited { pid: u32, status: i32 },

    /// One line the worker wrote to stderr (newline stripped)
    Line { pid: u32, line: String },

    /// The worker's diagnostic pipe reported an error condition
    PipeError { pid: u32 },

    /// Reading or buffering the worker's diagnostics failed
    ForwardFailed { pid: u32, reason: String },
}

impl SupervisorEvent {
    /// Returns the pid of the worker the event is about.
    pub fn pid(&self) -> u32 {
        match self {
            Self::Created { pid, .. }
            | Self::Exited { pid, .. }
            | Self::Line { pid, .. }
            | Self::PipeError { pid }
            | Self::ForwardFailed { pid, .. } => *pid,
        }
    }
}

impl fmt::Display for SupervisorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created { pid, remote } => write!(f, "Process {pid} created ({remote})"),
            Self::Exited { pid, status } => write!(f, "Process {pid} exited ({status})"),
            Self::Line { pid, line } => write!(f, "{pid}: {line}"),
            Self::PipeError { pid } => write!(f, "Process {pid} has a pipe error"),
            Self::ForwardFailed { pid, reason } => {
                write!(f, "Could not forward I/O for process {pid}: {reason}")
            }
        }
    }
}

/// Sink for supervisor events.
pub trait Reporter {
    fn report(&mut self, event: SupervisorEvent);
}

/// Reports events through `tracing` under the `served::process` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::PipeError { .. } | SupervisorEvent::ForwardFailed { .. } => {
                warn!(target: "served::process", "{event}");
            }
            _ => info!(target: "served::process", "{event}"),
        }
    }
}

/// Collects events in memory.
impl Reporter for Vec<SupervisorEvent> {
    fn report(&mut self, event: SupervisorEvent) {
        self.push(event);
    }
}
