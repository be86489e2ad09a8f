//! The top-level loop: tick the supervisor until a shutdown signal arrives.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::supervisor::{Reporter, Supervisor, TickError, TickOutcome};

/// Pause after a failed tick before trying again.
pub const ERROR_BACKOFF: Duration = Duration::from_millis(10);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

// ============================================================================
// Shutdown Flag
// ============================================================================

/// Process-wide "please stop" flag, checked between ticks.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownFlag(&'static AtomicBool);

impl ShutdownFlag {
    /// Routes SIGINT and SIGTERM to the process-wide flag.
    ///
    /// The handlers are one-shot: a second signal gets the default action,
    /// so an unresponsive supervisor can still be killed from the terminal.
    /// `SA_RESTART` is left out so a pending `poll(2)` returns `EINTR`.
    pub fn install() -> io::Result<Self> {
        for signal in [libc::SIGINT, libc::SIGTERM] {
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction =
                    request_shutdown as extern "C" fn(libc::c_int) as libc::sighandler_t;
                action.sa_flags = libc::SA_RESETHAND;
                libc::sigfillset(&mut action.sa_mask);
                if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        debug!("Installed shutdown signal handlers");
        Ok(Self(&SHUTDOWN))
    }

    /// Wraps a caller-provided flag; no signal handlers are touched.
    pub fn from_static(flag: &'static AtomicBool) -> Self {
        Self(flag)
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

// ============================================================================
// Driver Loop
// ============================================================================

/// Anything the driver can repeatedly tick.
pub trait Tick {
    fn tick(&mut self) -> Result<TickOutcome, TickError>;
}

impl<R: Reporter> Tick for Supervisor<R> {
    fn tick(&mut self) -> Result<TickOutcome, TickError> {
        Supervisor::tick(self)
    }
}

/// Counters collected over one driver run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    pub ticks: u64,
    pub idle: u64,
    pub errors: u64,
}

/// Ticks until `shutdown` is requested.
///
/// A tick error is logged and followed by a short pause; it never ends the
/// loop. The flag is only checked between ticks, so the tick in progress
/// when a signal arrives always completes.
pub fn run<T: Tick>(ticker: &mut T, shutdown: ShutdownFlag) -> DriverStats {
    let mut stats = DriverStats::default();

    while !shutdown.is_requested() {
        stats.ticks += 1;
        match ticker.tick() {
            Ok(TickOutcome::Active) => {}
            Ok(TickOutcome::Idle) => {
                stats.idle += 1;
                thread::yield_now();
            }
            Err(e) => {
                stats.errors += 1;
                error!("Internal error while running the executor: {e}");
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    info!(ticks = stats.ticks, errors = stats.errors, "Shutdown requested");
    stats
}
