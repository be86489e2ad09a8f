//! Tick results when `poll(2)` itself is interrupted or fails.
//!
//! These tests change process-wide state (signal dispositions, the open file
//! limit), so they live in their own test binary and run one at a time.

#![cfg(target_os = "linux")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serve_core::{ListenAddress, SocketKind};
use served::{AdmissionLimit, Listener, ShellCommand, Supervisor, SupervisorEvent, TickError, TickOutcome};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn supervisor() -> Supervisor<Vec<SupervisorEvent>> {
    let address: ListenAddress = "inet 127.0.0.1 0".parse().unwrap();
    Supervisor::new(
        Listener::bind(&address, SocketKind::Stream, 4).unwrap(),
        ShellCommand::new("true"),
        AdmissionLimit::new(4).unwrap(),
        Vec::new(),
    )
}

extern "C" fn wake(_sig: libc::c_int) {}

#[test]
fn test_interrupted_poll_is_idle() {
    let _guard = serial();
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = wake as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = 0;
        assert_eq!(libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()), 0);
    }

    let mut supervisor = supervisor();
    let target = unsafe { libc::pthread_self() };
    let done = Arc::new(AtomicBool::new(false));
    let signaller = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            // Keep poking until the tick notices; the first signal may land
            // before the tick reaches poll
            while !done.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(100));
                unsafe { libc::pthread_kill(target, libc::SIGUSR1) };
            }
        })
    };

    let outcome = supervisor.tick();
    done.store(true, Ordering::Relaxed);
    signaller.join().unwrap();

    assert_eq!(outcome.unwrap(), TickOutcome::Idle);
    assert!(supervisor.reporter().is_empty());
}

#[test]
fn test_poll_failure_ends_the_tick() {
    let _guard = serial();
    let mut supervisor = supervisor();

    let mut saved = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut saved) }, 0);
    let lowered = libc::rlimit {
        rlim_cur: 0,
        rlim_max: saved.rlim_max,
    };

    // poll(2) rejects more slots than RLIMIT_NOFILE allows
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lowered) }, 0);
    let result = supervisor.tick();
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &saved) }, 0);

    match result {
        Err(TickError::Poll(e)) => assert_eq!(e.raw_os_error(), Some(libc::EINVAL)),
        other => panic!("expected a poll failure, got {other:?}"),
    }
    assert_eq!(supervisor.nproc(), 0);
}
