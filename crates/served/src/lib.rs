//! served - the serve connection supervisor
//!
//! This crate turns a listening socket into one supervised shell command per
//! accepted connection:
//! - `listener` - binds the listening socket, holds the worker command
//! - `remote` - accepts connections and labels their peers
//! - `limits` - derives how many workers may run at once
//! - `supervisor` - the single-threaded reap/poll/forward/admit loop
//! - `driver` - ticks the supervisor until SIGINT/SIGTERM
//! - `cli` - argument parsing, logging setup and daemon mode
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        serve                               │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │  ┌──────────────┐   accept    ┌──────────────────────────┐ │
//! │  │   Listener   │────────────▶│       Supervisor         │ │
//! │  │ (non-block)  │             │  ProcessTable + pollfds  │ │
//! │  └──────────────┘             └─────┬──────────────▲─────┘ │
//! │                                     │ sh -c        │ stderr│
//! │                                     ▼              │ pipe  │
//! │                               ┌──────────────────────────┐ │
//! │  peer ◀── stdin/stdout ──────▶│     WorkerProcess(es)    │ │
//! │                               └──────────────────────────┘ │
//! │                                                            │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Production code follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Allocation for per-connection state is fallible and reported

pub mod cli;
pub mod driver;
pub mod limits;
pub mod listener;
pub mod nbio;
pub mod remote;
pub mod supervisor;

mod sockaddr;

pub use driver::{ShutdownFlag, Tick};
pub use limits::AdmissionLimit;
pub use listener::{Listener, ShellCommand};
pub use supervisor::{Reporter, Supervisor, SupervisorEvent, TickError, TickOutcome};
