//! Command-line entry point for the `serve` binary.
//!
//! # Usage
//!
//! ```text
//! # Echo server on the default address (inet 0.0.0.0 4869)
//! serve cat
//!
//! # Greet unix socket peers, at most 16 at a time
//! serve -a "unix /tmp/greet.sock" -m 16 'echo "hello $REMOTE"'
//!
//! # Detach, logging to $XDG_STATE_HOME/serve/serve.log
//! serve -d -a "inet6 :: 7000" ./handler.sh
//! ```
//!
//! Options override the configuration file, which overrides the defaults.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use serve_core::{ListenAddress, ServeConfig, SocketKind};

use crate::driver::{self, ShutdownFlag};
use crate::limits::{AdmissionLimit, DEFAULT_MAX_PROCESSES};
use crate::listener::{clamp_backlog, Listener, ShellCommand};
use crate::supervisor::{Supervisor, TracingReporter};

// ============================================================================
// CLI Arguments
// ============================================================================

/// serve - run a shell command for every connection
#[derive(Parser, Debug)]
#[command(name = "serve", version, about)]
pub struct Args {
    /// Listen address: `inet [IP PORT]`, `inet6 [IP PORT]`, `unix [PATH]`,
    /// `vsock PORT CID` or `x25 ADDRESS`
    #[arg(short = 'a', long, value_name = "ADDR")]
    pub address: Option<ListenAddress>,

    /// Maximum number of pending connections (clamped to SOMAXCONN)
    #[arg(short = 'b', long, allow_negative_numbers = true)]
    pub backlog: Option<i64>,

    /// Socket type
    #[arg(short = 't', long = "type", value_name = "stream|seqpacket")]
    pub socket_type: Option<SocketKind>,

    /// Socket protocol (not implemented, ignored)
    #[arg(short = 'p', long)]
    pub protocol: Option<String>,

    /// Maximum number of concurrently running commands
    #[arg(short = 'm', long)]
    pub max_processes: Option<usize>,

    /// Configuration file (defaults to $XDG_CONFIG_HOME/serve/serve.toml)
    #[arg(short = 'c', long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and run in the background
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// PID file written in daemon mode
    #[arg(long, requires = "daemon", value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Log file used in daemon mode
    #[arg(long, requires = "daemon", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Debug logging with timestamps and levels
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Shell command run for every connection (via `sh -c`)
    pub command: Option<String>,
}

/// Fully resolved startup settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub address: ListenAddress,
    pub socket_kind: SocketKind,
    pub backlog: i32,
    pub max_processes: usize,
    pub command: ShellCommand,
}

impl Settings {
    /// Merges options over the configuration file over the defaults.
    ///
    /// Returns `None` when neither source names a command.
    pub fn resolve(args: &Args, config: ServeConfig) -> Option<Self> {
        let command = args.command.clone().or(config.command)?;
        Some(Self {
            address: args.address.clone().or(config.address).unwrap_or_default(),
            socket_kind: args.socket_type.or(config.socket_type).unwrap_or_default(),
            backlog: args
                .backlog
                .or(config.backlog)
                .map_or(libc::SOMAXCONN, clamp_backlog),
            max_processes: args
                .max_processes
                .or(config.max_processes)
                .unwrap_or(DEFAULT_MAX_PROCESSES),
            command: ShellCommand::new(command),
        })
    }
}

// ============================================================================
// Entry Point
// ============================================================================

/// Parses the command line and runs the server until SIGINT/SIGTERM.
pub fn run() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ServeConfig::load(path)?,
        None => ServeConfig::load_default()?,
    };
    let Some(settings) = Settings::resolve(&args, config) else {
        Args::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "a command to run for each connection is required",
            )
            .exit();
    };

    init_logging(args.verbose)?;

    if let Some(protocol) = &args.protocol {
        warn!(protocol = %protocol, "Protocol selection is unimplemented, using the default");
    }

    let listener = Listener::bind(&settings.address, settings.socket_kind, settings.backlog)?;
    let limit = AdmissionLimit::detect(settings.max_processes)?;

    if args.daemon {
        daemonize(args.pid_file.as_deref(), args.log_file.as_deref())?;
    }

    let shutdown = ShutdownFlag::install().context("Failed to install signal handlers")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        command = %settings.command.as_str(),
        max_processes = limit.get(),
        "serve starting"
    );

    let mut supervisor = Supervisor::new(listener, settings.command, limit, TracingReporter);
    driver::run(&mut supervisor, shutdown);
    supervisor.shutdown();

    info!("serve stopped");
    Ok(())
}

/// Sets up `tracing` on stdout.
///
/// Without `verbose` only the message is printed so operator lines keep
/// their exact text.
fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("served={level}").parse()?)
        .add_directive(format!("serve_core={level}").parse()?)
        .add_directive(format!("serve={level}").parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout);

    if verbose {
        builder.init();
    } else {
        builder
            .without_time()
            .with_level(false)
            .with_target(false)
            .init();
    }
    Ok(())
}

fn state_file(name: &str) -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("serve")
        .join(name)
}

/// Detaches from the terminal.
///
/// The listener is already bound, so address errors still reach the
/// terminal; it survives the fork.
fn daemonize(pid_file: Option<&Path>, log_file: Option<&Path>) -> Result<()> {
    use daemonize::Daemonize;

    let pid_path = pid_file.map_or_else(|| state_file("serve.pid"), Path::to_path_buf);
    let log_path = log_file.map_or_else(|| state_file("serve.log"), Path::to_path_buf);

    for path in [&pid_path, &log_path] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    info!(log = %log_path.display(), pid_file = %pid_path.display(), "Daemonizing");

    Daemonize::new()
        .pid_file(&pid_path)
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["serve", "cat"]);
        let settings = Settings::resolve(&args, ServeConfig::default()).unwrap();

        assert_eq!(settings.address.to_string(), "inet 0.0.0.0 4869");
        assert_eq!(settings.socket_kind, SocketKind::Stream);
        assert_eq!(settings.backlog, libc::SOMAXCONN);
        assert_eq!(settings.max_processes, DEFAULT_MAX_PROCESSES);
        assert_eq!(settings.command.as_str(), "cat");
    }

    #[test]
    fn test_options_override_config() {
        let config = ServeConfig {
            address: Some("unix /tmp/from-config.sock".parse().unwrap()),
            backlog: Some(3),
            socket_type: Some(SocketKind::SeqPacket),
            max_processes: Some(2),
            command: Some("false".to_string()),
        };
        let args = parse(&["serve", "-a", "inet 127.0.0.1 9000", "-m", "5", "true"]);
        let settings = Settings::resolve(&args, config).unwrap();

        assert_eq!(settings.address.to_string(), "inet 127.0.0.1 9000");
        assert_eq!(settings.max_processes, 5);
        assert_eq!(settings.command.as_str(), "true");
        assert_eq!(settings.backlog, 3);
        assert_eq!(settings.socket_kind, SocketKind::SeqPacket);
    }

    #[test]
    fn test_command_from_config() {
        let config = ServeConfig {
            command: Some("cat".to_string()),
            ..ServeConfig::default()
        };
        let args = parse(&["serve"]);
        assert_eq!(
            Settings::resolve(&args, config).unwrap().command.as_str(),
            "cat"
        );
        assert!(Settings::resolve(&args, ServeConfig::default()).is_none());
    }

    #[test]
    fn test_backlog_is_clamped() {
        let args = parse(&["serve", "-b", "-7", "cat"]);
        let settings = Settings::resolve(&args, ServeConfig::default()).unwrap();
        assert_eq!(settings.backlog, 0);
    }

    #[test]
    fn test_usage_errors() {
        let err = Args::try_parse_from(["serve", "-a", "ipx 1", "cat"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
        assert_eq!(err.exit_code(), 2);

        let err = Args::try_parse_from(["serve", "--pid-file", "/tmp/x.pid", "cat"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);

        assert!(Args::try_parse_from(["serve", "a", "b"]).is_err());
    }

    #[test]
    fn test_args_are_well_formed() {
        Args::command().debug_assert();
    }
}
