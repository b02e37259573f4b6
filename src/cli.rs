//! Command-line interface for the supervisor.
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for the supervisor.
#[derive(Parser)]
#[command(name = "agentsvc", version, author)]
#[command(about = "A cross-platform process supervisor for declarative sub-service manifests", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Opt into privileged system mode. Requires running as root.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// Drop privileges after performing privileged setup.
    #[arg(long = "drop-privileges", global = true)]
    pub drop_privileges: bool,

    /// Directory to search for sub-service manifests (overrides settings/defaults).
    #[arg(long, value_name = "DIR", global = true)]
    pub manifest_dir: Option<PathBuf>,

    /// Path to the supervisor settings document (overrides the default location).
    #[arg(long, value_name = "PATH", global = true)]
    pub settings: Option<PathBuf>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the supervisor in the foreground: discover manifests, run the
    /// level-ordered start sequence, then the watchdog loop until signaled.
    Run {
        /// Extra parameters forwarded to the `%agl.params%` placeholder.
        #[arg(trailing_var_arg = true)]
        params: Vec<String>,
    },

    /// Request an orderly shutdown of the running supervisor over the
    /// control channel.
    Stop,

    /// Print the current state table, read directly from the state file.
    /// Does not require a running supervisor.
    List {
        /// Emit machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Load the manifest set and settings, reporting how many sub-services
    /// were discovered (and how many are disabled).
    Settings,

    /// Write a new manifest file from the given name, executable and
    /// parameters.
    New {
        /// Unique sub-service name.
        name: String,
        /// Executable (or command) to run.
        exe: String,
        /// Extra parameters appended to the run command.
        #[arg(trailing_var_arg = true)]
        params: Vec<String>,
        /// Ordering level to assign (must be > 0 to be active).
        #[arg(long, default_value_t = 10)]
        level: i64,
    },

    /// Signal "retry-now" to every paused sub-service (or one named
    /// sub-service) over the control channel.
    Retry {
        /// Restrict the signal to a single sub-service.
        service: Option<String>,
    },

    /// Alias of `retry`.
    Resume {
        /// Restrict the signal to a single sub-service.
        service: Option<String>,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
