//! Command-line interface for aistack.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::constants::{DEFAULT_CONFIG_FILE, DEFAULT_LOG_LINES};

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

/// Command-line interface for aistack.
#[derive(Parser)]
#[command(name = "aistack", version, author)]
#[command(about = "Start, health-check and stop a local stack of AI services", long_about = None)]
pub struct Cli {
    /// Path to the stack file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Keep pid files and logs under system directories instead of the home directory.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// Emit machine-readable JSON instead of a table.
    #[arg(long, global = true)]
    pub json: bool,

    /// Disable ANSI colors in output.
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for aistack.
#[derive(Subcommand)]
pub enum Commands {
    /// Start services in declared order (default: all).
    Start {
        /// Services to start.
        #[arg(value_name = "SERVICE")]
        services: Vec<String>,
    },

    /// Stop services (default: all).
    Stop {
        /// Services to stop.
        #[arg(value_name = "SERVICE")]
        services: Vec<String>,
    },

    /// Show whether services are listening and whether their recorded processes are alive.
    Status {
        /// Services to inspect.
        #[arg(value_name = "SERVICE")]
        services: Vec<String>,
    },

    /// Show the tail of a service's log file.
    Logs {
        /// Service whose log should be displayed.
        service: String,

        /// Number of lines to show.
        #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
