//! Command-line interface for svcmod.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::constants::DEFAULT_CONFIG_FILE;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
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

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for svcmod.
#[derive(Parser)]
#[command(name = "svcmod", version)]
#[command(about = "Supervises local services through their pid files", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Path to the configuration file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for svcmod.
#[derive(Subcommand)]
pub enum Commands {
    /// Supervise the configured modules in the foreground until interrupted.
    Run {
        /// Only supervise the named module.
        #[arg(short, long)]
        module: Option<String>,
    },

    /// Check the filesystem rights the modules depend on.
    Rights {
        /// Only check the named module.
        #[arg(short, long)]
        module: Option<String>,

        /// Correct wrong ownership and modes.
        #[arg(long)]
        fix: bool,

        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Run a module's start test against the pid in its pid file.
    Probe {
        /// Module whose start test should run.
        #[arg(short, long)]
        module: String,
    },

    /// Show which modules have a live process behind their pid file.
    Status {
        /// Only show the named module.
        #[arg(short, long)]
        module: Option<String>,

        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
