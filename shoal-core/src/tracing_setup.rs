//! Tracing setup for Shoal
//!
//! Console output follows the level the user picks; a per-run file in the
//! logs directory always captures everything down to TRACE, which is what
//! you want when a swarm misbehaves and the console was at `info`.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the per-run debug log, overwritten on each start.
pub const LAST_RUN_LOG: &str = "shoal-last-run.log";

/// Initialize tracing with dual output: console (user level) + file (full trace)
///
/// `RUST_LOG`, when set, overrides `console_level` for the console layer
/// only. Logs go to `logs_dir`, or `./logs` when none is given.
///
/// # Errors
///
/// - `std::io::Error` - Logs directory or log file could not be created
/// - `tracing_subscriber::util::TryInitError` - A global subscriber is already set
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (log_file_path, log_file) = open_log_file(logs_dir.unwrap_or_else(|| Path::new("logs")))?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Tracing initialized: console={}, debug_file={}",
        console_level,
        log_file_path.display()
    );

    Ok(())
}

/// Creates the logs directory and truncates this run's log file.
fn open_log_file(logs_dir: &Path) -> std::io::Result<(PathBuf, File)> {
    create_dir_all(logs_dir)?;
    let path = logs_dir.join(LAST_RUN_LOG);
    let file = File::create(&path)?;
    Ok((path, file))
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Informational, warning, and error messages
    Info,
    /// Debug, informational, warning, and error messages
    Debug,
    /// All messages including per-message peer traffic
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use shoal_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::str::FromStr for CliLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(CliLogLevel::Error),
            "warn" | "warning" => Ok(CliLogLevel::Warn),
            "info" => Ok(CliLogLevel::Info),
            "debug" => Ok(CliLogLevel::Debug),
            "trace" => Ok(CliLogLevel::Trace),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliLogLevel::Error => write!(f, "error"),
            CliLogLevel::Warn => write!(f, "warn"),
            CliLogLevel::Info => write!(f, "info"),
            CliLogLevel::Debug => write!(f, "debug"),
            CliLogLevel::Trace => write!(f, "trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing_round_trips_display() {
        for level in [
            CliLogLevel::Error,
            CliLogLevel::Warn,
            CliLogLevel::Info,
            CliLogLevel::Debug,
            CliLogLevel::Trace,
        ] {
            assert_eq!(level.to_string().parse::<CliLogLevel>(), Ok(level));
        }
        assert_eq!("WARNING".parse::<CliLogLevel>(), Ok(CliLogLevel::Warn));
        assert!("loud".parse::<CliLogLevel>().is_err());
        assert_eq!(CliLogLevel::Trace.as_tracing_level(), Level::TRACE);
    }

    #[test]
    fn test_log_file_is_created_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("nested").join("logs");

        let (path, _) = open_log_file(&logs).unwrap();
        assert_eq!(path, logs.join(LAST_RUN_LOG));
        std::fs::write(&path, b"previous run").unwrap();

        open_log_file(&logs).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
