//! Resolved console settings.

use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Settings shared by every subcommand, built from CLI arguments by
/// [`crate::cli::build_config`].
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Where history and profile files live.
    pub data_dir: PathBuf,
    /// Maximum history records loaded after a run or listed by default.
    pub history_limit: usize,
    /// How often the live progress line is redrawn.
    pub refresh_interval: Duration,
    /// Default log filter when `RUST_LOG` is not set.
    pub log_level: String,
}

impl ConsoleConfig {
    /// `RUST_LOG` wins over the configured level.
    pub fn log_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// Install the global `tracing` subscriber. Logs go to stderr so they never
/// mix with command output on stdout.
pub fn init_logging(cfg: &ConsoleConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(cfg.log_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(level: &str) -> ConsoleConfig {
        ConsoleConfig {
            data_dir: PathBuf::from("/tmp/idxmaint"),
            history_limit: 200,
            refresh_interval: Duration::from_millis(500),
            log_level: level.into(),
        }
    }

    #[test]
    fn configured_level_applies_without_rust_log() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(cfg("debug").log_filter().to_string(), "debug");
    }

    #[test]
    fn logging_can_be_initialized_twice() {
        init_logging(&cfg("warn"));
        init_logging(&cfg("info"));
        tracing::warn!("still alive");
    }
}
