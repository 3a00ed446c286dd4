//! Logging configuration with journald support on Linux.
//!
//! Sets up tracing-based logging that integrates with systemd's journal on
//! Linux, with a rolling file fallback elsewhere. Interactive runs can log to
//! stderr instead.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where log records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// journald on Linux when available, otherwise a daily log file.
    Background,
    /// Human-readable output on stderr.
    Stderr,
}

/// Initialize the logging system.
///
/// Log level is controlled via the `FACETRAIL_LOG` environment variable
/// (`debug`, `info`, `warn`, `error`); the default is `info`.
///
/// Installs the global subscriber with `try_init`, so a second call returns
/// an error instead of panicking. The library never calls this; binaries do.
pub fn init(target: LogTarget, log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::try_from_env("FACETRAIL_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if target == LogTarget::Stderr {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .try_init()?;

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facetrail")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "facetrail.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the writer thread; keep it for the process lifetime.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_target_installs_once() {
        assert!(init(LogTarget::Stderr, None).is_ok());
        tracing::info!(target_kind = "stderr", "Logging test record");

        // The global subscriber is already set
        assert!(init(LogTarget::Stderr, None).is_err());
    }
}
