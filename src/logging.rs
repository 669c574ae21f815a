//! Tracing setup for the tag engine and its CLI.
//!
//! Events carry the ids they concern as fields: `id` for a single tag,
//! `parent`/`child` for an edge, `tag_id` and `old_id`/`new_id` around
//! undo, and `version` plus the invalidated `keys` on every graph change.
//! Structural rejections (cycles, reserved ids) log at `warn`, mutations at
//! `info`, cache and debounce decisions at `debug`.
//!
//! The filter comes from `TAGWEAVE_LOG` in `EnvFilter` syntax, e.g.
//! `TAGWEAVE_LOG=tagweave::service=debug`. Without it only this crate's
//! `info` events and other crates' warnings are kept.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const ENV_VAR: &str = "TAGWEAVE_LOG";
const DEFAULT_FILTER: &str = "warn,tagweave=info";

/// Where file logs go when no directory is given.
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tagweave")
        .join("logs")
}

/// Install the global subscriber: journald on Linux when the socket is
/// reachable, otherwise a daily-rolling `tagweave.log` in `log_dir`.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_env(ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer.with_syslog_identifier("tagweave".to_string()))
                .try_init()?;

            tracing::info!(version = env!("CARGO_PKG_VERSION"), "Logging to journald");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "tagweave.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer stops flushing once the guard drops.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        dir = %log_dir.display(),
        "Logging to file"
    );
    Ok(())
}
