//! Tracing setup shared by tendril binaries.
//!
//! Console output is filtered by `RUST_LOG` (default `info`). With
//! `TENDRIL_LOG_ROLL=1` the same events are also written to a rolling file
//! under `TENDRIL_LOG_DIR` (default `logs`).

use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq)]
struct RollingFile {
    dir: String,
    prefix: String,
    rotation: String,
}

fn rolling_file_from_env() -> Option<RollingFile> {
    if std::env::var("TENDRIL_LOG_ROLL").ok().as_deref() != Some("1") {
        return None;
    }
    Some(RollingFile {
        dir: std::env::var("TENDRIL_LOG_DIR").unwrap_or_else(|_| "logs".to_string()),
        prefix: std::env::var("TENDRIL_LOG_PREFIX").unwrap_or_else(|_| "tendril".into()),
        rotation: std::env::var("TENDRIL_LOG_ROTATION")
            .unwrap_or_else(|_| "daily".into())
            .to_lowercase(),
    })
}

/// Installs the global subscriber. Calling it more than once is harmless.
pub fn init() {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(filter()));
    let Some(file) = rolling_file_from_env() else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&file.dir).is_err() {
        tracing::warn!(directory = %file.dir, "failed to create log directory");
    }
    let writer = match file.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&file.dir, &file.prefix),
        "minutely" => tracing_appender::rolling::minutely(&file.dir, &file.prefix),
        _ => tracing_appender::rolling::daily(&file.dir, &file.prefix),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(filter());
    let _ = registry.with(file_layer).try_init();
}
