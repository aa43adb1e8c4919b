use camino::Utf8Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_FILE_NAME: &str = "seqharvest.log";

/// Installs the global subscriber: human output on stderr plus a plain-text
/// copy appended to `{logs_dir}/seqharvest.log`. `RUST_LOG` overrides
/// `default_level`. Keep the returned guard alive until exit or buffered
/// file lines are lost.
pub fn init(default_level: &str, logs_dir: &Utf8Path) -> WorkerGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (file_writer, guard) = file_writer(logs_dir);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    guard
}

pub fn file_writer(logs_dir: &Utf8Path) -> (NonBlocking, WorkerGuard) {
    let appender = tracing_appender::rolling::never(logs_dir.as_std_path(), LOG_FILE_NAME);
    tracing_appender::non_blocking(appender)
}
