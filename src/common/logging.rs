//! Logging and tracing configuration
//!
//! The runner logs to stderr, optionally mirrored into a log file. Workers
//! log to stderr only so their stdout stays free for the test itself.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use super::paths;

fn default_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
}

/// Initialize tracing for the runner CLI (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli() {
    tracing_subscriber::registry()
        .with(default_filter("insanity=info,warn"))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing for the CLI with an additional log file
///
/// The file lives at `<data dir>/insanity/logs/runner.log` and receives
/// debug output including bus traffic. Keep the returned guard alive for
/// the lifetime of the program or buffered lines are lost.
pub fn init_cli_with_file() -> Option<(PathBuf, WorkerGuard)> {
    let Some(log_dir) = paths::log_dir() else {
        init_cli();
        return None;
    };
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Could not create log directory: {}", e);
        init_cli();
        return None;
    }

    let appender = tracing_appender::rolling::never(&log_dir, "runner.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .with_filter(default_filter("insanity=info,warn"));

    tracing_subscriber::registry()
        .with(file_layer.with_filter(default_filter("insanity=debug,info")))
        .with(stderr_layer)
        .init();

    Some((log_dir.join("runner.log"), guard))
}

/// Initialize tracing for a worker process (stderr only)
pub fn init_worker() {
    tracing_subscriber::registry()
        .with(default_filter("insanity=info,warn"))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}
