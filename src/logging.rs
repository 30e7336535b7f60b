//! Tracing setup: human-readable stderr plus an optional daily-rolling JSON
//! file for post-drive analysis.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const STDERR_FILTER: &str = "edge_agent=info";
const JSON_FILTER: &str = "edge_agent=debug";
const LOG_FILE_NAME: &str = "edge-agent.log";

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file lines are flushed.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(env_filter("RUST_LOG", STDERR_FILTER));

    let (json_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(writer)
                .with_filter(env_filter("RUST_LOG_JSON", JSON_FILTER));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

fn env_filter(var: &str, default: &str) -> EnvFilter {
    EnvFilter::try_from_env(var).unwrap_or_else(|_| EnvFilter::new(default))
}
