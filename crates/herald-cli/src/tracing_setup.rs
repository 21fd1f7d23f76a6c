use std::fs::OpenOptions;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Stderr logging filtered by `HERALD_LOG` (default `info`), plus a debug
/// file log when `HERALD_LOG_FILE` is set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("HERALD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    let registry = tracing_subscriber::registry().with(stderr);

    let Ok(log_path) = std::env::var("HERALD_LOG_FILE") else {
        registry.init();
        return;
    };
    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG);
            registry.with(file_layer).init();
        }
        Err(e) => {
            registry.init();
            tracing::warn!(path = %log_path, error = %e, "could not open log file");
        }
    }
}
