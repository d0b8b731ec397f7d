//! Tracing subscriber setup for the loader binary.
//!
//! Human-readable logs go to stderr, filtered by `RUST_LOG` or, failing that,
//! `ZYGOTE_LOG` (`trace`, `debug`, `info`, `warn`, `error`; default `info`).
//! `LOG_FORMAT=json` switches stderr output to JSON lines. Optionally, events
//! at or above a level are also forwarded to the supervisor as `log` replies.

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::bridge::channel::StatusWriter;
use crate::status_log_layer::StatusLogLayer;

fn stderr_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = match std::env::var("ZYGOTE_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!("zygote={level}"))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing(status: Option<(StatusWriter, Level)>) {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let stderr_layer = if use_json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(stderr_filter())
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(stderr_filter())
            .boxed()
    };

    let status_layer = status.map(|(writer, level)| {
        StatusLogLayer::new(writer).with_filter(LevelFilter::from_level(level))
    });

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(status_layer)
        .try_init();
}
