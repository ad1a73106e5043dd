//! Structured logging setup.
//!
//! `RUST_LOG` wins when set; otherwise the caller's default directive
//! (e.g. `info`, or `courier_core=debug` to see FETCHED / LOCKED lines).

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber once; later calls are no-ops.
pub fn init_logging(default_directive: &str, format: LogFormat) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let layer = match format {
            LogFormat::Text => fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(filter(default_directive))
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(filter(default_directive))
                .boxed(),
        };

        // a subscriber installed by an embedding process (or a test) stays in place
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already set, keeping it");
        }
    });
}
