//! Telemetry and Observability
//!
//! Structured logging setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,support_chat=debug,sqlx=warn,tower_http=debug";

/// Initialize tracing subscriber
///
/// `json` switches to one JSON object per line, for log shippers in production.
pub fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (pretty_layer, json_layer) = if json {
        (None, Some(fmt::layer().json().with_current_span(true)))
    } else {
        (
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(pretty_layer)
        .with(json_layer)
        .init();

    tracing::info!(json, "Tracing initialized");
}
