use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pagecache_hit_total",
            Unit::Count,
            "Requests served from the content store."
        );
        describe_counter!(
            "pagecache_miss_total",
            Unit::Count,
            "Cacheable requests that had to be rendered."
        );
        describe_counter!(
            "pagecache_bypass_total",
            Unit::Count,
            "Requests that skipped the content store, labelled by reason."
        );
        describe_counter!(
            "pagecache_write_total",
            Unit::Count,
            "Content entries written."
        );
        describe_counter!(
            "pagecache_write_skipped_total",
            Unit::Count,
            "Rendered responses not written, labelled by reason."
        );
        describe_counter!(
            "pagecache_store_error_total",
            Unit::Count,
            "Cache store calls that failed or timed out, labelled by operation."
        );
        describe_counter!(
            "pagecache_ledger_error_total",
            Unit::Count,
            "Content-version ledger commits that failed."
        );
        describe_histogram!(
            "pagecache_flush_ms",
            Unit::Milliseconds,
            "Flush phase latency in milliseconds."
        );
    });
}
