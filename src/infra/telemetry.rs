use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names::{
    METRIC_BYPASS, METRIC_COLLISION, METRIC_DEGRADED, METRIC_DELEGATE_MS, METRIC_FLUSH,
    METRIC_HIT, METRIC_LOCK_POISONED, METRIC_MISS, METRIC_STORE_EVICT,
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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
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

/// Register descriptions for every query cache metric. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(METRIC_HIT, Unit::Count, "Reads served from the cache.");
        describe_counter!(
            METRIC_MISS,
            Unit::Count,
            "Reads that found no usable entry and populated one."
        );
        describe_counter!(
            METRIC_BYPASS,
            Unit::Count,
            "Reads sent straight to the executor, labelled by reason."
        );
        describe_counter!(
            METRIC_COLLISION,
            Unit::Count,
            "Hashed-key collisions detected on read."
        );
        describe_counter!(
            METRIC_FLUSH,
            Unit::Count,
            "Entries removed by tag flushes."
        );
        describe_counter!(
            METRIC_DEGRADED,
            Unit::Count,
            "Reads that fell back to the executor after a cache failure, labelled by cause."
        );
        describe_counter!(
            METRIC_STORE_EVICT,
            Unit::Count,
            "Entries evicted from the memory store due to capacity."
        );
        describe_counter!(
            METRIC_LOCK_POISONED,
            Unit::Count,
            "Poisoned locks recovered, labelled by source."
        );
        describe_histogram!(
            METRIC_DELEGATE_MS,
            Unit::Milliseconds,
            "Executor latency in milliseconds, labelled by operation."
        );
    });
}
