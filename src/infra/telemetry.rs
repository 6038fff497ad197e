use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_keys;
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
        describe_signal_metrics();
        describe_store_metrics();
        describe_refetch_metrics();
    });
}

fn describe_signal_metrics() {
    describe_counter!(
        metric_keys::SIGNAL_DECODED_TOTAL,
        Unit::Count,
        "Invalidation signals decoded from responses, labelled by kind."
    );
    describe_counter!(
        metric_keys::SIGNAL_REJECTED_TOTAL,
        Unit::Count,
        "Malformed invalidation signals dropped without touching the cache."
    );
    describe_histogram!(
        metric_keys::DISPATCH_MS,
        Unit::Milliseconds,
        "Time from decoded event to the last listener returning, labelled by kind."
    );
    describe_counter!(
        metric_keys::LISTENER_FAILURE_TOTAL,
        Unit::Count,
        "Listener invocations that panicked during fan-out."
    );
}

fn describe_store_metrics() {
    describe_counter!(
        metric_keys::PATCH_FALLBACK_TOTAL,
        Unit::Count,
        "Optimistic patches that could not be reconciled and invalidated their collection."
    );
    describe_counter!(
        metric_keys::PAGE_EVICT_TOTAL,
        Unit::Count,
        "Cached pages evicted to stay within the page entry limit."
    );
}

fn describe_refetch_metrics() {
    describe_counter!(
        metric_keys::REFETCH_FAILURE_TOTAL,
        Unit::Count,
        "Background refetches that gave up and left their page flagged outdated."
    );
    describe_counter!(
        metric_keys::REFETCH_DISCARDED_TOTAL,
        Unit::Count,
        "Fetched pages dropped because the cache already held newer data."
    );
}
