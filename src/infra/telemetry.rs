use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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
            "verdant_tree_rebuild_total",
            Unit::Count,
            "Total number of full tree rebuilds from the content source."
        );
        describe_histogram!(
            "verdant_tree_rebuild_ms",
            Unit::Milliseconds,
            "Full tree rebuild latency in milliseconds."
        );
        describe_counter!(
            "verdant_tree_orphan_rows_total",
            Unit::Count,
            "Total number of source rows dropped because their parent was missing."
        );
        describe_counter!(
            "verdant_disk_read_total",
            Unit::Count,
            "Total number of snapshot files read successfully."
        );
        describe_counter!(
            "verdant_disk_write_total",
            Unit::Count,
            "Total number of snapshot files written successfully."
        );
        describe_counter!(
            "verdant_disk_failure_total",
            Unit::Count,
            "Total number of snapshot file failures, labelled by kind."
        );
        describe_counter!(
            "verdant_publish_total",
            Unit::Count,
            "Total number of single-node publishes, labelled by result."
        );
        describe_counter!(
            "verdant_unpublish_total",
            Unit::Count,
            "Total number of single-node unpublishes."
        );
        describe_counter!(
            "verdant_staleness_reload_total",
            Unit::Count,
            "Total number of times a newer snapshot file invalidated the in-memory tree."
        );
        describe_gauge!(
            "verdant_snapshot_nodes",
            Unit::Count,
            "Number of nodes in the current snapshot."
        );
    });
}
