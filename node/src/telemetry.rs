// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub const RECORDS_APPENDED: &str = "eventsource_records_appended_total";
pub const DUPLICATES: &str = "eventsource_duplicates_total";
pub const DELIVERIES: &str = "eventsource_deliveries_total";
pub const DELIVERY_NACKS: &str = "eventsource_delivery_nacks_total";
pub const APPEND_DURATION: &str = "eventsource_append_duration_seconds";

/// Initialize telemetry (logs + metrics). Safe to call more than once.
pub fn init_telemetry() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "eventsource_node=debug,eventsource_kernel=info".into()),
    );
    if tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }

    if PROM_HANDLE.get().is_none() {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                if PROM_HANDLE.set(handle).is_err() {
                    tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to install Prometheus recorder"),
        }
    }

    metrics::describe_counter!(RECORDS_APPENDED, "Records committed to the event log");
    metrics::describe_counter!(DUPLICATES, "Appends answered as duplicates of an earlier commit");
    metrics::describe_counter!(DELIVERIES, "Records acknowledged by a sink");
    metrics::describe_counter!(DELIVERY_NACKS, "Deliveries rejected by a sink and scheduled for retry");
    metrics::describe_histogram!(APPEND_DURATION, "Time taken to durably append a record");

    metrics::gauge!("eventsource_node_up", 1.0);
}

/// Render the Prometheus exposition text.
pub fn render_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}
