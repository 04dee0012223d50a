use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();
static DESCRIBED: OnceCell<()> = OnceCell::new();

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder once per process; later calls share it.
    pub fn init() -> anyhow::Result<Self> {
        let handle = HANDLE
            .get_or_try_init(|| PrometheusBuilder::new().install_recorder())?
            .clone();
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

pub fn ensure_metrics_described() {
    DESCRIBED.get_or_init(|| {
        describe_counter!("confidence_scores_total", "Scoring calls, by strategy");
        describe_counter!("confidence_degraded_total", "Results flagged degraded (zero total weight)");
        describe_counter!(
            "confidence_missing_feature_total",
            "Dimension scores that fell back to neutral, by dimension"
        );
        describe_counter!("history_records_total", "Results appended to entity histories");
        describe_counter!("history_rejected_total", "Record calls rejected (ordering or identity)");
        describe_counter!("convergence_events_total", "Entities flipped to Converged");
        describe_counter!("weights_updates_total", "Published weight updates");
        describe_counter!("stream_events_total", "Stream events admitted");
        describe_counter!("stream_backpressure_total", "Stream events rejected by backpressure, by cause");
        describe_counter!("stream_windows_closed_total", "Windows closed with at least one event");
        describe_counter!("stream_windows_gc_total", "Stale entity window buffers dropped");
        describe_counter!("notifications_sent_total", "Webhook deliveries, by kind");
        describe_counter!("scheduler_ticks_total", "Background task ticks, by task");
        describe_gauge!("weights_version", "Currently published weights version");
        describe_gauge!("tracked_entities", "Entities with an in-memory history");
        describe_gauge!("stream_buffered_events", "Events buffered across all open windows");
    });
}
