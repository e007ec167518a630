//! Prometheus metrics for agent health observability.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `vigil_events_total` | Counter | Events drained from the source |
//! | `vigil_events_dropped_total` | Counter | Malformed or missed events |
//! | `vigil_policy_matches_total` | Counter | Policy matches |
//! | `vigil_ring_segments` | Gauge | Segments currently in the ring |
//! | `vigil_ring_missed_events` | Gauge | Events missed during rotation stalls |
//! | `vigil_egress_dropped_total` | Counter | Frames dropped on a full queue |

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

/// Errors from metrics registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode the exposition output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Agent health metrics, safe to share across threads.
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,

    /// Events drained from the source.
    pub events_total: IntCounter,

    /// Events dropped before evaluation.
    pub events_dropped_total: IntCounter,

    /// Policy matches.
    pub policy_matches_total: IntCounter,

    /// Segments currently in the ring.
    pub ring_segments: IntGauge,

    /// Events missed while rotation was stalled.
    pub ring_missed_events: IntGauge,

    /// Egress frames dropped on a full queue.
    pub egress_dropped_total: IntCounter,
}

impl AgentMetrics {
    /// Creates and registers the metric families.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::RegistrationFailed`] on a duplicate
    /// registration.
    pub fn new() -> Result<Arc<Self>, MetricsError> {
        let registry = Registry::new();

        let events_total =
            IntCounter::new("vigil_events_total", "Events drained from the source")?;
        registry.register(Box::new(events_total.clone()))?;

        let events_dropped_total = IntCounter::new(
            "vigil_events_dropped_total",
            "Malformed or missed events dropped before evaluation",
        )?;
        registry.register(Box::new(events_dropped_total.clone()))?;

        let policy_matches_total =
            IntCounter::new("vigil_policy_matches_total", "Policy matches")?;
        registry.register(Box::new(policy_matches_total.clone()))?;

        let ring_segments =
            IntGauge::new("vigil_ring_segments", "Segments currently in the ring")?;
        registry.register(Box::new(ring_segments.clone()))?;

        let ring_missed_events = IntGauge::new(
            "vigil_ring_missed_events",
            "Events missed during rotation stalls",
        )?;
        registry.register(Box::new(ring_missed_events.clone()))?;

        let egress_dropped_total = IntCounter::new(
            "vigil_egress_dropped_total",
            "Egress frames dropped on a full transport queue",
        )?;
        registry.register(Box::new(egress_dropped_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            events_total,
            events_dropped_total,
            policy_matches_total,
            ring_segments,
            ring_missed_events,
            egress_dropped_total,
        }))
    }

    /// Renders the registry in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::EncodingFailed`] if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut out = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut out)
            .map_err(|err| MetricsError::EncodingFailed(err.to_string()))?;
        String::from_utf8(out).map_err(|err| MetricsError::EncodingFailed(err.to_string()))
    }
}

/// Serves `GET /metrics` on `addr`.
pub async fn serve(metrics: Arc<AgentMetrics>, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let metrics = Arc::clone(&metrics);
            async move {
                metrics.encode_text().map_err(|err| {
                    (
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                        err.to_string(),
                    )
                })
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
