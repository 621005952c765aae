//! OpenTelemetry metrics for herald
//!
//! Counters and histograms for the delivery worker, plus gauges for queue depth
//! and the reliability guards, pushed over OTLP to an OpenTelemetry Collector.
//!
//! # Architecture
//!
//! ```text
//! herald → OTLP/HTTP → OpenTelemetry Collector → Prometheus (scrape) → Grafana
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use herald_metrics::{init_metrics, MetricsConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MetricsConfig {
//!     enabled: true,
//!     endpoint: "http://localhost:4318/v1/metrics".to_string(),
//! };
//!
//! init_metrics(&config)?;
//!
//! if let Some(metrics) = herald_metrics::try_metrics() {
//!     metrics.delivery.record_sent("delivery", 0.25);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod delivery;
mod error;
mod exporter;
mod queue;

pub use config::MetricsConfig;
pub use delivery::{DeferReason, DeliveryMetrics};
pub use error::MetricsError;
use once_cell::sync::OnceCell;
pub use queue::QueueMetrics;

/// Global metrics instance
static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub delivery: DeliveryMetrics,
    pub queue: QueueMetrics,
}

/// Initialize the metrics system
///
/// Must be called once at startup before any metrics are recorded. If metrics
/// are disabled in the config, this is a no-op and [`try_metrics`] keeps
/// returning `None`.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or if called twice.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    tracing::info!(
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry metrics with OTLP exporter"
    );

    let provider = exporter::init_otlp_exporter(config.endpoint.clone())?;
    opentelemetry::global::set_meter_provider(provider);

    let metrics = Metrics {
        delivery: DeliveryMetrics::new()?,
        queue: QueueMetrics::new()?,
    };

    METRICS_INSTANCE
        .set(metrics)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// Get the global metrics instance, if metrics were initialized
#[must_use]
pub fn try_metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

/// Check if metrics are enabled
#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
