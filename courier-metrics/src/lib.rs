//! OpenTelemetry metrics for the courier delivery engine.
//!
//! Instruments are pushed over OTLP/HTTP to an OpenTelemetry Collector. When
//! metrics are disabled nothing is registered and [`metrics`] returns `None`,
//! so call sites stay cheap.
//!
//! ```rust,no_run
//! use courier_metrics::{init_metrics, MetricsConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! init_metrics(&MetricsConfig::default())?;
//!
//! if let Some(metrics) = courier_metrics::metrics() {
//!     metrics.worker.record_job_execution("work-0", "process_queued_messages");
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod delivery;
mod error;
mod exporter;
mod worker;

use once_cell::sync::OnceCell;
use opentelemetry::metrics::Meter;

pub use config::MetricsConfig;
pub use delivery::DeliveryMetrics;
pub use error::MetricsError;
pub use worker::WorkerMetrics;

static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub worker: WorkerMetrics,
    pub delivery: DeliveryMetrics,
}

pub(crate) fn meter() -> Meter {
    opentelemetry::global::meter("courier")
}

/// Initialize the metrics system.
///
/// Must be called once at startup, from within a tokio runtime, before any
/// metrics are recorded. A no-op when metrics are disabled.
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
        worker: WorkerMetrics::new(),
        delivery: DeliveryMetrics::new(),
    };

    METRICS_INSTANCE
        .set(metrics)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// The global metrics instance, if metrics were initialised.
#[must_use]
pub fn metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
