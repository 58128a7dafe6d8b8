/*!
Observability infrastructure for the Persist engine.

This module provides:
- Structured logging setup (`tracing` + `tracing-subscriber`)
- Prometheus metrics for the write and rehydrate paths (feature `metrics`)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{PersistError, Result};

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<PersistMetrics> = OnceLock::new();

/// Metrics collection for persistor operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct PersistMetrics {
    // Write path
    pub writes_total: Counter,
    pub write_errors_total: Counter,
    pub skipped_writes_total: Counter,
    pub transform_errors_total: Counter,
    pub write_latency_seconds: Histogram,

    // Read path
    pub rehydrated_keys_total: Counter,
    pub rehydrate_errors_total: Counter,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| PersistError::storage(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| PersistError::storage(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
impl PersistMetrics {
    /// Initialize new metrics instance
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let writes_total = counter(
            &registry,
            "persist_writes_total",
            "Records handed to the storage backend",
        )?;
        let write_errors_total = counter(
            &registry,
            "persist_write_errors_total",
            "Storage writes that failed or timed out",
        )?;
        let skipped_writes_total = counter(
            &registry,
            "persist_skipped_writes_total",
            "Dirty keys processed without a storage write",
        )?;
        let transform_errors_total = counter(
            &registry,
            "persist_transform_errors_total",
            "Write transforms that failed",
        )?;
        let rehydrated_keys_total = counter(
            &registry,
            "persist_rehydrated_keys_total",
            "Keys restored by serial rehydration",
        )?;
        let rehydrate_errors_total = counter(
            &registry,
            "persist_rehydrate_errors_total",
            "Keys dropped from serial rehydration",
        )?;

        let write_latency_seconds = Histogram::with_opts(prometheus::HistogramOpts::new(
            "persist_write_latency_seconds",
            "Duration of storage writes in seconds",
        ))
        .map_err(|e| {
            PersistError::storage(format!("Failed to create write_latency_seconds metric: {e}"))
        })?;
        registry
            .register(Box::new(write_latency_seconds.clone()))
            .map_err(|e| {
                PersistError::storage(format!("Failed to register write_latency_seconds: {e}"))
            })?;

        Ok(Self {
            writes_total,
            write_errors_total,
            skipped_writes_total,
            transform_errors_total,
            write_latency_seconds,
            rehydrated_keys_total,
            rehydrate_errors_total,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static PersistMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize Persist metrics"))
    }

    /// Record a completed storage write
    pub fn record_write(&self, duration: std::time::Duration) {
        self.writes_total.inc();
        self.write_latency_seconds.observe(duration.as_secs_f64());
    }

    /// Record a failed storage write
    pub fn record_write_error(&self, duration: std::time::Duration) {
        self.write_errors_total.inc();
        self.write_latency_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_skipped_write(&self) {
        self.skipped_writes_total.inc();
    }

    pub fn record_transform_error(&self) {
        self.transform_errors_total.inc();
    }

    pub fn record_rehydrated_key(&self) {
        self.rehydrated_keys_total.inc();
    }

    pub fn record_rehydrate_error(&self) {
        self.rehydrate_errors_total.inc();
    }

    /// Gather metrics in Prometheus format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PersistError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| PersistError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Initialize the global logging subscriber
///
/// Installs an `EnvFilter` (honouring `RUST_LOG`, with `persist_core=info` added)
/// and a fmt layer that writes JSON lines when `json` is true and plain text
/// otherwise.
///
/// # Returns
/// An error if a global subscriber is already installed
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    PersistMetrics::global();

    let filter = EnvFilter::from_default_env().add_directive(
        "persist_core=info"
            .parse()
            .map_err(|e| PersistError::configuration(format!("Invalid log directive: {e}")))?,
    );

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };

    result.map_err(|e| {
        PersistError::configuration(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("Persist observability initialized");
    Ok(())
}

/// Initialize observability with default settings (text output)
pub fn init_default_observability() -> Result<()> {
    init_observability(false)
}
