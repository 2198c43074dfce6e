//! Span tracing, metric aggregation, cost tracking, and export for LLM pipelines.
//!
//! Every unit of pipeline work is recorded as a span nested under the span
//! that was ambient when it started. Sealed spans feed the metrics
//! aggregator and the cost ledger synchronously, and are queued for
//! asynchronous delivery to pluggable exporters. None of this is allowed
//! to change the outcome of the work being observed: failures inside the
//! instrumentation are logged and counted, never returned to the caller of
//! the observed operation.
//!
//! The entry point is [`TelemetryEngine`], built from a validated
//! [`llmscope_config::TelemetryConfig`].

pub mod budget;
pub mod context;
pub mod engine;
pub mod export;
pub mod metrics;
pub mod model;
pub mod pricing;
pub mod sketch;
pub mod tracer;

pub use budget::{BudgetExceeded, CostMonitor, CostSummary, LedgerEntry, ModelCost};
pub use context::{Context, ContextGuard, ContextSnapshot, WithContext};
pub use engine::{LlmCallError, TelemetryEngine};
pub use export::{
    DrainReport, ExportBatch, ExportError, ExportItem, ExportPipeline, ExportStats, Exporter,
    ExporterStats, InMemoryExporter, JsonLinesExporter, RetryPolicy,
};
pub use metrics::{MetricSink, MetricWindow, MetricsAggregator, Percentile};
pub use model::{SpanContext, SpanKind, SpanMetrics, SpanRecord, SpanStatus, StatusCode};
pub use pricing::{ModelPricing, PricingTable};
pub use tracer::{SpanHandle, SpanProcessor, SpanRef, Tracer, TracerBuilder};

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("cannot set attribute '{key}' on closed span {span_id}")]
    AttributeOnClosedSpan { span_id: String, key: String },

    #[error("configuration error: {0}")]
    Configuration(#[from] llmscope_config::ConfigError),

    #[error("exporter '{exporter}' failed to deliver batch: {source}")]
    ExporterDelivery {
        exporter: String,
        #[source]
        source: ExportError,
    },

    #[error("export queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("export queue is closed")]
    QueueClosed,

    #[error("no Tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("failed to start export dispatcher thread: {0}")]
    DispatcherThread(#[source] std::io::Error),

    #[error("budget exceeded: spent {spent:.6} {currency} of {threshold:.6}")]
    BudgetExceeded {
        spent: f64,
        threshold: f64,
        currency: String,
    },

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
