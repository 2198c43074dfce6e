//! The telemetry engine: owns every subsystem and wires them together.
//!
//! Built once from a validated [`TelemetryConfig`]. Sealed spans flow
//! synchronously through the metrics aggregator, the cost monitor and the
//! export queue, in that order. A background ticker flushes metric windows
//! into the export pipeline. [`TelemetryEngine::shutdown`] flushes and
//! drains everything within the configured deadline.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use llmscope_config::TelemetryConfig;
use llmscope_core::{
    AttributeValue, Provider, ProviderError, ProviderOutput, ProviderRequest, Validator,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::TelemetryError;
use crate::budget::CostMonitor;
use crate::export::{DrainReport, ExportPipeline, ExportStats, Exporter};
use crate::metrics::{MetricsAggregator, names};
use crate::model::{SpanKind, StatusCode, attr};
use crate::pricing::PricingTable;
use crate::tracer::{SpanHandle, Tracer};

/// Why [`TelemetryEngine::llm_call`] did not return a completion.
#[derive(Debug, thiserror::Error)]
pub enum LlmCallError {
    /// The deny policy refused the call before it reached the provider.
    #[error("LLM call refused: budget exceeded ({spent:.4} of {threshold:.4} {currency})")]
    BudgetExceeded {
        spent: f64,
        threshold: f64,
        currency: String,
    },

    /// The provider failed; the error is passed through unchanged.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Top-level owner of tracing, metrics, cost tracking and export.
pub struct TelemetryEngine {
    config: TelemetryConfig,
    tracer: Tracer,
    metrics: Arc<MetricsAggregator>,
    costs: Arc<CostMonitor>,
    pipeline: Arc<ExportPipeline>,
    validators: Vec<Arc<dyn Validator>>,
    drops_seen: Arc<AtomicU64>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryEngine {
    /// Build the engine and start its background tasks.
    ///
    /// Must be called inside a Tokio runtime. An invalid config fails here,
    /// before anything is started.
    pub fn from_config(
        config: TelemetryConfig,
        exporters: Vec<Arc<dyn Exporter>>,
        validators: Vec<Arc<dyn Validator>>,
    ) -> Result<Self, TelemetryError> {
        config.validate()?;

        let pipeline = Arc::new(ExportPipeline::start(&config.export, exporters)?);
        let metrics = Arc::new(MetricsAggregator::new(&config.metrics).with_sink(pipeline.clone()));
        let costs = Arc::new(CostMonitor::new(
            PricingTable::from_overrides(&config.pricing),
            config.budget.clone(),
        ));

        let tracer = Tracer::builder()
            .sampling_rate(config.sampling_rate)
            .max_attributes_per_span(config.limits.max_attributes_per_span)
            .processor(metrics.clone())
            .processor(costs.clone())
            .processor(pipeline.clone())
            .build();

        let drops_seen = Arc::new(AtomicU64::new(0));
        let ticker = tokio::spawn(flush_metrics_periodically(
            config.metrics.flush_interval(),
            Arc::clone(&metrics),
            Arc::clone(&pipeline),
            Arc::clone(&drops_seen),
        ));

        info!(
            sampling_rate = config.sampling_rate,
            validators = validators.len(),
            budget = ?config.budget.as_ref().map(|b| b.threshold),
            "Telemetry engine started"
        );

        Ok(Self {
            config,
            tracer,
            metrics,
            costs,
            pipeline,
            validators,
            drops_seen,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    /// Load the config at `path` (defaults if absent) and build the engine.
    pub fn load(
        path: &Path,
        exporters: Vec<Arc<dyn Exporter>>,
        validators: Vec<Arc<dyn Validator>>,
    ) -> Result<Self, TelemetryError> {
        let config = TelemetryConfig::load_from(path)?;
        Self::from_config(config, exporters, validators)
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    pub fn costs(&self) -> &CostMonitor {
        &self.costs
    }

    pub fn stats(&self) -> ExportStats {
        self.pipeline.stats()
    }

    /// Record a sample directly, outside any span.
    pub fn record_metric(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.metrics.record(name, value, tags);
    }

    /// Run one provider call inside an `llm_call` span.
    ///
    /// The provider's result is returned unchanged. Token counts, cost and
    /// validator outcomes are recorded on the span. With the deny budget
    /// policy the call is refused up front once spend is over the threshold.
    pub async fn llm_call(
        &self,
        provider: &dyn Provider,
        request: ProviderRequest,
    ) -> Result<ProviderOutput, LlmCallError> {
        if let Err(TelemetryError::BudgetExceeded {
            spent,
            threshold,
            currency,
        }) = self.costs.admit()
        {
            return Err(LlmCallError::BudgetExceeded {
                spent,
                threshold,
                currency,
            });
        }

        let span = self.tracer.start("llm_call", SpanKind::LlmCall);
        set(&span, attr::LLM_PROVIDER, provider.name());
        set(&span, attr::LLM_MODEL, request.model.as_str());
        let model = request.model.clone();

        let result = span.snapshot().attach(provider.complete(request)).await;

        match result {
            Ok(output) => {
                let input = u64::from(output.input_tokens);
                let output_tokens = u64::from(output.output_tokens);
                set(&span, attr::LLM_INPUT_TOKENS, input);
                set(&span, attr::LLM_OUTPUT_TOKENS, output_tokens);
                if let Some(cost) = self.costs.pricing().compute_cost(&model, input, output_tokens) {
                    set(&span, attr::LLM_COST, cost);
                }
                self.run_validators(&span, &output.text);
                span.end(StatusCode::Ok);
                Ok(output)
            }
            Err(e) => {
                debug!(provider = provider.name(), model = %model, error = %e, "Provider call failed");
                span.end_with_error(e.to_string());
                Err(LlmCallError::Provider(e))
            }
        }
    }

    fn run_validators(&self, span: &SpanHandle, text: &str) {
        for validator in &self.validators {
            let name = validator.name();
            let key = |field: &str| format!("{}.{name}.{field}", attr::VALIDATION_PREFIX);

            match catch_unwind(AssertUnwindSafe(|| validator.validate(text))) {
                Ok(Ok(verdict)) => {
                    set(span, key("passed"), verdict.passed);
                    set(span, key("score"), verdict.score);
                }
                Ok(Err(e)) => {
                    warn!(validator = name, error = %e, "Validator failed");
                    set(span, key("error"), e.to_string());
                }
                Err(_) => {
                    warn!(validator = name, "Validator panicked");
                    set(span, key("error"), "validator panicked");
                }
            }
        }
    }

    /// Flush metrics and drain the export pipeline within the configured
    /// deadline. Safe to call more than once.
    pub async fn shutdown(&self) -> DrainReport {
        if let Some(ticker) = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            ticker.abort();
        }
        record_export_drops(&self.metrics, &self.pipeline, &self.drops_seen);
        let windows = self.metrics.flush();
        debug!(windows = windows.len(), "Final metric flush");

        let report = self.pipeline.shutdown().await;
        info!(
            flushed = report.flushed,
            discarded = report.discarded,
            spent = self.costs.spent(),
            "Telemetry engine stopped"
        );
        report
    }
}

impl Drop for TelemetryEngine {
    fn drop(&mut self) {
        if let Some(ticker) = self
            .ticker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            ticker.abort();
        }
    }
}

fn set(span: &SpanHandle, key: impl Into<String>, value: impl Into<AttributeValue>) {
    if let Err(e) = span.set_attribute(key, value) {
        debug!(error = %e, "Attribute not recorded");
    }
}

/// Record the drops since the last call as `telemetry.export.dropped`.
fn record_export_drops(metrics: &MetricsAggregator, pipeline: &ExportPipeline, seen: &AtomicU64) {
    let dropped = pipeline.dropped();
    let previous = seen.swap(dropped, Ordering::AcqRel);
    if dropped > previous {
        metrics.record(names::EXPORT_DROPPED, (dropped - previous) as f64, &[]);
    }
}

async fn flush_metrics_periodically(
    every: std::time::Duration,
    metrics: Arc<MetricsAggregator>,
    pipeline: Arc<ExportPipeline>,
    drops_seen: Arc<AtomicU64>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        record_export_drops(&metrics, &pipeline, &drops_seen);
        let windows = metrics.flush();
        if !windows.is_empty() {
            debug!(windows = windows.len(), "Flushed metric windows");
        }
    }
}
