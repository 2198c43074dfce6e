//! Windowed metric aggregation.
//!
//! Samples are grouped by (name, tag set). Each group owns its own lock
//! behind a read-mostly index, so recording into unrelated groups never
//! contends. A window is summarised and reset either when the engine's
//! ticker calls [`MetricsAggregator::flush`] or inline, by the recording
//! call, once it holds `max_samples_per_window` samples.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use llmscope_config::MetricsConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::TelemetryError;
use crate::model::{SpanKind, SpanRecord, attr};
use crate::sketch::QuantileSketch;
use crate::tracer::SpanProcessor;

/// Metric names recorded from sealed spans.
pub mod names {
    pub const SPAN_DURATION_MS: &str = "span.duration_ms";
    pub const LLM_TOKENS_INPUT: &str = "llm.tokens.input";
    pub const LLM_TOKENS_OUTPUT: &str = "llm.tokens.output";
    pub const LLM_COST: &str = "llm.cost";
    pub const EXPORT_DROPPED: &str = "telemetry.export.dropped";
}

/// One estimated quantile of a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    pub quantile: f64,
    pub value: f64,
}

/// Summary of one metric over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricWindow {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub percentiles: Vec<Percentile>,
    /// Relative error bound of every entry in `percentiles`.
    pub relative_error: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl MetricWindow {
    /// Estimated value at `quantile`, if it was one of the configured quantiles.
    pub fn percentile(&self, quantile: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|p| (p.quantile - quantile).abs() < 1e-9)
            .map(|p| p.value)
    }
}

/// Receives every window the aggregator flushes.
pub trait MetricSink: Send + Sync {
    fn accept(&self, window: Arc<MetricWindow>);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricKey {
    name: String,
    tags: BTreeMap<String, String>,
}

impl MetricKey {
    fn new(name: &str, tags: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

struct Window {
    sketch: QuantileSketch,
    sum: f64,
    started: Option<DateTime<Utc>>,
    /// Removed from the index; recorders must look the key up again.
    retired: bool,
}

impl Window {
    fn new(relative_error: f64) -> Self {
        Self {
            sketch: QuantileSketch::new(relative_error),
            sum: 0.0,
            started: None,
            retired: false,
        }
    }

    fn insert(&mut self, value: f64) {
        self.started.get_or_insert_with(Utc::now);
        self.sketch.insert(value);
        self.sum += value;
    }

    fn summarize(&self, key: &MetricKey, quantiles: &[f64]) -> Option<MetricWindow> {
        let count = self.sketch.count();
        if count == 0 {
            return None;
        }
        let percentiles = quantiles
            .iter()
            .filter_map(|q| {
                self.sketch.quantile(*q).map(|value| Percentile {
                    quantile: *q,
                    value,
                })
            })
            .collect();
        let now = Utc::now();
        Some(MetricWindow {
            name: key.name.clone(),
            tags: key.tags.clone(),
            count,
            sum: self.sum,
            min: self.sketch.min().unwrap_or(0.0),
            max: self.sketch.max().unwrap_or(0.0),
            mean: self.sum / count as f64,
            percentiles,
            relative_error: self.sketch.relative_error(),
            window_start: self.started.unwrap_or(now),
            window_end: now,
        })
    }

    /// Summarize and reset.
    fn take(&mut self, key: &MetricKey, quantiles: &[f64]) -> Option<MetricWindow> {
        let window = self.summarize(key, quantiles)?;
        *self = Window::new(self.sketch.relative_error());
        Some(window)
    }
}

/// Groups samples into per-key windows and emits their summaries.
pub struct MetricsAggregator {
    windows: RwLock<HashMap<MetricKey, Arc<Mutex<Window>>>>,
    relative_error: f64,
    quantiles: Vec<f64>,
    max_samples_per_window: u64,
    sink: Option<Arc<dyn MetricSink>>,
}

impl MetricsAggregator {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            relative_error: config.relative_error,
            quantiles: config.quantiles.clone(),
            max_samples_per_window: config.max_samples_per_window.max(1),
            sink: None,
        }
    }

    /// Forward every flushed window to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Record one sample. Non-finite values are ignored.
    pub fn record(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        if !value.is_finite() {
            debug!(metric = name, value, "Ignoring non-finite sample");
            return;
        }
        let key = MetricKey::new(name, tags);

        let full = loop {
            let window = self.window_for(&key);
            let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);
            if window.retired {
                continue;
            }
            window.insert(value);
            break if window.sketch.count() >= self.max_samples_per_window {
                window.take(&key, &self.quantiles)
            } else {
                None
            };
        };
        if let Some(summary) = full {
            debug!(metric = name, count = summary.count, "Window full, flushing inline");
            self.emit(summary);
        }
    }

    fn window_for(&self, key: &MetricKey) -> Arc<Mutex<Window>> {
        {
            let index = self.windows.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(window) = index.get(key) {
                return Arc::clone(window);
            }
        }
        let mut index = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            index
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Window::new(self.relative_error)))),
        )
    }

    /// Summarize and reset every non-empty window.
    ///
    /// Windows are also handed to the sink, if one is attached. Keys that
    /// saw no samples since the previous flush are forgotten.
    pub fn flush(&self) -> Vec<Arc<MetricWindow>> {
        let entries: Vec<(MetricKey, Arc<Mutex<Window>>)> = {
            let index = self.windows.read().unwrap_or_else(PoisonError::into_inner);
            index
                .iter()
                .map(|(k, w)| (k.clone(), Arc::clone(w)))
                .collect()
        };

        let mut flushed = Vec::new();
        let mut idle = Vec::new();
        for (key, window) in entries {
            let summary = window
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(&key, &self.quantiles);
            match summary {
                Some(summary) => flushed.push(self.emit(summary)),
                None => idle.push(key),
            }
        }
        if !idle.is_empty() {
            self.evict(&idle);
        }
        flushed
    }

    fn evict(&self, keys: &[MetricKey]) {
        let mut index = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            let retired = index.get(key).is_some_and(|window| {
                let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);
                // A sample may have landed since the flush looked at it.
                window.retired = window.sketch.is_empty();
                window.retired
            });
            if retired {
                index.remove(key);
            }
        }
        debug!(evicted = keys.len(), remaining = index.len(), "Evicted idle metric windows");
    }

    /// Number of (name, tags) keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Summary of the current window for a key, without resetting it.
    pub fn peek(&self, name: &str, tags: &[(&str, &str)]) -> Option<MetricWindow> {
        let key = MetricKey::new(name, tags);
        let window = {
            let index = self.windows.read().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(index.get(&key)?)
        };
        let window = window.lock().unwrap_or_else(PoisonError::into_inner);
        window.summarize(&key, &self.quantiles)
    }

    fn emit(&self, summary: MetricWindow) -> Arc<MetricWindow> {
        let summary = Arc::new(summary);
        if let Some(sink) = &self.sink {
            sink.accept(Arc::clone(&summary));
        }
        summary
    }
}

impl SpanProcessor for MetricsAggregator {
    fn name(&self) -> &str {
        "metrics"
    }

    fn on_end(&self, span: &Arc<SpanRecord>) -> Result<(), TelemetryError> {
        let kind = span.kind.to_string();
        let status = span.status.code.to_string();
        self.record(
            names::SPAN_DURATION_MS,
            span.duration_ms(),
            &[
                ("span.name", span.name.as_str()),
                ("span.kind", kind.as_str()),
                ("status", status.as_str()),
            ],
        );

        if span.kind != SpanKind::LlmCall {
            return Ok(());
        }
        let Some(model) = span.attributes.get(attr::LLM_MODEL).and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let tags = [("model", model)];
        if let Some(n) = span.attributes.get(attr::LLM_INPUT_TOKENS).and_then(|v| v.as_f64()) {
            self.record(names::LLM_TOKENS_INPUT, n, &tags);
        }
        if let Some(n) = span.attributes.get(attr::LLM_OUTPUT_TOKENS).and_then(|v| v.as_f64()) {
            self.record(names::LLM_TOKENS_OUTPUT, n, &tags);
        }
        if let Some(cost) = span.attributes.get(attr::LLM_COST).and_then(|v| v.as_f64()) {
            self.record(names::LLM_COST, cost, &tags);
        }
        Ok(())
    }
}
