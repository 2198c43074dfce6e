//! Asynchronous delivery of sealed spans and metric windows.
//!
//! Sealing a span pushes it into a [`queue::BoundedQueue`] without awaiting
//! anything. A dispatcher thread drains the queue in batches and hands each
//! batch to one worker per exporter; workers retry with backoff and give up
//! after a bounded number of attempts. Nothing on this path can fail the
//! operation that produced the data.

mod exporter;
pub mod queue;
mod pipeline;
mod retry;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::metrics::MetricWindow;
use crate::model::SpanRecord;

pub use exporter::{ExportError, Exporter, InMemoryExporter, JsonLinesExporter};
pub use pipeline::ExportPipeline;
pub use retry::RetryPolicy;

/// One unit of exported data.
#[derive(Debug, Clone)]
pub enum ExportItem {
    Span(Arc<SpanRecord>),
    Metrics(Arc<MetricWindow>),
}

impl ExportItem {
    pub fn as_span(&self) -> Option<&SpanRecord> {
        match self {
            Self::Span(span) => Some(span),
            Self::Metrics(_) => None,
        }
    }

    pub fn as_metrics(&self) -> Option<&MetricWindow> {
        match self {
            Self::Metrics(window) => Some(window),
            Self::Span(_) => None,
        }
    }
}

/// An ordered group of items delivered to every exporter.
#[derive(Debug, Clone)]
pub struct ExportBatch {
    /// Increases by one per dispatched batch.
    pub sequence: u64,
    pub items: Vec<ExportItem>,
}

impl ExportBatch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn spans(&self) -> impl Iterator<Item = &SpanRecord> {
        self.items.iter().filter_map(ExportItem::as_span)
    }
}

/// Outcome of [`ExportPipeline::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Items taken off the queue and dispatched after the drain began.
    pub flushed: u64,
    /// Item deliveries abandoned because the deadline passed: items still
    /// queued plus, per exporter, items whose delivery had not finished.
    pub discarded: u64,
    pub timed_out: bool,
}

/// Delivery counters for one exporter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterStats {
    pub name: String,
    pub delivered_batches: u64,
    pub delivered_items: u64,
    /// Batches abandoned after the last retry or because the worker's
    /// buffer was full.
    pub failed_batches: u64,
    pub dropped_items: u64,
    pub retries: u64,
}

/// Point-in-time view of the pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStats {
    pub enqueued: u64,
    /// Items discarded by the queue's backpressure policy.
    pub dropped: u64,
    pub queued: u64,
    pub discarded_at_shutdown: u64,
    pub exporters: Vec<ExporterStats>,
}

impl ExportStats {
    pub fn exporter(&self, name: &str) -> Option<&ExporterStats> {
        self.exporters.iter().find(|e| e.name == name)
    }
}
