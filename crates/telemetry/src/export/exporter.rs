//! Exporter trait and the built-in sinks.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{ExportBatch, ExportItem};

/// Why a delivery attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("export timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("backend rejected batch: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A delivery sink for sealed spans and metric windows.
///
/// Each exporter is driven by its own worker task: a slow or failing
/// exporter delays only itself. `export` may be called again with the same
/// batch after a failure, so implementations should tolerate redelivery.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Name used in logs and stats.
    fn name(&self) -> &str;

    async fn export(&self, batch: &ExportBatch) -> Result<(), ExportError>;

    /// Release resources. Called once, after the last batch.
    async fn shutdown(&self) -> Result<(), ExportError> {
        Ok(())
    }
}

/// Keeps every delivered batch in memory.
#[derive(Default)]
pub struct InMemoryExporter {
    name: String,
    batches: Mutex<Vec<Arc<ExportBatch>>>,
}

impl InMemoryExporter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn batches(&self) -> Vec<Arc<ExportBatch>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every delivered item, in delivery order.
    pub fn items(&self) -> Vec<ExportItem> {
        self.batches()
            .iter()
            .flat_map(|b| b.items.iter().cloned())
            .collect()
    }

    pub fn span_count(&self) -> usize {
        self.items()
            .iter()
            .filter(|i| matches!(i, ExportItem::Span(_)))
            .count()
    }
}

#[async_trait]
impl Exporter for InMemoryExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, batch: &ExportBatch) -> Result<(), ExportError> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(batch.clone()));
        Ok(())
    }
}

/// Writes one JSON object per exported item to any `Write` sink.
pub struct JsonLinesExporter {
    name: String,
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesExporter {
    pub fn new(name: impl Into<String>, out: Box<dyn Write + Send>) -> Self {
        Self {
            name: name.into(),
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new("stdout", Box::new(std::io::stdout()))
    }
}

#[async_trait]
impl Exporter for JsonLinesExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, batch: &ExportBatch) -> Result<(), ExportError> {
        // Render first so a serialization failure writes nothing.
        let mut buf = Vec::new();
        for item in &batch.items {
            match item {
                ExportItem::Span(span) => serde_json::to_writer(&mut buf, span.as_ref())?,
                ExportItem::Metrics(window) => serde_json::to_writer(&mut buf, window.as_ref())?,
            }
            buf.push(b'\n');
        }

        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(&buf)?;
        out.flush()?;
        debug!(exporter = %self.name, items = batch.items.len(), "Wrote batch");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        self.out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SpanKind, SpanRecord, SpanStatus, StatusCode};
    use chrono::Utc;
    use llmscope_core::Attributes;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn span(name: &str) -> ExportItem {
        let now = Utc::now();
        ExportItem::Span(Arc::new(SpanRecord {
            trace_id: "t".into(),
            span_id: format!("s-{name}"),
            parent_span_id: None,
            name: name.into(),
            kind: SpanKind::Internal,
            start_time: now,
            end_time: now,
            status: SpanStatus::new(StatusCode::Ok),
            attributes: Attributes::new(),
            metrics_summary: None,
            dropped_attributes: 0,
            sampled: true,
        }))
    }

    #[tokio::test]
    async fn in_memory_collects_batches() {
        let exporter = InMemoryExporter::new("mem");
        let batch = ExportBatch {
            sequence: 1,
            items: vec![span("a"), span("b")],
        };
        exporter.export(&batch).await.unwrap();
        assert_eq!(exporter.name(), "mem");
        assert_eq!(exporter.batches().len(), 1);
        assert_eq!(exporter.span_count(), 2);
    }

    #[tokio::test]
    async fn json_lines_writes_one_record_per_line() {
        let buf = SharedBuf::default();
        let exporter = JsonLinesExporter::new("jsonl", Box::new(buf.clone()));
        let batch = ExportBatch {
            sequence: 7,
            items: vec![span("first"), span("second")],
        };
        exporter.export(&batch).await.unwrap();
        exporter.shutdown().await.unwrap();

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: SpanRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.name, "first");
        assert_eq!(first.span_id, "s-first");
    }
}
