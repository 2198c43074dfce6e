//! Delivery side of the export path.
//!
//! A dispatcher thread moves items from the [`BoundedQueue`] into one bounded
//! channel per exporter, and one Tokio task per exporter drains its channel
//! with a timeout and retries around every attempt. The dispatcher is a plain
//! OS thread: producers parked by the `block` policy on runtime threads can
//! never starve it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use futures::future::join_all;
use llmscope_config::ExportConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::BoundedQueue;
use super::{
    DrainReport, ExportBatch, ExportItem, ExportStats, Exporter, ExporterStats, RetryPolicy,
};
use crate::TelemetryError;
use crate::metrics::{MetricSink, MetricWindow};
use crate::model::SpanRecord;
use crate::tracer::SpanProcessor;

#[derive(Default)]
struct ExporterCounters {
    dispatched_items: AtomicU64,
    delivered_batches: AtomicU64,
    delivered_items: AtomicU64,
    failed_batches: AtomicU64,
    dropped_items: AtomicU64,
    retries: AtomicU64,
}

impl ExporterCounters {
    fn pending(&self) -> u64 {
        let done = self.delivered_items.load(Ordering::Acquire)
            + self.dropped_items.load(Ordering::Acquire);
        self.dispatched_items
            .load(Ordering::Acquire)
            .saturating_sub(done)
    }

    fn lose(&self, batches: u64, items: u64) {
        self.failed_batches.fetch_add(batches, Ordering::AcqRel);
        self.dropped_items.fetch_add(items, Ordering::AcqRel);
    }
}

struct WorkerSlot {
    name: String,
    counters: Arc<ExporterCounters>,
}

/// The dispatcher's end of one exporter worker.
struct WorkerSender {
    name: String,
    tx: mpsc::Sender<Arc<ExportBatch>>,
    counters: Arc<ExporterCounters>,
}

impl WorkerSender {
    /// Hand a batch over without waiting. A full channel loses the batch for
    /// this exporter only.
    fn offer(&self, batch: &Arc<ExportBatch>) {
        let count = batch.len() as u64;
        self.counters.dispatched_items.fetch_add(count, Ordering::AcqRel);
        if let Err(e) = self.tx.try_send(Arc::clone(batch)) {
            self.counters.lose(1, count);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "worker buffer full",
                mpsc::error::TrySendError::Closed(_) => "worker stopped",
            };
            warn!(exporter = %self.name, sequence = batch.sequence, items = count, reason, "Batch dropped for exporter");
        }
    }

    /// Hand over the final batches, waiting for room in the channel.
    async fn send_all(&self, batches: &[Arc<ExportBatch>]) {
        let total: u64 = batches.iter().map(|b| b.len() as u64).sum();
        self.counters.dispatched_items.fetch_add(total, Ordering::AcqRel);
        for (i, batch) in batches.iter().enumerate() {
            if self.tx.send(Arc::clone(batch)).await.is_err() {
                let rest = &batches[i..];
                let items = rest.iter().map(|b| b.len() as u64).sum();
                self.counters.lose(rest.len() as u64, items);
                warn!(exporter = %self.name, batches = rest.len(), "Worker stopped, final batches dropped");
                return;
            }
        }
    }
}

/// Moves queued items into the exporter channels.
struct Dispatcher {
    queue: Arc<BoundedQueue<ExportItem>>,
    /// Taken by [`ExportPipeline::drain`], which delivers the remainder itself.
    senders: Mutex<Option<Vec<WorkerSender>>>,
    batch_size: usize,
    flush_interval: Duration,
    sequence: AtomicU64,
    dispatched: AtomicU64,
}

impl Dispatcher {
    fn run(&self) {
        loop {
            self.queue.wait_for_items(self.batch_size, self.flush_interval);
            let closed = self.queue.is_closed();
            {
                let guard = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(senders) = guard.as_ref() else {
                    break;
                };
                loop {
                    let items = self.queue.pop_batch(self.batch_size);
                    if items.is_empty() {
                        break;
                    }
                    let batch = self.seal(items);
                    for sender in senders {
                        sender.offer(&batch);
                    }
                }
            }
            if closed {
                break;
            }
        }
        debug!(batches = self.sequence.load(Ordering::Acquire), "Dispatcher finished");
    }

    fn seal(&self, items: Vec<ExportItem>) -> Arc<ExportBatch> {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.dispatched
            .fetch_add(items.len() as u64, Ordering::AcqRel);
        Arc::new(ExportBatch { sequence, items })
    }

    /// Split `items` into sealed batches of at most `batch_size`.
    fn seal_all(&self, mut items: Vec<ExportItem>) -> Vec<Arc<ExportBatch>> {
        let mut batches = Vec::new();
        while !items.is_empty() {
            let rest = items.split_off(items.len().min(self.batch_size));
            batches.push(self.seal(items));
            items = rest;
        }
        batches
    }

    /// Stop the dispatcher thread from delivering; hands back the senders.
    fn detach(&self) -> Vec<WorkerSender> {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default()
    }
}

/// Bounded queue plus the dispatcher thread and worker tasks that deliver
/// its contents.
///
/// Must be started inside a Tokio runtime, which hosts the workers.
pub struct ExportPipeline {
    queue: Arc<BoundedQueue<ExportItem>>,
    dispatcher: Arc<Dispatcher>,
    slots: Vec<WorkerSlot>,
    discarded: AtomicU64,
    drain_timeout: Duration,
    draining: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExportPipeline {
    /// Spawn the dispatcher thread and one worker task per exporter.
    pub fn start(
        config: &ExportConfig,
        exporters: Vec<Arc<dyn Exporter>>,
    ) -> Result<Self, TelemetryError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TelemetryError::NoRuntime(e.to_string()))?;

        let queue = Arc::new(BoundedQueue::new(config.queue_capacity, config.backpressure));
        let policy = RetryPolicy::from_config(config);
        let exporter_timeout = config.exporter_timeout();

        let mut slots = Vec::with_capacity(exporters.len());
        let mut senders = Vec::with_capacity(exporters.len());
        let mut workers = Vec::with_capacity(exporters.len());
        for exporter in exporters {
            let (tx, rx) = mpsc::channel(config.exporter_buffer.max(1));
            let counters = Arc::new(ExporterCounters::default());
            let worker = Worker {
                exporter: Arc::clone(&exporter),
                counters: Arc::clone(&counters),
                policy: policy.clone(),
                timeout: exporter_timeout,
            };
            workers.push(runtime.spawn(worker.run(rx)));
            senders.push(WorkerSender {
                name: exporter.name().to_string(),
                tx,
                counters: Arc::clone(&counters),
            });
            slots.push(WorkerSlot {
                name: exporter.name().to_string(),
                counters,
            });
        }

        let dispatcher = Arc::new(Dispatcher {
            queue: Arc::clone(&queue),
            senders: Mutex::new(Some(senders)),
            batch_size: config.batch_size.clamp(1, queue.capacity()),
            flush_interval: config.flush_interval(),
            sequence: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
        });
        {
            let dispatcher = Arc::clone(&dispatcher);
            thread::Builder::new()
                .name("llmscope-export".to_string())
                .spawn(move || dispatcher.run())
                .map_err(TelemetryError::DispatcherThread)?;
        }

        info!(
            exporters = slots.len(),
            capacity = config.queue_capacity,
            policy = %config.backpressure,
            "Export pipeline started"
        );

        Ok(Self {
            queue,
            dispatcher,
            slots,
            discarded: AtomicU64::new(0),
            drain_timeout: config.drain_timeout(),
            draining: AtomicBool::new(false),
            workers: Mutex::new(workers),
        })
    }

    /// Queue an item for export. Never awaits.
    pub fn enqueue(&self, item: ExportItem) -> Result<(), TelemetryError> {
        self.queue.push(item)
    }

    /// Items dropped by the queue's backpressure policy so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn stats(&self) -> ExportStats {
        ExportStats {
            enqueued: self.queue.enqueued(),
            dropped: self.queue.dropped(),
            queued: self.queue.len() as u64,
            discarded_at_shutdown: self.discarded.load(Ordering::Acquire),
            exporters: self
                .slots
                .iter()
                .map(|slot| ExporterStats {
                    name: slot.name.clone(),
                    delivered_batches: slot.counters.delivered_batches.load(Ordering::Acquire),
                    delivered_items: slot.counters.delivered_items.load(Ordering::Acquire),
                    failed_batches: slot.counters.failed_batches.load(Ordering::Acquire),
                    dropped_items: slot.counters.dropped_items.load(Ordering::Acquire),
                    retries: slot.counters.retries.load(Ordering::Acquire),
                })
                .collect(),
        }
    }

    /// Drain using the configured deadline.
    pub async fn shutdown(&self) -> DrainReport {
        self.drain(self.drain_timeout).await
    }

    /// Close the queue, deliver what is pending, and stop the workers.
    ///
    /// Waits at most `deadline`. Whatever has not been delivered by then is
    /// counted as discarded and the workers are aborted. Calling this again
    /// returns an empty report.
    pub async fn drain(&self, deadline: Duration) -> DrainReport {
        if self.draining.swap(true, Ordering::AcqRel) {
            return DrainReport::default();
        }

        let mut workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let dispatched_before = self.dispatcher.dispatched.load(Ordering::Acquire);

        self.queue.close();
        let senders = self.dispatcher.detach();
        let batches = self.dispatcher.seal_all(self.queue.drain_all());

        let finished = tokio::time::timeout(deadline, async {
            let senders = senders;
            join_all(senders.iter().map(|sender| sender.send_all(&batches))).await;
            // Closing the channels lets each worker finish once it is empty.
            drop(senders);
            join_all(workers.iter_mut()).await;
        })
        .await
        .is_ok();

        if !finished {
            for worker in &workers {
                worker.abort();
            }
        }

        let flushed = self.dispatcher.dispatched.load(Ordering::Acquire) - dispatched_before;
        let mut discarded = self.queue.drain_all().len() as u64;
        if !finished {
            discarded += self.slots.iter().map(|s| s.counters.pending()).sum::<u64>();
        }
        self.discarded.store(discarded, Ordering::Release);

        if finished {
            info!(flushed, "Export pipeline drained");
        } else {
            warn!(flushed, discarded, deadline_ms = deadline.as_millis() as u64, "Export drain deadline passed");
        }

        DrainReport {
            flushed,
            discarded,
            timed_out: !finished,
        }
    }
}

impl SpanProcessor for ExportPipeline {
    fn name(&self) -> &str {
        "export"
    }

    fn on_end(&self, span: &Arc<SpanRecord>) -> Result<(), TelemetryError> {
        if !span.sampled {
            return Ok(());
        }
        self.enqueue(ExportItem::Span(Arc::clone(span)))
    }
}

impl MetricSink for ExportPipeline {
    fn accept(&self, window: Arc<MetricWindow>) {
        if let Err(e) = self.enqueue(ExportItem::Metrics(window)) {
            debug!(error = %e, "Metric window not queued");
        }
    }
}

impl Drop for ExportPipeline {
    fn drop(&mut self) {
        self.queue.close();
    }
}

struct Worker {
    exporter: Arc<dyn Exporter>,
    counters: Arc<ExporterCounters>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Arc<ExportBatch>>) {
        while let Some(batch) = rx.recv().await {
            self.deliver(&batch).await;
        }
        match tokio::time::timeout(self.timeout, self.exporter.shutdown()).await {
            Ok(Ok(())) => debug!(exporter = self.exporter.name(), "Exporter shut down"),
            Ok(Err(e)) => warn!(exporter = self.exporter.name(), error = %e, "Exporter shutdown failed"),
            Err(_) => warn!(exporter = self.exporter.name(), "Exporter shutdown timed out"),
        }
    }

    async fn deliver(&self, batch: &ExportBatch) {
        let count = batch.len() as u64;
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(self.timeout, self.exporter.export(batch)).await {
                Ok(result) => result,
                Err(_) => Err(super::ExportError::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Ok(()) => {
                    self.counters.delivered_batches.fetch_add(1, Ordering::AcqRel);
                    self.counters.delivered_items.fetch_add(count, Ordering::AcqRel);
                    return;
                }
                Err(e) if self.policy.has_attempts_remaining(attempt) => {
                    attempt += 1;
                    self.counters.retries.fetch_add(1, Ordering::AcqRel);
                    let delay = self.policy.delay_for_attempt(attempt);
                    debug!(
                        exporter = self.exporter.name(),
                        sequence = batch.sequence,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Export failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.counters.failed_batches.fetch_add(1, Ordering::AcqRel);
                    self.counters.dropped_items.fetch_add(count, Ordering::AcqRel);
                    let error = TelemetryError::ExporterDelivery {
                        exporter: self.exporter.name().to_string(),
                        source: e,
                    };
                    warn!(sequence = batch.sequence, attempts = attempt, items = count, error = %error, "Giving up on batch");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportError, InMemoryExporter};
    use crate::model::{SpanKind, SpanStatus, StatusCode};
    use async_trait::async_trait;
    use chrono::Utc;
    use llmscope_config::BackpressurePolicy;
    use llmscope_core::Attributes;

    struct AlwaysFails {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Exporter for AlwaysFails {
        fn name(&self) -> &str {
            "broken"
        }

        async fn export(&self, _batch: &ExportBatch) -> Result<(), ExportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ExportError::Transport("connection refused".into()))
        }
    }

    struct Hangs;

    #[async_trait]
    impl Exporter for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }

        async fn export(&self, _batch: &ExportBatch) -> Result<(), ExportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct FailsTwice {
        calls: AtomicU64,
        inner: InMemoryExporter,
    }

    #[async_trait]
    impl Exporter for FailsTwice {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn export(&self, batch: &ExportBatch) -> Result<(), ExportError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(ExportError::Rejected("503".into()));
            }
            self.inner.export(batch).await
        }
    }

    fn span(n: usize) -> ExportItem {
        let now = Utc::now();
        ExportItem::Span(Arc::new(SpanRecord {
            trace_id: "t".into(),
            span_id: format!("s-{n}"),
            parent_span_id: None,
            name: format!("step-{n}"),
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

    fn config() -> ExportConfig {
        ExportConfig {
            queue_capacity: 64,
            backpressure: BackpressurePolicy::DropOldest,
            batch_size: 4,
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            exporter_timeout_ms: 200,
            flush_interval_ms: 50,
            drain_timeout_ms: 5_000,
            ..ExportConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_exporter_does_not_affect_healthy_one() {
        let good = Arc::new(InMemoryExporter::new("memory"));
        let bad = Arc::new(AlwaysFails {
            calls: AtomicU64::new(0),
        });
        let pipeline = ExportPipeline::start(&config(), vec![bad.clone(), good.clone()]).unwrap();

        for n in 0..10 {
            pipeline.enqueue(span(n)).unwrap();
        }
        let report = pipeline.drain(Duration::from_secs(5)).await;

        assert!(!report.timed_out);
        assert_eq!(report.discarded, 0);
        assert_eq!(good.span_count(), 10);

        let stats = pipeline.stats();
        let broken = stats.exporter("broken").unwrap();
        assert_eq!(broken.delivered_items, 0);
        assert_eq!(broken.dropped_items, 10);
        assert_eq!(broken.retries, broken.failed_batches * 2);
        assert_eq!(bad.calls.load(Ordering::SeqCst), broken.failed_batches * 3);

        let memory = stats.exporter("memory").unwrap();
        assert_eq!(memory.delivered_items, 10);
        assert_eq!(memory.failed_batches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_exporter_times_out_without_blocking_others() {
        let good = Arc::new(InMemoryExporter::new("memory"));
        let mut cfg = config();
        cfg.flush_interval_ms = 60_000;
        let pipeline = ExportPipeline::start(&cfg, vec![Arc::new(Hangs), good.clone()]).unwrap();

        for n in 0..4 {
            pipeline.enqueue(span(n)).unwrap();
        }
        // A full batch goes out without waiting for drain.
        for _ in 0..5_000 {
            if good.span_count() == 4 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
            tokio::task::yield_now().await;
        }
        assert_eq!(good.span_count(), 4);

        let report = pipeline.drain(Duration::from_secs(10)).await;
        assert!(!report.timed_out);
        let hangs = pipeline.stats().exporter("hangs").cloned().unwrap();
        assert_eq!(hangs.failed_batches, 1);
        assert_eq!(hangs.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let flaky = Arc::new(FailsTwice {
            calls: AtomicU64::new(0),
            inner: InMemoryExporter::new("inner"),
        });
        let pipeline = ExportPipeline::start(&config(), vec![flaky.clone()]).unwrap();
        pipeline.enqueue(span(0)).unwrap();
        pipeline.drain(Duration::from_secs(5)).await;

        assert_eq!(flaky.inner.span_count(), 1);
        let stats = pipeline.stats();
        let flaky_stats = stats.exporter("flaky").unwrap();
        assert_eq!(flaky_stats.retries, 2);
        assert_eq!(flaky_stats.delivered_batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_deadline_discards_undelivered() {
        let mut cfg = config();
        cfg.exporter_timeout_ms = 60_000;
        cfg.batch_size = 64;
        cfg.flush_interval_ms = 60_000;
        let pipeline = ExportPipeline::start(&cfg, vec![Arc::new(Hangs)]).unwrap();
        for n in 0..6 {
            pipeline.enqueue(span(n)).unwrap();
        }

        let report = pipeline.drain(Duration::from_millis(500)).await;
        assert!(report.timed_out);
        assert_eq!(report.flushed, 6);
        assert_eq!(report.discarded, 6);
        assert_eq!(pipeline.stats().discarded_at_shutdown, 6);

        // Second drain is a no-op.
        assert_eq!(pipeline.drain(Duration::from_millis(1)).await, DrainReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_after_drain_is_refused() {
        let pipeline = ExportPipeline::start(&config(), vec![]).unwrap();
        pipeline.drain(Duration::from_secs(1)).await;
        assert!(matches!(
            pipeline.enqueue(span(0)),
            Err(TelemetryError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn block_policy_never_stalls_a_single_threaded_producer() {
        let memory = Arc::new(InMemoryExporter::new("memory"));
        let cfg = ExportConfig {
            queue_capacity: 1,
            backpressure: BackpressurePolicy::Block,
            batch_size: 1,
            ..config()
        };
        let pipeline = ExportPipeline::start(&cfg, vec![memory.clone()]).unwrap();

        // No await between pushes: only the dispatcher thread can make room.
        for n in 0..5 {
            pipeline.enqueue(span(n)).unwrap();
        }
        let report = pipeline.drain(Duration::from_secs(5)).await;

        assert!(!report.timed_out);
        assert_eq!(memory.span_count(), 5);
        assert_eq!(pipeline.stats().dropped, 0);
    }

    #[test]
    fn start_outside_runtime_is_an_error() {
        let result = ExportPipeline::start(&config(), vec![]);
        assert!(matches!(result, Err(TelemetryError::NoRuntime(_))));
    }
}
