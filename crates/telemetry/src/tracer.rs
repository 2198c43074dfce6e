//! Span registry: opens, mutates and seals spans.
//!
//! A span is open from [`Tracer::start`] until [`SpanHandle::end`]. While
//! open it accepts attributes; once sealed it becomes an immutable
//! [`SpanRecord`] handed to every registered [`SpanProcessor`] in the
//! calling thread. Processors are the only bridge to the metrics, cost and
//! export subsystems, and a failing processor is logged and skipped.
//!
//! Parent and trace identity come from the ambient context (see
//! [`crate::context`]). Dropping an open [`SpanHandle`] cancels it: every
//! still-open descendant is sealed as `cancelled` first, then the span
//! itself. A span that outlives its parent is sealed normally and flagged
//! `orphaned`.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use llmscope_core::{AttributeValue, Attributes};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::TelemetryError;
use crate::context::{Context, ContextGuard, ContextSnapshot};
use crate::model::{SpanContext, SpanKind, SpanMetrics, SpanRecord, SpanStatus, StatusCode, attr};

/// Receives every sealed span, synchronously, on the thread that ended it.
pub trait SpanProcessor: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    fn on_end(&self, span: &Arc<SpanRecord>) -> Result<(), TelemetryError>;
}

struct TracerShared {
    processors: Vec<Arc<dyn SpanProcessor>>,
    sampling_rate: f64,
    max_attributes: usize,
}

impl TracerShared {
    fn deliver(&self, record: &Arc<SpanRecord>) {
        for processor in &self.processors {
            let outcome = catch_unwind(AssertUnwindSafe(|| processor.on_end(record)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    processor = processor.name(),
                    span_id = %record.span_id,
                    error = %e,
                    "Span processor failed"
                ),
                Err(_) => error!(
                    processor = processor.name(),
                    span_id = %record.span_id,
                    "Span processor panicked"
                ),
            }
        }
    }

    fn should_sample(&self, trace_id: &Uuid) -> bool {
        if self.sampling_rate >= 1.0 {
            return true;
        }
        if self.sampling_rate <= 0.0 {
            return false;
        }
        // Low 64 bits of a v4 uuid are random; compare them as a ratio.
        let bits = trace_id.as_u128() as u64;
        (bits as f64 / u64::MAX as f64) < self.sampling_rate
    }
}

struct OpenState {
    attributes: Attributes,
    dropped_attributes: u32,
}

/// Shared state behind a span; outlives the handle while anything (a child,
/// a context snapshot) still refers to it.
pub(crate) struct SpanNode {
    context: SpanContext,
    parent_span_id: Option<String>,
    parent: Option<Arc<SpanNode>>,
    name: String,
    kind: SpanKind,
    start_time: DateTime<Utc>,
    started: Instant,
    state: Mutex<Option<OpenState>>,
    closed: AtomicBool,
    children: Mutex<Vec<Weak<SpanNode>>>,
    shared: Arc<TracerShared>,
}

impl SpanNode {
    pub(crate) fn context(&self) -> &SpanContext {
        &self.context
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn register_child(&self, child: &Arc<SpanNode>) {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        if children.len() == children.capacity() {
            children.retain(|w| w.strong_count() > 0);
        }
        children.push(Arc::downgrade(child));
    }

    fn set_attribute(&self, key: String, value: AttributeValue) -> Result<(), TelemetryError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(open) = state.as_mut() else {
            return Err(TelemetryError::AttributeOnClosedSpan {
                span_id: self.context.span_id.clone(),
                key,
            });
        };

        if !value.is_finite() {
            open.dropped_attributes += 1;
            debug!(span_id = %self.context.span_id, key = %key, "Non-finite float attribute, dropping");
            return Ok(());
        }
        if open.attributes.len() >= self.shared.max_attributes && !open.attributes.contains_key(&key) {
            open.dropped_attributes += 1;
            debug!(span_id = %self.context.span_id, key = %key, "Attribute limit reached, dropping");
            return Ok(());
        }
        open.attributes.insert(key, value);
        Ok(())
    }

    /// Seal the span. Returns `None` if it was already sealed.
    fn seal(&self, code: StatusCode, message: Option<String>) -> Option<Arc<SpanRecord>> {
        let open = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let open = state.take()?;
            self.closed.store(true, Ordering::Release);
            open
        };

        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let end_time = self.start_time + elapsed;
        let orphaned = self.parent.as_ref().is_some_and(|p| !p.is_open());

        let mut record = SpanRecord {
            trace_id: self.context.trace_id.clone(),
            span_id: self.context.span_id.clone(),
            parent_span_id: self.parent_span_id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            start_time: self.start_time,
            end_time,
            status: SpanStatus {
                code,
                message,
                orphaned,
            },
            attributes: open.attributes,
            metrics_summary: None,
            dropped_attributes: open.dropped_attributes,
            sampled: self.context.sampled,
        };
        record.metrics_summary = Some(SpanMetrics {
            duration_ms: record.duration_ms(),
            input_tokens: record
                .attributes
                .get(attr::LLM_INPUT_TOKENS)
                .and_then(AttributeValue::as_u64),
            output_tokens: record
                .attributes
                .get(attr::LLM_OUTPUT_TOKENS)
                .and_then(AttributeValue::as_u64),
        });
        if orphaned {
            debug!(span_id = %record.span_id, name = %record.name, "Span closed after its parent");
        }

        let record = Arc::new(record);
        self.shared.deliver(&record);
        Some(record)
    }

    /// Seal every open descendant as cancelled, deepest first.
    fn cancel_descendants(&self) {
        let children: Vec<Arc<SpanNode>> = {
            let children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
            children.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            child.cancel_descendants();
            child.seal(StatusCode::Cancelled, Some("enclosing operation cancelled".into()));
        }
    }

    fn cancel(&self, reason: &str) -> Option<Arc<SpanRecord>> {
        if !self.is_open() {
            return None;
        }
        self.cancel_descendants();
        self.seal(StatusCode::Cancelled, Some(reason.into()))
    }
}

/// Creates spans.
///
/// Cheap to clone; clones share processors and sampling settings.
#[derive(Clone)]
pub struct Tracer {
    shared: Arc<TracerShared>,
}

/// Builder for [`Tracer`].
pub struct TracerBuilder {
    processors: Vec<Arc<dyn SpanProcessor>>,
    sampling_rate: f64,
    max_attributes: usize,
}

impl TracerBuilder {
    /// Fraction of traces marked as sampled, clamped to 0.0 - 1.0.
    pub fn sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn max_attributes_per_span(mut self, max: usize) -> Self {
        self.max_attributes = max.max(1);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn SpanProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn build(self) -> Tracer {
        Tracer {
            shared: Arc::new(TracerShared {
                processors: self.processors,
                sampling_rate: self.sampling_rate,
                max_attributes: self.max_attributes,
            }),
        }
    }
}

impl Tracer {
    pub fn builder() -> TracerBuilder {
        TracerBuilder {
            processors: Vec::new(),
            sampling_rate: 1.0,
            max_attributes: 128,
        }
    }

    /// Start a span under the ambient span, or a new trace if there is none.
    pub fn start(&self, name: impl Into<String>, kind: SpanKind) -> SpanHandle {
        let ambient = Context::current();
        match ambient.span_node() {
            Some(parent) => self.open(name.into(), kind, ParentLink::Local(Arc::clone(parent))),
            None => self.open(name.into(), kind, ParentLink::Root),
        }
    }

    /// Start a span under an explicitly supplied parent identity.
    ///
    /// Used when the parent lives on another execution path and only its
    /// [`SpanContext`] was carried over. `None` starts a new trace.
    pub fn start_with_parent(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<&SpanContext>,
    ) -> SpanHandle {
        let link = match parent {
            Some(ctx) => ParentLink::Remote(ctx.clone()),
            None => ParentLink::Root,
        };
        self.open(name.into(), kind, link)
    }

    fn open(&self, name: String, kind: SpanKind, link: ParentLink) -> SpanHandle {
        let span_id = Uuid::new_v4().to_string();
        let (context, parent_span_id, parent) = match link {
            ParentLink::Root => {
                let trace_id = Uuid::new_v4();
                let sampled = self.shared.should_sample(&trace_id);
                (
                    SpanContext {
                        trace_id: trace_id.to_string(),
                        span_id,
                        sampled,
                    },
                    None,
                    None,
                )
            }
            ParentLink::Local(parent) => (
                SpanContext {
                    trace_id: parent.context.trace_id.clone(),
                    span_id,
                    sampled: parent.context.sampled,
                },
                Some(parent.context.span_id.clone()),
                Some(parent),
            ),
            ParentLink::Remote(parent) => (
                SpanContext {
                    trace_id: parent.trace_id,
                    span_id,
                    sampled: parent.sampled,
                },
                Some(parent.span_id),
                None,
            ),
        };

        let node = Arc::new(SpanNode {
            context,
            parent_span_id,
            parent,
            name,
            kind,
            start_time: Utc::now(),
            started: Instant::now(),
            state: Mutex::new(Some(OpenState {
                attributes: Attributes::new(),
                dropped_attributes: 0,
            })),
            closed: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
            shared: Arc::clone(&self.shared),
        });
        if let Some(parent) = &node.parent {
            parent.register_child(&node);
        }
        SpanHandle { node }
    }

    /// A non-owning reference to the ambient span, if it is still open.
    pub fn current_span() -> Option<SpanRef> {
        Context::current().active_span()
    }

    /// Run `f` inside a new span that is ambient for the duration of the call.
    ///
    /// `Ok` seals the span as ok, `Err` as error carrying the error's text.
    /// A panic unwinding out of `f` seals it as cancelled.
    pub fn in_span<T, E, F>(&self, name: impl Into<String>, kind: SpanKind, f: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnOnce(&SpanHandle) -> Result<T, E>,
    {
        let span = self.start(name, kind);
        let result = {
            let _guard = span.enter();
            f(&span)
        };
        span.finish(&result);
        result
    }

    /// Async counterpart of [`Tracer::in_span`].
    ///
    /// The span is ambient inside the future on whatever thread polls it. If
    /// the returned future is dropped before completion the span and its open
    /// descendants are sealed as cancelled.
    pub async fn in_span_async<T, E, F, Fut>(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        f: F,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnOnce(SpanRef) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let span = self.start(name, kind);
        let result = span.snapshot().attach(f(span.span_ref())).await;
        span.finish(&result);
        result
    }
}

enum ParentLink {
    Root,
    Local(Arc<SpanNode>),
    Remote(SpanContext),
}

/// Owning handle of an open span.
///
/// Dropping the handle without calling [`SpanHandle::end`] cancels the span.
pub struct SpanHandle {
    node: Arc<SpanNode>,
}

impl SpanHandle {
    pub fn context(&self) -> &SpanContext {
        &self.node.context
    }

    pub fn trace_id(&self) -> &str {
        &self.node.context.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.node.context.span_id
    }

    pub fn is_open(&self) -> bool {
        self.node.is_open()
    }

    /// Set an attribute. Fails once the span has been sealed.
    pub fn set_attribute(
        &self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Result<(), TelemetryError> {
        self.node.set_attribute(key.into(), value.into())
    }

    /// Start a child of this span regardless of the ambient context.
    pub fn child(&self, name: impl Into<String>, kind: SpanKind) -> SpanHandle {
        let tracer = Tracer {
            shared: Arc::clone(&self.node.shared),
        };
        tracer.open(name.into(), kind, ParentLink::Local(Arc::clone(&self.node)))
    }

    /// Make this span the ambient span of the current thread.
    #[must_use = "the span stops being ambient as soon as the guard is dropped"]
    pub fn enter(&self) -> ContextGuard {
        self.snapshot().enter()
    }

    /// The current context with this span as the ambient span.
    pub fn snapshot(&self) -> ContextSnapshot {
        Context::current().with_span(Arc::clone(&self.node))
    }

    pub fn span_ref(&self) -> SpanRef {
        SpanRef {
            node: Arc::clone(&self.node),
        }
    }

    /// Seal the span.
    ///
    /// Returns the sealed record on the first call. Later calls are no-ops
    /// that return `None`; nothing is delivered twice.
    pub fn end(&self, code: StatusCode) -> Option<Arc<SpanRecord>> {
        self.node.seal(code, None)
    }

    /// Seal the span as an error with a message.
    pub fn end_with_error(&self, message: impl Into<String>) -> Option<Arc<SpanRecord>> {
        self.node.seal(StatusCode::Error, Some(message.into()))
    }

    /// Seal every open descendant and then this span as cancelled.
    pub fn cancel(&self) -> Option<Arc<SpanRecord>> {
        self.node.cancel("cancelled")
    }

    fn finish<T, E: std::fmt::Display>(&self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.end(StatusCode::Ok),
            Err(e) => self.end_with_error(e.to_string()),
        };
    }
}

impl Drop for SpanHandle {
    fn drop(&mut self) {
        if self.node.is_open() {
            debug!(span_id = %self.node.context.span_id, name = %self.node.name, "Span dropped while open");
            self.node.cancel("dropped before end");
        }
    }
}

impl std::fmt::Debug for SpanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanHandle")
            .field("name", &self.node.name)
            .field("context", &self.node.context)
            .field("open", &self.node.is_open())
            .finish()
    }
}

/// Non-owning reference to a span: may set attributes, may not end it.
#[derive(Clone)]
pub struct SpanRef {
    node: Arc<SpanNode>,
}

impl SpanRef {
    pub(crate) fn from_node(node: Arc<SpanNode>) -> Self {
        Self { node }
    }

    pub fn context(&self) -> &SpanContext {
        &self.node.context
    }

    pub fn is_open(&self) -> bool {
        self.node.is_open()
    }

    pub fn set_attribute(
        &self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Result<(), TelemetryError> {
        self.node.set_attribute(key.into(), value.into())
    }
}
