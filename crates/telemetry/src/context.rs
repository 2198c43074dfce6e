//! Request-scoped context propagation.
//!
//! Each thread owns a stack of immutable overlays. Entering a scope pushes an
//! overlay that inherits every key visible in the enclosing scope; the
//! returned [`ContextGuard`] pops it again on drop, which covers early
//! returns and panics alike. Guards are `!Send`, so an overlay can never
//! outlive or escape the execution path that pushed it.
//!
//! Async work hops between worker threads, so the thread-local stack cannot
//! follow it on its own. [`ContextSnapshot::attach`] wraps a future and
//! installs the snapshot around every poll instead. Spawned sub-tasks only
//! see a context if they are handed a snapshot explicitly.

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context as TaskContext, Poll};

use llmscope_core::{AttributeValue, Attributes};

use crate::model::SpanContext;
use crate::tracer::{SpanNode, SpanRef};

struct StackEntry {
    id: u64,
    snapshot: ContextSnapshot,
}

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<StackEntry>> = const { RefCell::new(Vec::new()) };
}

static NEXT_GUARD_ID: AtomicU64 = AtomicU64::new(1);

/// Entry points for the current thread's context stack.
pub struct Context;

impl Context {
    /// Push an overlay holding `attributes` on top of the current context.
    ///
    /// Keys already visible stay visible unless `attributes` shadows them.
    #[must_use = "the overlay is popped as soon as the guard is dropped"]
    pub fn enter<I, K, V>(attributes: I) -> ContextGuard
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        Self::current().with_values(attributes).enter()
    }

    /// The merged view of every overlay on this thread, innermost winning.
    ///
    /// Returns an empty snapshot when nothing has been entered.
    pub fn current() -> ContextSnapshot {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|entry| entry.snapshot.clone())
                .unwrap_or_default()
        })
    }

    /// Number of overlays currently pushed on this thread.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }
}

/// An immutable, shareable view of a context.
///
/// This is the only form in which context crosses from one execution path to
/// another.
#[derive(Clone, Default)]
pub struct ContextSnapshot {
    values: Arc<Attributes>,
    span: Option<Arc<SpanNode>>,
}

impl ContextSnapshot {
    /// An empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.values.get(key)
    }

    pub fn values(&self) -> &Attributes {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.span.is_none()
    }

    /// Identity of the ambient span, if any.
    pub fn span_context(&self) -> Option<SpanContext> {
        self.span.as_ref().map(|node| node.context().clone())
    }

    /// The ambient span, if it is still open.
    pub fn active_span(&self) -> Option<SpanRef> {
        self.span
            .as_ref()
            .filter(|node| node.is_open())
            .map(|node| SpanRef::from_node(Arc::clone(node)))
    }

    /// A copy of this snapshot with `attributes` layered on top.
    pub fn with_values<I, K, V>(&self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        let mut values = (*self.values).clone();
        values.extend(attributes.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self {
            values: Arc::new(values),
            span: self.span.clone(),
        }
    }

    pub(crate) fn with_span(&self, node: Arc<SpanNode>) -> Self {
        Self {
            values: Arc::clone(&self.values),
            span: Some(node),
        }
    }

    pub(crate) fn span_node(&self) -> Option<&Arc<SpanNode>> {
        self.span.as_ref()
    }

    /// Install this snapshot as the current context of this thread.
    #[must_use = "the overlay is popped as soon as the guard is dropped"]
    pub fn enter(&self) -> ContextGuard {
        let id = NEXT_GUARD_ID.fetch_add(1, Ordering::Relaxed);
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(StackEntry {
                id,
                snapshot: self.clone(),
            });
        });
        ContextGuard {
            id,
            _not_send: PhantomData,
        }
    }

    /// Run `future` with this snapshot installed around every poll.
    pub fn attach<F: Future>(self, future: F) -> WithContext<F> {
        WithContext {
            snapshot: self,
            inner: Box::pin(future),
        }
    }
}

impl PartialEq for ContextSnapshot {
    fn eq(&self, other: &Self) -> bool {
        let same_span = match (&self.span, &other.span) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        same_span && self.values == other.values
    }
}

impl std::fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSnapshot")
            .field("values", &self.values)
            .field("span", &self.span_context())
            .finish()
    }
}

/// Pops its overlay when dropped.
pub struct ContextGuard {
    id: u64,
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        // `try_with` because guards may be dropped during thread teardown.
        let _ = CONTEXT_STACK.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|entry| entry.id == self.id) {
                stack.remove(pos);
            }
        });
    }
}

/// Future wrapper returned by [`ContextSnapshot::attach`].
pub struct WithContext<F> {
    snapshot: ContextSnapshot,
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for WithContext<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let _guard = this.snapshot.enter();
        this.inner.as_mut().poll(cx)
    }
}
