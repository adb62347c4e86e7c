// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{SpanId, TraceId};

/// Correlation identifiers carried through a chain of calls.
///
/// A `TraceContext` is an immutable value. Deriving a child span or adding a baggage
/// item produces a new context and leaves the original untouched, so contexts can be
/// cloned and shared across tasks without locking.
///
/// # Examples
///
/// ```
/// use breadcrumb::TraceContext;
///
/// let root = TraceContext::new_root().with_baggage_item("tenant", "contoso");
/// let child = root.child();
///
/// assert_eq!(child.trace_id(), root.trace_id());
/// assert_eq!(child.parent_span_id(), Some(root.span_id()));
/// assert_eq!(child.baggage_item("tenant"), Some("contoso"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    baggage: Arc<BTreeMap<String, String>>,
}

impl TraceContext {
    /// Starts a new trace with a fresh root span and no baggage.
    #[must_use]
    pub fn new_root() -> Self {
        Self {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            parent_span_id: None,
            baggage: Arc::default(),
        }
    }

    /// Assembles a context from its parts, typically after reading them off the wire.
    #[must_use]
    pub fn from_parts(
        trace_id: TraceId,
        span_id: SpanId,
        parent_span_id: Option<SpanId>,
        baggage: BTreeMap<String, String>,
    ) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id,
            baggage: Arc::new(baggage),
        }
    }

    /// Derives a child span of this context.
    ///
    /// The child keeps the trace id and baggage, gets a fresh span id and records this
    /// context's span as its parent.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::random(),
            parent_span_id: Some(self.span_id),
            baggage: Arc::clone(&self.baggage),
        }
    }

    /// Returns a copy of this context with `key` set to `value` in its baggage.
    #[must_use]
    pub fn with_baggage_item(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut baggage = BTreeMap::clone(&self.baggage);
        baggage.insert(key.into(), value.into());

        Self {
            baggage: Arc::new(baggage),
            ..self.clone()
        }
    }

    /// The trace this context belongs to.
    #[must_use]
    pub const fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The span this context represents.
    #[must_use]
    pub const fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The span that caused this one, if any.
    #[must_use]
    pub const fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    /// All baggage items, ordered by key.
    #[must_use]
    pub fn baggage(&self) -> &BTreeMap<String, String> {
        &self.baggage
    }

    /// Looks up a single baggage item.
    #[must_use]
    pub fn baggage_item(&self, key: &str) -> Option<&str> {
        self.baggage.get(key).map(String::as_str)
    }
}
