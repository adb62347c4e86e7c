// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::HeaderMap;
use tick::Clock;

use crate::headers::{self, ExtractError};
use crate::{FinishedSpan, NoopExporter, SpanExporter, SpanOutcome, TraceContext};

/// Creates spans, moves trace contexts across call boundaries and reports finished spans.
///
/// The propagator is cheap to clone. All clones share the same exporter.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use breadcrumb::{LogExporter, SpanOutcome, TraceContext, TracePropagator};
/// use tick::Clock;
///
/// # fn example(clock: &Clock) {
/// let propagator = TracePropagator::new(clock).exporter(std::sync::Arc::new(LogExporter::default()));
///
/// let span = propagator.start_span(&TraceContext::new_root(), "passenger.lookup");
/// let headers = propagator.inject(span.context());
///
/// // ... send `headers` along with the request ...
///
/// propagator.finish_span(span, SpanOutcome::Success, Duration::from_millis(12));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TracePropagator {
    clock: Clock,
    exporter: Arc<dyn SpanExporter>,
}

impl TracePropagator {
    /// Creates a propagator that discards finished spans.
    #[must_use]
    pub fn new(clock: &Clock) -> Self {
        Self {
            clock: clock.clone(),
            exporter: Arc::new(NoopExporter),
        }
    }

    /// Sets the exporter that receives finished spans.
    #[must_use]
    pub fn exporter(self, exporter: Arc<dyn SpanExporter>) -> Self {
        Self { exporter, ..self }
    }

    /// Starts a child span of `parent`.
    #[must_use]
    pub fn start_span(&self, parent: &TraceContext, operation_name: impl Into<Cow<'static, str>>) -> Span {
        Span {
            context: parent.child(),
            operation_name: operation_name.into(),
            start_time: self.clock.system_time(),
            attempt: None,
        }
    }

    /// Completes `span` and hands it to the exporter.
    pub fn finish_span(&self, span: Span, outcome: SpanOutcome, latency: Duration) {
        self.exporter.export(FinishedSpan {
            trace_id: span.context.trace_id(),
            span_id: span.context.span_id(),
            parent_span_id: span.context.parent_span_id(),
            operation_name: span.operation_name,
            start_time: span.start_time,
            duration: latency,
            outcome,
            attempt: span.attempt,
        });
    }

    /// Renders `context` as propagation headers.
    #[must_use]
    pub fn inject(&self, context: &TraceContext) -> HeaderMap {
        let mut map = HeaderMap::new();
        headers::inject(context, &mut map);
        map
    }

    /// Reads a trace context from propagation headers.
    ///
    /// # Errors
    ///
    /// See [`headers::extract`].
    pub fn extract(&self, headers: &HeaderMap) -> Result<TraceContext, ExtractError> {
        headers::extract(headers)
    }
}

/// A started span that has not been reported yet.
#[derive(Debug, Clone)]
pub struct Span {
    context: TraceContext,
    operation_name: Cow<'static, str>,
    start_time: SystemTime,
    attempt: Option<u32>,
}

impl Span {
    /// Trace context of this span. Propagate it to the callee.
    #[must_use]
    pub const fn context(&self) -> &TraceContext {
        &self.context
    }

    /// Name of the operation the span covers.
    #[must_use]
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Wall-clock time at which the span started.
    #[must_use]
    pub const fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Marks the span as covering the given zero-based attempt of a retried call.
    #[must_use]
    pub const fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}
