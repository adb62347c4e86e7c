// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::{SpanId, TraceId};

/// How a span ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SpanOutcome {
    /// The operation completed successfully.
    Success,

    /// The operation failed.
    Failure,

    /// The operation did not complete within its time budget.
    Timeout,

    /// The operation was never started because it was rejected up front.
    Rejected,

    /// The operation was abandoned before it completed.
    Cancelled,
}

impl SpanOutcome {
    /// Returns the outcome as a lowercase string suitable for logs and attributes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for SpanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed span, ready to be handed to a collector.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct FinishedSpan {
    /// Trace the span belongs to.
    pub trace_id: TraceId,
    /// Identifier of the span.
    pub span_id: SpanId,
    /// Span that caused this one, if any.
    pub parent_span_id: Option<SpanId>,
    /// Logical name of the operation.
    pub operation_name: Cow<'static, str>,
    /// Wall-clock time at which the span started.
    pub start_time: SystemTime,
    /// How long the span took.
    pub duration: Duration,
    /// How the span ended.
    pub outcome: SpanOutcome,
    /// Zero-based attempt index when the span covers one attempt of a retried call.
    pub attempt: Option<u32>,
}

/// Receives finished spans.
///
/// Implementations are called inline on the request path and must not block.
/// Anything expensive, such as network I/O, belongs on a separate task that
/// consumes spans buffered by the exporter.
pub trait SpanExporter: Debug + Send + Sync {
    /// Accepts a finished span.
    fn export(&self, span: FinishedSpan);
}

/// Discards every span.
#[derive(Debug, Default, Clone, Copy)]
#[non_exhaustive]
pub struct NoopExporter;

impl SpanExporter for NoopExporter {
    fn export(&self, _span: FinishedSpan) {}
}

/// Emits every span as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
#[non_exhaustive]
pub struct LogExporter;

impl SpanExporter for LogExporter {
    fn export(&self, span: FinishedSpan) {
        tracing::event!(
            name: "breadcrumb.span.finished",
            tracing::Level::DEBUG,
            trace.id = %span.trace_id,
            span.id = %span.span_id,
            span.parent_id = span.parent_span_id.map(tracing::field::display),
            span.name = %span.operation_name,
            span.outcome = span.outcome.as_str(),
            span.duration = span.duration.as_secs_f32(),
            span.attempt = span.attempt,
        );
    }
}

/// Keeps finished spans in a bounded in-memory queue until a collector drains them.
///
/// When the queue is full the oldest span is discarded to make room and counted
/// in [`dropped`][BufferedExporter::dropped].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use breadcrumb::{BufferedExporter, TracePropagator, TraceContext, SpanOutcome};
/// use tick::Clock;
///
/// let exporter = Arc::new(BufferedExporter::new(128));
/// let propagator = TracePropagator::new(&Clock::new_frozen()).exporter(exporter.clone());
///
/// let span = propagator.start_span(&TraceContext::new_root(), "lookup");
/// propagator.finish_span(span, SpanOutcome::Success, std::time::Duration::ZERO);
///
/// assert_eq!(exporter.drain().len(), 1);
/// ```
#[derive(Debug)]
pub struct BufferedExporter {
    capacity: usize,
    spans: Mutex<VecDeque<FinishedSpan>>,
    dropped: AtomicU64,
}

impl BufferedExporter {
    /// Creates an exporter that holds at most `capacity` spans.
    ///
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            capacity,
            spans: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Removes and returns all buffered spans, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<FinishedSpan> {
        self.spans.lock().drain(..).collect()
    }

    /// Number of spans currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.spans.lock().len()
    }

    /// Returns `true` if no spans are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.lock().is_empty()
    }

    /// Total number of spans discarded because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SpanExporter for BufferedExporter {
    fn export(&self, span: FinishedSpan) {
        let mut spans = self.spans.lock();

        if spans.len() >= self.capacity {
            spans.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }

        spans.push_back(span);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(BufferedExporter: Send, Sync);
    static_assertions::assert_obj_safe!(SpanExporter);

    fn span(index: u32) -> FinishedSpan {
        FinishedSpan {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            parent_span_id: None,
            operation_name: Cow::Borrowed("test"),
            start_time: SystemTime::UNIX_EPOCH,
            duration: Duration::from_millis(u64::from(index)),
            outcome: SpanOutcome::Success,
            attempt: Some(index),
        }
    }

    #[test]
    fn outcome_as_str() {
        assert_eq!(SpanOutcome::Success.as_str(), "success");
        assert_eq!(SpanOutcome::Failure.as_str(), "failure");
        assert_eq!(SpanOutcome::Timeout.as_str(), "timeout");
        assert_eq!(SpanOutcome::Rejected.as_str(), "rejected");
        assert_eq!(SpanOutcome::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn buffered_exporter_keeps_order() {
        let exporter = BufferedExporter::new(4);
        exporter.export(span(0));
        exporter.export(span(1));

        let drained = exporter.drain();

        assert_eq!(drained.iter().map(|s| s.attempt).collect::<Vec<_>>(), [Some(0), Some(1)]);
        assert!(exporter.is_empty());
    }

    #[test]
    fn buffered_exporter_drops_oldest_when_full() {
        let exporter = BufferedExporter::new(2);
        for index in 0..5 {
            exporter.export(span(index));
        }

        assert_eq!(exporter.len(), 2);
        assert_eq!(exporter.dropped(), 3);
        assert_eq!(
            exporter.drain().iter().map(|s| s.attempt).collect::<Vec<_>>(),
            [Some(3), Some(4)]
        );
    }

    #[test]
    fn zero_capacity_holds_one() {
        let exporter = BufferedExporter::new(0);
        exporter.export(span(0));
        exporter.export(span(1));

        assert_eq!(exporter.len(), 1);
        assert_eq!(exporter.dropped(), 1);
    }

    #[test]
    fn noop_and_log_exporters_accept_spans() {
        NoopExporter.export(span(0));
        LogExporter.export(span(1));
    }
}
