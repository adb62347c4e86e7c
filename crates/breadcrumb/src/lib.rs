// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Explicit trace context propagation for calls between services.
//!
//! A [`TraceContext`] carries the identifiers that correlate work across service
//! boundaries: a trace id shared by the whole call chain, the id of the current span,
//! the id of its parent and a small set of string baggage items. Contexts are plain
//! immutable values. They are passed explicitly through every async boundary rather
//! than looked up from ambient task-local state.
//!
//! # Core Types
//!
//! - [`TraceContext`]: the correlation value itself.
//! - [`TracePropagator`]: starts spans, moves contexts onto and off the wire and
//!   reports finished spans.
//! - [`SpanExporter`]: the sink that receives [`FinishedSpan`]s. [`BufferedExporter`]
//!   queues them for a collector, [`LogExporter`] writes them as `tracing` events.
//!
//! # Wire Format
//!
//! The [`headers`] module documents the header names and encodings used to carry
//! a context in an [`http::HeaderMap`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use breadcrumb::{BufferedExporter, SpanOutcome, TraceContext, TracePropagator};
//! use tick::Clock;
//!
//! let exporter = Arc::new(BufferedExporter::new(1024));
//! let propagator = TracePropagator::new(&Clock::new_frozen()).exporter(exporter.clone());
//!
//! // Caller side: start a span and put its context on the wire.
//! let root = TraceContext::new_root();
//! let span = propagator.start_span(&root, "baggage.lookup");
//! let headers = propagator.inject(span.context());
//!
//! // Callee side: pick the context up again.
//! let remote = propagator.extract(&headers).unwrap();
//! assert_eq!(remote.trace_id(), root.trace_id());
//!
//! propagator.finish_span(span, SpanOutcome::Success, Duration::from_millis(3));
//! assert_eq!(exporter.len(), 1);
//! ```

mod context;
mod export;
pub mod headers;
mod ids;
mod propagator;

pub use context::TraceContext;
pub use export::{BufferedExporter, FinishedSpan, LogExporter, NoopExporter, SpanExporter, SpanOutcome};
pub use headers::ExtractError;
pub use ids::{ParseIdError, SpanId, TraceId};
pub use propagator::{Span, TracePropagator};
