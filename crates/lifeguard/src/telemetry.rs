// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attribute keys and event names reported by this crate.
//!
//! Every resilience event is logged as a `tracing` event. With the `metrics` feature
//! enabled and a meter provider configured, each event also increments the
//! `resilience.event` counter, annotated with the keys below.

use crate::CallId;

/// Key used to annotate the call identifier an event belongs to.
pub const PIPELINE_NAME: &str = "resilience.pipeline.name";

/// Key used to annotate the resilience strategy that produced an event.
///
/// Values: `circuit_breaker`, `retry`, `timeout`, `fallback`, `readiness`.
pub const STRATEGY_NAME: &str = "resilience.strategy.name";

/// Key used to annotate the specific resilience event being emitted.
///
/// Values: `circuit_opened`, `circuit_reopened`, `circuit_half_opened`, `circuit_closed`,
/// `circuit_rejected`, `retry`, `timeout`, `fallback`, `not_ready`.
pub const EVENT_NAME: &str = "resilience.event.name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Strategy {
    CircuitBreaker,
    Retry,
    Timeout,
    Fallback,
    Readiness,
}

impl Strategy {
    #[cfg(any(feature = "metrics", test))]
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::CircuitBreaker => "circuit_breaker",
            Self::Retry => "retry",
            Self::Timeout => "timeout",
            Self::Fallback => "fallback",
            Self::Readiness => "readiness",
        }
    }
}

pub(crate) const CIRCUIT_OPENED: &str = "circuit_opened";
pub(crate) const CIRCUIT_REOPENED: &str = "circuit_reopened";
pub(crate) const CIRCUIT_HALF_OPENED: &str = "circuit_half_opened";
pub(crate) const CIRCUIT_CLOSED: &str = "circuit_closed";
pub(crate) const CIRCUIT_REJECTED: &str = "circuit_rejected";
pub(crate) const RETRY: &str = "retry";
pub(crate) const TIMEOUT: &str = "timeout";
pub(crate) const FALLBACK: &str = "fallback";
pub(crate) const NOT_READY: &str = "not_ready";

/// Counts resilience events when metrics are enabled.
#[derive(Debug, Clone, Default)]
pub(crate) struct Telemetry {
    #[cfg(any(feature = "metrics", test))]
    events: Option<opentelemetry::metrics::Counter<u64>>,
}

impl Telemetry {
    #[cfg(any(feature = "metrics", test))]
    pub(crate) fn with_meter_provider(provider: &dyn opentelemetry::metrics::MeterProvider) -> Self {
        let meter = metrics::create_meter(provider);

        Self {
            events: Some(metrics::create_resilience_event_counter(&meter)),
        }
    }

    #[cfg_attr(
        not(any(feature = "metrics", test)),
        expect(unused_variables, clippy::unused_self, reason = "unused when metrics feature not used")
    )]
    pub(crate) fn count(&self, call_id: &CallId, strategy: Strategy, event: &'static str) {
        #[cfg(any(feature = "metrics", test))]
        if let Some(events) = &self.events {
            events.add(
                1,
                &[
                    opentelemetry::KeyValue::new(PIPELINE_NAME, call_id.to_string()),
                    opentelemetry::KeyValue::new(STRATEGY_NAME, strategy.as_str()),
                    opentelemetry::KeyValue::new(EVENT_NAME, event),
                ],
            );
        }
    }
}

#[cfg(any(feature = "metrics", test))]
pub(crate) mod metrics {
    use opentelemetry::InstrumentationScope;
    use opentelemetry::metrics::{Counter, Meter, MeterProvider};

    const METER_NAME: &str = "lifeguard";
    const VERSION: &str = "v0.1.0";
    const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.47.0";

    pub(crate) fn create_meter(meter_provider: &dyn MeterProvider) -> Meter {
        meter_provider.meter_with_scope(
            InstrumentationScope::builder(METER_NAME)
                .with_version(VERSION)
                .with_schema_url(SCHEMA_URL)
                .build(),
        )
    }

    pub(crate) fn create_resilience_event_counter(meter: &Meter) -> Counter<u64> {
        meter
            .u64_counter("resilience.event")
            .with_description("Emitted upon the occurrence of a resilience event.")
            .with_unit("u64")
            .build()
    }
}
