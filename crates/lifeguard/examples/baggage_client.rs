// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A passenger service calling a flaky baggage service through a [`PolicyExecutor`].
//!
//! The baggage service starts out healthy, goes through an outage and recovers. Watch the
//! log output to see retries, the circuit opening during the outage, the fallback serving
//! an empty baggage list while the circuit is open, and the circuit closing again once
//! probes succeed. Finished attempt spans are printed at the end.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use breadcrumb::{BufferedExporter, TraceContext, TracePropagator};
use http::HeaderMap;
use lifeguard::{CallId, PolicyExecutor, PolicyRegistry, Recovery, RecoveryInfo};
use ohno::AppError;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_stdout::MetricExporter;
use tick::Clock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const POLICIES: &str = r#"{
    "default": { "timeout": "1s", "max_retries": 1 },
    "calls": {
        "baggage.get": {
            "timeout": "250ms",
            "max_retries": 2,
            "retry_delay": "100ms",
            "backoff": "exponential",
            "jitter": true,
            "request_volume_threshold": 4,
            "failure_ratio": 0.5,
            "open_duration": "1s",
            "success_threshold": 2
        }
    }
}"#;

const BAGGAGE_GET: CallId = CallId::from_static("baggage.get");

#[derive(Debug, thiserror::Error)]
enum BaggageError {
    #[error("baggage service unavailable")]
    Unavailable,
}

impl Recovery for BaggageError {
    fn recovery(&self) -> RecoveryInfo {
        RecoveryInfo::retry()
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let meter_provider = configure_telemetry();

    let clock = Clock::new_tokio();
    let spans = Arc::new(BufferedExporter::new(256));
    let policies = PolicyRegistry::from_json_str(POLICIES)?;

    let executor = PolicyExecutor::new(&clock)
        .propagator(TracePropagator::new(&clock).exporter(spans.clone()))
        .meter_provider(&meter_provider);

    let service = BaggageService::default();

    for passenger in 0..40 {
        clock.delay(Duration::from_millis(100)).await;

        let root = TraceContext::new_root().with_baggage_item("passenger", passenger.to_string());

        let bags = executor
            .execute_with_fallback(
                BAGGAGE_GET,
                &policies.policy(&BAGGAGE_GET),
                &root,
                |attempt| service.get(&clock, attempt.into_headers()),
                |args| async move {
                    println!("{passenger}: serving empty baggage list ({})", args.reason());
                    Ok(Vec::new())
                },
            )
            .await;

        match bags {
            Ok(bags) => println!("{passenger}: {bags:?} (circuit: {:?})", executor.breakers().state(&BAGGAGE_GET)),
            Err(e) => println!("{passenger}: {e}"),
        }
    }

    for span in spans.drain() {
        println!(
            "{} {} parent={:?} attempt={:?} {} {:?}",
            span.trace_id,
            span.span_id,
            span.parent_span_id,
            span.attempt,
            span.outcome.as_str(),
            span.duration
        );
    }

    // Flush metrics to stdout before exiting
    meter_provider.force_flush()?;

    Ok(())
}

#[derive(Debug, Default)]
struct BaggageService {
    requests: AtomicU32,
}

impl BaggageService {
    // Healthy for the first 30 requests, then down for 40, then healthy again.
    async fn get(&self, clock: &Clock, headers: HeaderMap) -> Result<Vec<String>, BaggageError> {
        let request = self.requests.fetch_add(1, Ordering::Relaxed);
        let context = breadcrumb::headers::extract(&headers).ok();
        let passenger = context
            .as_ref()
            .and_then(|context| context.baggage_item("passenger"))
            .unwrap_or("unknown")
            .to_owned();

        if (30..70).contains(&request) {
            // Half of the failures hang until the attempt times out.
            if fastrand::bool() {
                clock.delay(Duration::from_secs(5)).await;
            }

            return Err(BaggageError::Unavailable);
        }

        clock.delay(Duration::from_millis(20)).await;

        Ok(vec![format!("bag-{passenger}-1"), format!("bag-{passenger}-2")])
    }
}

fn configure_telemetry() -> SdkMeterProvider {
    // Set up tracing subscriber for logs to console
    tracing_subscriber::registry().with(tracing_subscriber::fmt::layer()).init();

    SdkMeterProvider::builder()
        .with_periodic_exporter(MetricExporter::default())
        .build()
}
