// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Timeout, retry, circuit breaker and fallback policies for calls between services.
//!
//! Every call to a dependency is made through a [`PolicyExecutor`], named by a stable
//! [`CallId`] and governed by an explicit [`PolicySpec`]. The executor composes the
//! policies in a fixed order for each attempt:
//!
//! 1. The [`Readiness`] source may short-circuit a dependency that is known to be down.
//! 2. The call's [circuit breaker][breaker] may reject the attempt without running it.
//! 3. The operation runs under the policy timeout, inside a child span of the caller's
//!    [`TraceContext`][breadcrumb::TraceContext].
//! 4. The outcome is recorded by the breaker. Transient failures are retried after a
//!    backoff delay until the policy is exhausted.
//! 5. An optional fallback produces the result once the policy gives up.
//!
//! # Classifying errors
//!
//! Operation errors implement [`Recovery`]. Timeouts are always transient. An error
//! whose [`RecoveryKind`] is [`Never`][RecoveryKind::Never] fails the call immediately,
//! without retries and without the fallback.
//!
//! # Configuration
//!
//! Policies are plain values. A [`PolicyRegistry`] maps call identifiers to policies and
//! can be loaded from JSON, so limits change without touching call sites:
//!
//! ```json
//! {
//!     "default": { "timeout": "1s", "max_retries": 3 },
//!     "calls": {
//!         "baggage.get": { "timeout": "250ms", "retry_delay": "500ms", "backoff": "exponential" }
//!     }
//! }
//! ```
//!
//! # Telemetry
//!
//! Breaker transitions, retries, timeouts, fallbacks and readiness short circuits are
//! logged as `tracing` events named `lifeguard.*`. With the `metrics` feature they are
//! also counted by an OpenTelemetry counter, see [`telemetry`]. Attempt spans are
//! reported to the [`SpanExporter`][breadcrumb::SpanExporter] of the executor's
//! [`TracePropagator`][breadcrumb::TracePropagator].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use breadcrumb::TraceContext;
//! use lifeguard::{ExecuteError, PolicyExecutor, PolicySpec, Recovery, RecoveryInfo};
//! use tick::Clock;
//!
//! #[derive(Debug)]
//! enum BaggageError {
//!     Unavailable,
//!     UnknownPassenger,
//! }
//!
//! impl Recovery for BaggageError {
//!     fn recovery(&self) -> RecoveryInfo {
//!         match self {
//!             Self::Unavailable => RecoveryInfo::retry(),
//!             Self::UnknownPassenger => RecoveryInfo::never(),
//!         }
//!     }
//! }
//!
//! # async fn example(clock: Clock) -> Result<(), ExecuteError<BaggageError>> {
//! let executor = PolicyExecutor::new(&clock);
//! let spec = PolicySpec::default()
//!     .with_timeout(Duration::from_millis(250))
//!     .with_max_retries(4)
//!     .with_retry_delay(Duration::from_millis(500));
//!
//! let bags = executor
//!     .execute_with_fallback(
//!         "baggage.get",
//!         &spec,
//!         &TraceContext::new_root(),
//!         |_attempt| async { Err(BaggageError::Unavailable) },
//!         |_args| async { Ok(Vec::<String>::new()) },
//!     )
//!     .await?;
//!
//! assert!(bags.is_empty());
//! # Ok(())
//! # }
//! ```

#[doc(inline)]
pub use recoverable::{Recovery, RecoveryInfo, RecoveryKind};

pub mod breaker;
mod call_id;
mod config;
mod error;
mod executor;
mod policy;
mod readiness;
mod retry;
mod rnd;
pub mod telemetry;
mod timeout;

pub use breaker::{CircuitBreakers, CircuitState};
pub use call_id::CallId;
pub use config::{ConfigError, PolicyConfig, PolicyRegistry};
pub use error::{AttemptFailure, ExecuteError};
pub use executor::{AttemptContext, FallbackArgs, PolicyExecutor};
pub use policy::{Backoff, PolicyError, PolicySpec};
pub use readiness::{Readiness, ReadinessMonitor, ReadinessRegistry};
pub use retry::{RetryDecision, RetryScheduler};
