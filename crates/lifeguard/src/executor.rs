// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::{Duration, Instant};

use breadcrumb::{Span, SpanOutcome, TraceContext, TracePropagator};
use http::HeaderMap;
use recoverable::{Recovery, RecoveryKind};
use tick::Clock;

use crate::breaker::{AttemptOutcome, CircuitBreakers};
use crate::readiness::Readiness;
use crate::telemetry::{FALLBACK, NOT_READY, RETRY, Strategy, TIMEOUT, Telemetry};
use crate::timeout::with_timeout;
use crate::{AttemptFailure, CallId, CircuitState, ExecuteError, PolicySpec, RetryScheduler};

/// What an operation receives for each attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    attempt: u32,
    trace: TraceContext,
    headers: HeaderMap,
}

impl AttemptContext {
    /// Zero-based index of this attempt. Zero is the initial call, one the first retry.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Trace context of the span covering this attempt.
    #[must_use]
    pub const fn trace(&self) -> &TraceContext {
        &self.trace
    }

    /// Propagation headers for [`trace`][Self::trace], ready to attach to an outgoing request.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Consumes the context and returns its propagation headers.
    #[must_use]
    pub fn into_headers(self) -> HeaderMap {
        self.headers
    }
}

/// What a fallback receives when it is invoked.
#[derive(Debug)]
pub struct FallbackArgs<E> {
    reason: ExecuteError<E>,
}

impl<E> FallbackArgs<E> {
    /// The failure that triggered the fallback.
    #[must_use]
    pub const fn reason(&self) -> &ExecuteError<E> {
        &self.reason
    }

    /// Consumes the arguments and returns the failure that triggered the fallback.
    #[must_use]
    pub fn into_reason(self) -> ExecuteError<E> {
        self.reason
    }
}

/// Runs calls to dependencies under a [`PolicySpec`].
///
/// For every attempt the executor consults the readiness source, asks the call's circuit
/// breaker for a permit, derives a child span of the caller's trace context, and runs the
/// operation bounded by the policy timeout. Failed attempts are retried according to the
/// policy until it is exhausted, at which point an optional fallback takes over.
///
/// Circuit breakers are kept per [`CallId`] and shared by all clones of the executor.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use lifeguard::{PolicyExecutor, PolicySpec, Recovery, RecoveryInfo};
/// use breadcrumb::TraceContext;
/// use tick::Clock;
///
/// #[derive(Debug)]
/// struct Unavailable;
///
/// impl Recovery for Unavailable {
///     fn recovery(&self) -> RecoveryInfo {
///         RecoveryInfo::retry()
///     }
/// }
///
/// # async fn example(clock: Clock) {
/// let executor = PolicyExecutor::new(&clock);
/// let spec = PolicySpec::default()
///     .with_timeout(Duration::from_millis(250))
///     .with_max_retries(2);
///
/// let bags = executor
///     .execute("baggage.get", &spec, &TraceContext::new_root(), |attempt| async move {
///         // Send `attempt.headers()` along with the request.
///         Ok::<_, Unavailable>(vec!["bag-1"])
///     })
///     .await;
///
/// assert_eq!(bags.unwrap(), vec!["bag-1"]);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PolicyExecutor {
    clock: Clock,
    breakers: Arc<CircuitBreakers>,
    scheduler: RetryScheduler,
    propagator: TracePropagator,
    readiness: Option<Arc<dyn Readiness>>,
    telemetry: Telemetry,
}

impl PolicyExecutor {
    /// Creates an executor that discards finished spans and treats every dependency as ready.
    #[must_use]
    pub fn new(clock: &Clock) -> Self {
        let telemetry = Telemetry::default();

        Self {
            clock: clock.clone(),
            breakers: Arc::new(CircuitBreakers::new(clock.clone(), telemetry.clone())),
            scheduler: RetryScheduler::new(),
            propagator: TracePropagator::new(clock),
            readiness: None,
            telemetry,
        }
    }

    /// Sets the propagator used to create and report attempt spans.
    #[must_use]
    pub fn propagator(self, propagator: TracePropagator) -> Self {
        Self { propagator, ..self }
    }

    /// Sets the source consulted before every attempt.
    #[must_use]
    pub fn readiness(self, readiness: Arc<dyn Readiness>) -> Self {
        Self {
            readiness: Some(readiness),
            ..self
        }
    }

    /// Sets the scheduler that decides on retries and their delays.
    #[must_use]
    pub fn scheduler(self, scheduler: RetryScheduler) -> Self {
        Self { scheduler, ..self }
    }

    /// Reports resilience events to a `resilience.event` counter created from `provider`.
    ///
    /// Breakers created before this call are discarded.
    #[cfg(any(feature = "metrics", test))]
    #[must_use]
    pub fn meter_provider(self, provider: &dyn opentelemetry::metrics::MeterProvider) -> Self {
        let telemetry = Telemetry::with_meter_provider(provider);

        Self {
            breakers: Arc::new(CircuitBreakers::new(self.clock.clone(), telemetry.clone())),
            telemetry,
            ..self
        }
    }

    /// The circuit breakers of all calls made through this executor.
    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Runs `operation` under `spec`.
    ///
    /// Every attempt is reported as a child span of `parent`. Retries are siblings of the
    /// first attempt and share its trace id.
    ///
    /// Dropping the returned future cancels the in-flight attempt and any pending retry.
    /// The cancelled attempt is reported with [`SpanOutcome::Cancelled`] and is not
    /// recorded by the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecuteError`] when the call could not be completed. See its variants
    /// for the possible reasons.
    pub async fn execute<T, E, Op, Fut>(
        &self,
        call_id: impl Into<CallId>,
        spec: &PolicySpec,
        parent: &TraceContext,
        operation: Op,
    ) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Recovery,
    {
        let call_id = call_id.into();
        self.run(&call_id, spec, parent, operation).await
    }

    /// Runs `operation` under `spec`, turning to `fallback` when the policy gives up.
    ///
    /// The fallback runs when retries are exhausted, when the circuit breaker rejects an
    /// attempt, or when the dependency is not ready. An error the operation marks as
    /// never recoverable, or an invalid policy, is returned as-is without running the fallback.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::Fallback`] if the fallback fails, or the operation's error if
    /// the fallback was not invoked.
    pub async fn execute_with_fallback<T, E, Op, Fut, Fb, FbFut>(
        &self,
        call_id: impl Into<CallId>,
        spec: &PolicySpec,
        parent: &TraceContext,
        operation: Op,
        fallback: Fb,
    ) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Fb: FnOnce(FallbackArgs<E>) -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
        E: Recovery,
    {
        let call_id = call_id.into();

        let reason = match self.run(&call_id, spec, parent, operation).await {
            Ok(output) => return Ok(output),
            Err(error) if !falls_back(&error) => return Err(error),
            Err(error) => error,
        };

        let attempts = reason.attempts();
        let state = reason.state();

        tracing::event!(
            name: "lifeguard.fallback",
            tracing::Level::WARN,
            lifeguard.call_id = %call_id,
            resilience.attempts = attempts,
            fallback.reason = %reason,
        );
        self.telemetry.count(&call_id, Strategy::Fallback, FALLBACK);

        fallback(FallbackArgs { reason })
            .await
            .map_err(|source| ExecuteError::Fallback {
                call_id,
                attempts,
                state,
                source,
            })
    }

    async fn run<T, E, Op, Fut>(
        &self,
        call_id: &CallId,
        spec: &PolicySpec,
        parent: &TraceContext,
        mut operation: Op,
    ) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Recovery,
    {
        let breaker = self.breakers.get(call_id);

        if let Err(source) = spec.validate() {
            tracing::event!(
                name: "lifeguard.invalid_policy",
                tracing::Level::ERROR,
                lifeguard.call_id = %call_id,
                policy.error = %source,
            );

            return Err(ExecuteError::InvalidPolicy {
                call_id: call_id.clone(),
                attempts: 0,
                state: breaker.state(),
                source,
            });
        }

        let mut attempts = 0_u32;
        let mut last = None;

        loop {
            let span = self.propagator.start_span(parent, call_id.to_cow()).with_attempt(attempts);

            if self.readiness.as_ref().is_some_and(|readiness| !readiness.is_ready(call_id)) {
                self.propagator.finish_span(span, SpanOutcome::Rejected, Duration::ZERO);

                tracing::event!(
                    name: "lifeguard.not_ready",
                    tracing::Level::WARN,
                    lifeguard.call_id = %call_id,
                    resilience.attempts = attempts,
                );
                self.telemetry.count(call_id, Strategy::Readiness, NOT_READY);

                return Err(ExecuteError::NotReady {
                    call_id: call_id.clone(),
                    attempts,
                    state: breaker.state(),
                    last,
                });
            }

            let permit = match breaker.try_acquire(spec) {
                Ok(permit) => permit,
                Err(rejected) => {
                    self.propagator.finish_span(span, SpanOutcome::Rejected, Duration::ZERO);

                    return Err(ExecuteError::CircuitOpen {
                        call_id: call_id.clone(),
                        attempts,
                        state: breaker.state(),
                        retry_after: rejected.retry_after,
                        last,
                    });
                }
            };

            let context = AttemptContext {
                attempt: attempts,
                trace: span.context().clone(),
                headers: self.propagator.inject(span.context()),
            };
            let guard = AttemptGuard {
                propagator: &self.propagator,
                clock: &self.clock,
                span: Some(span),
                started: self.clock.instant(),
            };

            attempts = attempts.saturating_add(1);
            let result = with_timeout(&self.clock, spec.timeout(), operation(context)).await;
            let latency = guard.elapsed();

            let failure = match result {
                Some(Ok(output)) => {
                    permit.record(AttemptOutcome::Success, latency);
                    guard.finish(SpanOutcome::Success, latency);
                    return Ok(output);
                }
                Some(Err(error)) => {
                    permit.record(AttemptOutcome::Failure, latency);
                    guard.finish(SpanOutcome::Failure, latency);
                    AttemptFailure::Remote(error)
                }
                None => {
                    permit.record(AttemptOutcome::Timeout, latency);
                    guard.finish(SpanOutcome::Timeout, latency);

                    tracing::event!(
                        name: "lifeguard.timeout",
                        tracing::Level::WARN,
                        lifeguard.call_id = %call_id,
                        resilience.attempt.index = attempts - 1,
                        resilience.timeout = spec.timeout().as_secs_f32(),
                    );
                    self.telemetry.count(call_id, Strategy::Timeout, TIMEOUT);

                    AttemptFailure::TimedOut { timeout: spec.timeout() }
                }
            };

            let decision = self.scheduler.should_retry(attempts - 1, spec, &failure);

            if !decision.retry {
                let state = breaker.state();

                // Without retries the caller sees the failure itself rather than an exhaustion.
                return Err(if spec.max_retries() == 0 || !RetryScheduler::is_transient(&failure) {
                    terminal(call_id.clone(), attempts, state, failure)
                } else {
                    ExecuteError::RetryExhausted {
                        call_id: call_id.clone(),
                        attempts,
                        state,
                        last: failure,
                    }
                });
            }

            tracing::event!(
                name: "lifeguard.retry",
                tracing::Level::WARN,
                lifeguard.call_id = %call_id,
                resilience.attempt.index = attempts - 1,
                resilience.retry.delay = decision.delay.as_secs_f32(),
            );
            self.telemetry.count(call_id, Strategy::Retry, RETRY);
            last = Some(failure);

            if !decision.delay.is_zero() {
                self.clock.delay(decision.delay).await;
            }
        }
    }
}

fn terminal<E>(call_id: CallId, attempts: u32, state: CircuitState, failure: AttemptFailure<E>) -> ExecuteError<E> {
    match failure {
        AttemptFailure::TimedOut { timeout } => ExecuteError::Timeout {
            call_id,
            timeout,
            attempts,
            state,
        },
        AttemptFailure::Remote(source) => ExecuteError::Remote {
            call_id,
            attempts,
            state,
            source,
        },
    }
}

fn falls_back<E: Recovery>(error: &ExecuteError<E>) -> bool {
    match error {
        ExecuteError::Remote { source, .. } => source.recovery().kind() != RecoveryKind::Never,
        ExecuteError::Fallback { .. } | ExecuteError::InvalidPolicy { .. } => false,
        _ => true,
    }
}

/// Reports the attempt span when the attempt ends, including when the caller drops it.
struct AttemptGuard<'a> {
    propagator: &'a TracePropagator,
    clock: &'a Clock,
    span: Option<Span>,
    started: Instant,
}

impl AttemptGuard<'_> {
    fn elapsed(&self) -> Duration {
        self.clock.instant().saturating_duration_since(self.started)
    }

    fn finish(mut self, outcome: SpanOutcome, latency: Duration) {
        if let Some(span) = self.span.take() {
            self.propagator.finish_span(span, outcome, latency);
        }
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            self.propagator.finish_span(span, SpanOutcome::Cancelled, self.elapsed());
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use breadcrumb::BufferedExporter;
    use futures_util::FutureExt;
    use opentelemetry_sdk::metrics::{InMemoryMetricExporter, SdkMeterProvider};
    use recoverable::RecoveryInfo;
    use tick::ClockControl;

    use super::*;
    use crate::{PolicyError, ReadinessRegistry};
    use crate::rnd::Rnd;

    #[derive(Debug, PartialEq, Eq)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl Recovery for TestError {
        fn recovery(&self) -> RecoveryInfo {
            match self {
                Self::Transient => RecoveryInfo::retry(),
                Self::Fatal => RecoveryInfo::never(),
            }
        }
    }

    static_assertions::assert_impl_all!(PolicyExecutor: Send, Sync, Clone);
    static_assertions::assert_impl_all!(AttemptContext: Send, Sync);

    fn clock() -> Clock {
        ClockControl::new().auto_advance_timers(true).to_clock()
    }

    fn spec() -> PolicySpec {
        PolicySpec::default()
            .with_timeout(Duration::from_millis(100))
            .with_max_retries(2)
            .with_retry_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn attempt_context_carries_headers_of_its_span() {
        let clock = clock();
        let executor = PolicyExecutor::new(&clock);
        let parent = TraceContext::new_root();

        let context = executor
            .execute("a", &spec(), &parent, |ctx| async move { Ok::<_, TestError>(ctx) })
            .await
            .unwrap();

        assert_eq!(context.attempt(), 0);
        assert_eq!(context.trace().trace_id(), parent.trace_id());
        assert_eq!(context.trace().parent_span_id(), Some(parent.span_id()));

        let extracted = breadcrumb::headers::extract(context.headers()).unwrap();
        assert_eq!(extracted.span_id(), context.trace().span_id());
        assert!(!context.into_headers().is_empty());
    }

    #[tokio::test]
    async fn attempt_indices_increase() {
        let clock = clock();
        let executor = PolicyExecutor::new(&clock);
        let seen = parking_lot::Mutex::new(Vec::new());

        let result = executor
            .execute("a", &spec(), &TraceContext::new_root(), |ctx| {
                seen.lock().push(ctx.attempt());
                async { Err::<(), _>(TestError::Transient) }
            })
            .await;

        assert!(matches!(result, Err(ExecuteError::RetryExhausted { attempts: 3, .. })));
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn no_retries_surfaces_timeout() {
        let clock = clock();
        let executor = PolicyExecutor::new(&clock);

        let error = executor
            .execute("a", &spec().with_max_retries(0), &TraceContext::new_root(), |_| {
                std::future::pending::<Result<(), TestError>>()
            })
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            ExecuteError::Timeout {
                attempts: 1,
                state: CircuitState::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn no_retries_surfaces_remote_error() {
        let clock = clock();
        let executor = PolicyExecutor::new(&clock);

        let error = executor
            .execute("a", &spec().with_max_retries(0), &TraceContext::new_root(), |_| async {
                Err::<(), _>(TestError::Transient)
            })
            .await
            .unwrap_err();

        assert_eq!(error.remote_error(), Some(&TestError::Transient));
        assert!(matches!(error, ExecuteError::Remote { attempts: 1, .. }));
        assert!(falls_back(&error));
    }

    #[tokio::test]
    async fn fatal_error_skips_fallback() {
        let clock = clock();
        let executor = PolicyExecutor::new(&clock);
        let fallbacks = AtomicU32::new(0);

        let error = executor
            .execute_with_fallback(
                "a",
                &spec(),
                &TraceContext::new_root(),
                |_| async { Err::<u32, _>(TestError::Fatal) },
                |_| {
                    fallbacks.fetch_add(1, Ordering::Relaxed);
                    async { Ok(0) }
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(error, ExecuteError::Remote { attempts: 1, .. }));
        assert_eq!(fallbacks.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn invalid_policy_is_rejected_before_any_attempt() {
        let clock = clock();
        let executor = PolicyExecutor::new(&clock);
        let calls = AtomicU32::new(0);
        let fallbacks = AtomicU32::new(0);

        let error = executor
            .execute_with_fallback(
                "a",
                &spec().with_success_threshold(0),
                &TraceContext::new_root(),
                |_| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    async { Ok::<u32, TestError>(1) }
                },
                |_| {
                    fallbacks.fetch_add(1, Ordering::Relaxed);
                    async { Ok(0) }
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            ExecuteError::InvalidPolicy {
                attempts: 0,
                source: PolicyError::SuccessThreshold,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(fallbacks.load(Ordering::Relaxed), 0);

        let error = executor
            .execute("a", &spec().with_failure_ratio(f64::NAN), &TraceContext::new_root(), |_| async {
                Ok::<u32, TestError>(1)
            })
            .await
            .unwrap_err();
        assert!(matches!(error, ExecuteError::InvalidPolicy { .. }));
    }

    #[tokio::test]
    async fn readiness_loss_keeps_previous_failure() {
        let clock = clock();
        let registry = Arc::new(ReadinessRegistry::new());
        let executor = PolicyExecutor::new(&clock).readiness(Arc::clone(&registry) as Arc<dyn Readiness>);

        let error = executor
            .execute("a", &spec(), &TraceContext::new_root(), |_| {
                registry.set_ready("a", false);
                async { Err::<(), _>(TestError::Transient) }
            })
            .await
            .unwrap_err();

        assert!(matches!(error, ExecuteError::NotReady { attempts: 1, .. }));
        assert_eq!(error.remote_error(), Some(&TestError::Transient));
    }

    #[tokio::test]
    async fn failing_fallback_is_reported() {
        let clock = clock();
        let executor = PolicyExecutor::new(&clock);

        let error = executor
            .execute_with_fallback(
                "a",
                &spec(),
                &TraceContext::new_root(),
                |_| async { Err::<u32, _>(TestError::Transient) },
                |args| {
                    assert!(matches!(args.reason(), ExecuteError::RetryExhausted { .. }));
                    async { Err(TestError::Fatal) }
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            ExecuteError::Fallback {
                attempts: 3,
                source: TestError::Fatal,
                ..
            }
        ));
        assert!(!falls_back(&error));
    }

    #[tokio::test]
    async fn not_ready_short_circuits() {
        let clock = clock();
        let registry = Arc::new(ReadinessRegistry::new());
        registry.set_ready("a", false);

        let exporter = Arc::new(BufferedExporter::new(8));
        let executor = PolicyExecutor::new(&clock)
            .readiness(registry)
            .propagator(TracePropagator::new(&clock).exporter(exporter.clone()));
        let calls = AtomicU32::new(0);

        let error = executor
            .execute("a", &spec(), &TraceContext::new_root(), |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Ok::<_, TestError>(()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(error, ExecuteError::NotReady { attempts: 0, .. }));
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        let spans = exporter.drain();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].outcome, SpanOutcome::Rejected);
    }

    #[tokio::test]
    async fn retry_delays_follow_scheduler() {
        let clock = clock();
        let executor = PolicyExecutor::new(&clock).scheduler(RetryScheduler::with_rnd(Rnd::Fixed(1.0)));
        let spec = spec().with_jitter(true);
        let start = clock.instant();

        let _ = executor
            .execute("a", &spec, &TraceContext::new_root(), |_| async { Err::<(), _>(TestError::Transient) })
            .await;

        // Two retries, each jittered to 1.25 times the 10ms delay.
        let elapsed = clock.instant().duration_since(start);
        assert!(elapsed > Duration::from_millis(24), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(26), "{elapsed:?}");
    }

    #[tokio::test]
    async fn cancelled_attempt_reports_span_and_records_nothing() {
        let clock = clock();
        let exporter = Arc::new(BufferedExporter::new(8));
        let executor =
            PolicyExecutor::new(&clock).propagator(TracePropagator::new(&clock).exporter(exporter.clone()));

        let spec = spec();
        let root = TraceContext::new_root();

        let call = executor.execute("a", &spec, &root, |_| std::future::pending::<Result<(), TestError>>());
        // Polls the attempt once, then drops it mid-flight.
        assert!(call.now_or_never().is_none());

        let spans = exporter.drain();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].outcome, SpanOutcome::Cancelled);

        let snapshot = executor.breakers().get(&CallId::from("a")).snapshot();
        assert_eq!(snapshot.window_len, 0);
    }

    #[tokio::test]
    async fn events_are_counted() {
        let clock = clock();
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder().with_periodic_exporter(exporter.clone()).build();
        let executor = PolicyExecutor::new(&clock).meter_provider(&provider);

        let _ = executor
            .execute_with_fallback(
                "baggage.get",
                &spec(),
                &TraceContext::new_root(),
                |_| async { Err::<u32, _>(TestError::Transient) },
                |_| async { Ok(0) },
            )
            .await;

        provider.force_flush().unwrap();
        let metrics = format!("{:?}", exporter.get_finished_metrics().unwrap());

        assert!(metrics.contains("baggage.get"));
        assert!(metrics.contains("retry"));
        assert!(metrics.contains("fallback"));
    }
}
