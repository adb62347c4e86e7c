// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Short-circuiting calls to dependencies that report themselves as not ready.
//!
//! The [`PolicyExecutor`][crate::PolicyExecutor] consults a [`Readiness`] source before
//! every attempt. A dependency that is not ready fails the call with
//! [`ExecuteError::NotReady`][crate::ExecuteError::NotReady] without running the operation
//! or touching its circuit breaker.

use std::fmt::{self, Debug};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::future::{BoxFuture, select};
use tick::{Clock, PeriodicTimer};

use crate::CallId;
use crate::timeout::with_timeout;

/// Source of the boolean "ready" signal for dependencies.
pub trait Readiness: Debug + Send + Sync {
    /// Returns `true` if calls for `call_id` should be attempted.
    fn is_ready(&self, call_id: &CallId) -> bool;
}

/// Readiness flags keyed by call identifier.
///
/// Call identifiers that were never set are considered ready.
#[derive(Debug, Default)]
pub struct ReadinessRegistry {
    flags: DashMap<CallId, bool>,
}

impl ReadinessRegistry {
    /// Creates a registry in which every dependency is ready.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the dependency behind `call_id` as ready or not ready.
    pub fn set_ready(&self, call_id: impl Into<CallId>, ready: bool) {
        let call_id = call_id.into();
        let previous = self.flags.insert(call_id.clone(), ready);

        if previous.unwrap_or(true) != ready {
            tracing::event!(
                name: "lifeguard.readiness.changed",
                tracing::Level::INFO,
                lifeguard.call_id = %call_id,
                readiness.ready = ready,
            );
        }
    }
}

impl Readiness for ReadinessRegistry {
    fn is_ready(&self, call_id: &CallId) -> bool {
        self.flags.get(call_id).is_none_or(|ready| *ready)
    }
}

type Probe = Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Periodically probes dependencies and updates a [`ReadinessRegistry`].
///
/// A probe that returns `false` or does not finish within the probe timeout marks its
/// dependency as not ready until a later probe succeeds.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use lifeguard::{CallId, Readiness, ReadinessMonitor, ReadinessRegistry};
/// use tick::Clock;
///
/// # async fn example(clock: Clock) {
/// let registry = Arc::new(ReadinessRegistry::new());
///
/// let monitor = ReadinessMonitor::new(Arc::clone(&registry), &clock)
///     .interval(Duration::from_secs(10))
///     .probe("baggage.get", || async { true });
///
/// monitor.check_all().await;
/// assert!(registry.is_ready(&CallId::from("baggage.get")));
/// # }
/// ```
pub struct ReadinessMonitor {
    registry: Arc<ReadinessRegistry>,
    clock: Clock,
    interval: Duration,
    probe_timeout: Duration,
    probes: Vec<(CallId, Probe)>,
}

impl Debug for ReadinessMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessMonitor")
            .field("registry", &self.registry)
            .field("interval", &self.interval)
            .field("probe_timeout", &self.probe_timeout)
            .field("probes", &self.probes.iter().map(|(id, _)| id).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ReadinessMonitor {
    /// Creates a monitor that probes every 10 seconds with a 1 second probe timeout.
    #[must_use]
    pub fn new(registry: Arc<ReadinessRegistry>, clock: &Clock) -> Self {
        Self {
            registry,
            clock: clock.clone(),
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(1),
            probes: Vec::new(),
        }
    }

    /// Sets the time between probe rounds.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets how long a single probe may take.
    #[must_use]
    pub const fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Adds a probe for the dependency behind `call_id`.
    #[must_use]
    pub fn probe<F, Fut>(mut self, call_id: impl Into<CallId>, probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let probe: Probe = Box::new(move || Box::pin(probe()));
        self.probes.push((call_id.into(), probe));
        self
    }

    /// Runs every probe once and records the results.
    pub async fn check_all(&self) {
        for (call_id, probe) in &self.probes {
            let ready = match with_timeout(&self.clock, self.probe_timeout, probe()).await {
                Some(true) => true,
                Some(false) => {
                    tracing::event!(
                        name: "lifeguard.readiness.probe_failed",
                        tracing::Level::WARN,
                        lifeguard.call_id = %call_id,
                    );
                    false
                }
                None => {
                    tracing::event!(
                        name: "lifeguard.readiness.probe_timeout",
                        tracing::Level::WARN,
                        lifeguard.call_id = %call_id,
                        readiness.timeout = self.probe_timeout.as_secs_f32(),
                    );
                    false
                }
            };

            self.registry.set_ready(call_id.clone(), ready);
        }
    }

    /// Probes immediately and then once per interval until `shutdown` completes.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        tracing::event!(
            name: "lifeguard.readiness.started",
            tracing::Level::INFO,
            readiness.interval = self.interval.as_secs_f32(),
            readiness.probes = self.probes.len(),
        );

        let rounds = async {
            let mut timer = PeriodicTimer::new(&self.clock, self.interval);

            loop {
                self.check_all().await;
                timer.next().await;
            }
        };

        // The probe rounds never finish on their own.
        let _ = select(pin!(shutdown), pin!(rounds)).await;

        tracing::event!(name: "lifeguard.readiness.stopped", tracing::Level::INFO, readiness.probes = self.probes.len());
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tick::ClockControl;

    use super::*;

    static_assertions::assert_impl_all!(ReadinessRegistry: Send, Sync);
    static_assertions::assert_impl_all!(ReadinessMonitor: Send, Sync);

    #[test]
    fn unknown_ids_are_ready() {
        assert!(ReadinessRegistry::new().is_ready(&CallId::from("anything")));
    }

    #[test]
    fn set_ready_toggles() {
        let registry = ReadinessRegistry::new();
        let id = CallId::from("baggage.get");

        registry.set_ready(id.clone(), false);
        assert!(!registry.is_ready(&id));

        registry.set_ready(id.clone(), true);
        assert!(registry.is_ready(&id));
    }

    #[tokio::test]
    async fn check_all_records_probe_results() {
        let clock = ClockControl::new().auto_advance_timers(true).to_clock();
        let registry = Arc::new(ReadinessRegistry::new());
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&healthy);

        let monitor = ReadinessMonitor::new(Arc::clone(&registry), &clock).probe("baggage.get", move || {
            let healthy = flag.load(Ordering::Relaxed);
            async move { healthy }
        });
        let id = CallId::from("baggage.get");

        monitor.check_all().await;
        assert!(!registry.is_ready(&id));

        healthy.store(true, Ordering::Relaxed);
        monitor.check_all().await;
        assert!(registry.is_ready(&id));
    }

    #[tokio::test]
    async fn hanging_probe_is_not_ready() {
        let clock = ClockControl::new().auto_advance_timers(true).to_clock();
        let registry = Arc::new(ReadinessRegistry::new());

        let monitor = ReadinessMonitor::new(Arc::clone(&registry), &clock)
            .probe_timeout(Duration::from_millis(100))
            .probe("passenger.get", || std::future::pending::<bool>());

        monitor.check_all().await;

        assert!(!registry.is_ready(&CallId::from("passenger.get")));
    }

    #[test]
    fn debug_lists_probed_ids() {
        let monitor = ReadinessMonitor::new(Arc::new(ReadinessRegistry::new()), &Clock::new_frozen())
            .probe("a", || async { true });

        assert!(format!("{monitor:?}").contains("\"a\""));
    }
}
