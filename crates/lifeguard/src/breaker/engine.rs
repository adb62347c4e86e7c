// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tick::Clock;

use super::window::RollingWindow;
use super::{AttemptOutcome, AttemptRecord, CircuitState};
use crate::telemetry::{self, Strategy, Telemetry};
use crate::{CallId, PolicySpec};

/// The breaker rejected an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    /// Time left until the breaker lets a probe through.
    ///
    /// Zero when the breaker is half-open and waiting for a probe in flight.
    pub retry_after: Duration,
}

/// A state change caused by admitting or recording an attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub enum Transition {
    /// The state did not change.
    Unchanged,

    /// The breaker tripped from closed to open.
    Opened {
        /// Failure ratio of the window when the breaker tripped.
        failure_ratio: f64,
        /// Number of attempts in the window when the breaker tripped.
        volume: usize,
    },

    /// A failed probe sent the breaker from half-open back to open.
    Reopened,

    /// Enough probes succeeded and the breaker closed.
    Closed,

    /// The open duration elapsed and the breaker admitted a probe.
    HalfOpened,
}

/// Point-in-time view of a breaker, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct BreakerSnapshot {
    /// Current state.
    ///
    /// An open breaker reports [`CircuitState::Open`] until the next attempt moves it to
    /// half-open, even after its open duration has elapsed.
    pub state: CircuitState,
    /// Number of attempts in the rolling window. Zero unless closed.
    pub window_len: usize,
    /// Failure ratio of the rolling window. Zero unless closed.
    pub failure_ratio: f64,
    /// Consecutive successful probes. Zero unless half-open.
    pub consecutive_successes: u32,
}

/// Circuit breaker for a single call identifier.
///
/// All state reads, transitions and window updates for one breaker happen under one lock,
/// so transitions are linearizable. Breakers for different call identifiers never contend.
#[derive(Debug)]
pub struct CircuitBreaker {
    call_id: CallId,
    state: Mutex<State>,
    clock: Clock,
    telemetry: Telemetry,
}

impl CircuitBreaker {
    pub(crate) fn new(call_id: CallId, clock: Clock, telemetry: Telemetry) -> Self {
        Self {
            call_id,
            state: Mutex::new(State::closed()),
            clock,
            telemetry,
        }
    }

    /// The call identifier this breaker guards.
    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Asks for permission to run one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] if the breaker is open, or half-open with a probe already in flight.
    pub fn try_acquire(self: &Arc<Self>, spec: &PolicySpec) -> Result<BreakerPermit, Rejected> {
        let now = self.clock.instant();

        // Clock reads stay outside the lock.
        let admission = self.state.lock().enter(now);

        match admission {
            Admission::Accepted { probe, transition } => {
                if transition == Transition::HalfOpened {
                    self.report(transition);
                }

                Ok(BreakerPermit {
                    breaker: Arc::clone(self),
                    spec: *spec,
                    probe,
                    transition,
                    settled: false,
                })
            }
            Admission::Rejected(rejected) => {
                self.telemetry
                    .count(&self.call_id, Strategy::CircuitBreaker, telemetry::CIRCUIT_REJECTED);

                tracing::event!(
                    name: "lifeguard.circuit_breaker.rejected",
                    tracing::Level::WARN,
                    lifeguard.call_id = %self.call_id,
                    circuit_breaker.state = CircuitState::Open.as_str(),
                    circuit_breaker.retry_after = rejected.retry_after.as_secs_f32(),
                );

                Err(rejected)
            }
        }
    }

    /// Current state of the breaker.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit_state()
    }

    /// Current state together with window statistics.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();

        match &*state {
            State::Closed { window } => BreakerSnapshot {
                state: CircuitState::Closed,
                window_len: window.len(),
                failure_ratio: window.failure_ratio(),
                consecutive_successes: 0,
            },
            State::Open { .. } => BreakerSnapshot {
                state: CircuitState::Open,
                window_len: 0,
                failure_ratio: 0.0,
                consecutive_successes: 0,
            },
            State::HalfOpen {
                consecutive_successes, ..
            } => BreakerSnapshot {
                state: CircuitState::HalfOpen,
                window_len: 0,
                failure_ratio: 0.0,
                consecutive_successes: *consecutive_successes,
            },
        }
    }

    fn record(&self, outcome: AttemptOutcome, latency: Duration, probe: bool, spec: &PolicySpec) -> Transition {
        let record = AttemptRecord {
            timestamp: self.clock.instant(),
            outcome,
            latency,
        };

        let transition = self.state.lock().exit(record, probe, spec);
        self.report(transition);
        transition
    }

    fn release_probe(&self) {
        if let State::HalfOpen { probe_in_flight, .. } = &mut *self.state.lock() {
            *probe_in_flight = false;
        }
    }

    fn report(&self, transition: Transition) {
        match transition {
            Transition::Unchanged => {}
            Transition::Opened { failure_ratio, volume } => {
                self.telemetry
                    .count(&self.call_id, Strategy::CircuitBreaker, telemetry::CIRCUIT_OPENED);

                tracing::event!(
                    name: "lifeguard.circuit_breaker.opened",
                    tracing::Level::WARN,
                    lifeguard.call_id = %self.call_id,
                    circuit_breaker.state = CircuitState::Open.as_str(),
                    circuit_breaker.failure_ratio = failure_ratio,
                    circuit_breaker.volume = volume,
                );
            }
            Transition::Reopened => {
                self.telemetry
                    .count(&self.call_id, Strategy::CircuitBreaker, telemetry::CIRCUIT_REOPENED);

                tracing::event!(
                    name: "lifeguard.circuit_breaker.reopened",
                    tracing::Level::WARN,
                    lifeguard.call_id = %self.call_id,
                    circuit_breaker.state = CircuitState::Open.as_str(),
                );
            }
            Transition::Closed => {
                self.telemetry
                    .count(&self.call_id, Strategy::CircuitBreaker, telemetry::CIRCUIT_CLOSED);

                tracing::event!(
                    name: "lifeguard.circuit_breaker.closed",
                    tracing::Level::INFO,
                    lifeguard.call_id = %self.call_id,
                    circuit_breaker.state = CircuitState::Closed.as_str(),
                );
            }
            Transition::HalfOpened => {
                self.telemetry
                    .count(&self.call_id, Strategy::CircuitBreaker, telemetry::CIRCUIT_HALF_OPENED);

                tracing::event!(
                    name: "lifeguard.circuit_breaker.half_opened",
                    tracing::Level::INFO,
                    lifeguard.call_id = %self.call_id,
                    circuit_breaker.state = CircuitState::HalfOpen.as_str(),
                );
            }
        }
    }
}

/// Permission to run one attempt.
///
/// Report the attempt's outcome with [`record`][Self::record]. A permit dropped without
/// recording, for example because the attempt was cancelled, records nothing and frees
/// the half-open probe slot it may hold.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    spec: PolicySpec,
    probe: bool,
    transition: Transition,
    settled: bool,
}

impl BreakerPermit {
    /// Returns `true` if this permit is the half-open probe.
    #[must_use]
    pub const fn is_probe(&self) -> bool {
        self.probe
    }

    /// The transition that happened when this permit was granted.
    #[must_use]
    pub const fn admission(&self) -> Transition {
        self.transition
    }

    /// Records the outcome of the attempt and returns the resulting transition.
    pub fn record(mut self, outcome: AttemptOutcome, latency: Duration) -> Transition {
        self.settled = true;
        self.breaker.record(outcome, latency, self.probe, &self.spec)
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

enum Admission {
    Accepted { probe: bool, transition: Transition },
    Rejected(Rejected),
}

#[derive(Debug)]
enum State {
    Closed {
        window: RollingWindow,
    },
    Open {
        opened_at: Instant,
        open_duration: Duration,
    },
    HalfOpen {
        probe_in_flight: bool,
        consecutive_successes: u32,
    },
}

impl State {
    fn closed() -> Self {
        Self::Closed {
            window: RollingWindow::default(),
        }
    }

    fn open(now: Instant, spec: &PolicySpec) -> Self {
        Self::Open {
            opened_at: now,
            open_duration: spec.open_duration(),
        }
    }

    const fn circuit_state(&self) -> CircuitState {
        match self {
            Self::Closed { .. } => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn enter(&mut self, now: Instant) -> Admission {
        match self {
            Self::Closed { .. } => Admission::Accepted {
                probe: false,
                transition: Transition::Unchanged,
            },
            Self::Open {
                opened_at,
                open_duration,
            } => {
                let elapsed = now.saturating_duration_since(*opened_at);

                if elapsed >= *open_duration {
                    *self = Self::HalfOpen {
                        probe_in_flight: true,
                        consecutive_successes: 0,
                    };

                    Admission::Accepted {
                        probe: true,
                        transition: Transition::HalfOpened,
                    }
                } else {
                    Admission::Rejected(Rejected {
                        retry_after: open_duration.saturating_sub(elapsed),
                    })
                }
            }
            Self::HalfOpen { probe_in_flight, .. } => {
                if *probe_in_flight {
                    Admission::Rejected(Rejected {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    *probe_in_flight = true;
                    Admission::Accepted {
                        probe: true,
                        transition: Transition::Unchanged,
                    }
                }
            }
        }
    }

    fn exit(&mut self, record: AttemptRecord, probe: bool, spec: &PolicySpec) -> Transition {
        let now = record.timestamp;

        match self {
            Self::Closed { window } => {
                window.push(record, spec.rolling_window() as usize);

                let volume = window.len();
                let failure_ratio = window.failure_ratio();

                if volume >= spec.request_volume_threshold() as usize && failure_ratio >= spec.failure_ratio() {
                    *self = Self::open(now, spec);
                    Transition::Opened { failure_ratio, volume }
                } else {
                    Transition::Unchanged
                }
            }
            // Results that were in flight when the breaker opened are dropped.
            Self::Open { .. } => Transition::Unchanged,
            Self::HalfOpen {
                probe_in_flight,
                consecutive_successes,
            } => {
                if !probe {
                    return Transition::Unchanged;
                }

                if record.outcome.is_failure() {
                    *self = Self::open(now, spec);
                    return Transition::Reopened;
                }

                *probe_in_flight = false;
                *consecutive_successes = consecutive_successes.saturating_add(1);

                if *consecutive_successes >= spec.success_threshold() {
                    *self = Self::closed();
                    Transition::Closed
                } else {
                    Transition::Unchanged
                }
            }
        }
    }
}
