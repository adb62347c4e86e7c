// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deciding whether and when to retry a failed attempt.

use std::time::Duration;

use recoverable::{Recovery, RecoveryKind};

use crate::rnd::Rnd;
use crate::{AttemptFailure, PolicySpec};

mod backoff;

/// Outcome of [`RetryScheduler::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether another attempt should be made.
    pub retry: bool,
    /// How long to wait before the next attempt. Zero when not retrying.
    pub delay: Duration,
}

impl RetryDecision {
    const STOP: Self = Self {
        retry: false,
        delay: Duration::ZERO,
    };
}

/// Decides whether a failed attempt is retried and how long to wait before retrying.
///
/// Only transient failures are retried: timeouts, and errors whose
/// [`Recovery`] classification is anything other than [`RecoveryKind::Never`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use lifeguard::{AttemptFailure, Backoff, PolicySpec, Recovery, RecoveryInfo, RetryScheduler};
///
/// #[derive(Debug)]
/// struct LookupError;
///
/// impl Recovery for LookupError {
///     fn recovery(&self) -> RecoveryInfo {
///         RecoveryInfo::retry()
///     }
/// }
///
/// let scheduler = RetryScheduler::new();
/// let spec = PolicySpec::default()
///     .with_max_retries(3)
///     .with_retry_delay(Duration::from_millis(100))
///     .with_backoff(Backoff::Exponential);
///
/// let timed_out = AttemptFailure::<LookupError>::TimedOut { timeout: spec.timeout() };
///
/// let decision = scheduler.should_retry(2, &spec, &timed_out);
/// assert!(decision.retry);
/// assert_eq!(decision.delay, Duration::from_millis(400));
///
/// let decision = scheduler.should_retry(3, &spec, &timed_out);
/// assert!(!decision.retry);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    rnd: Rnd,
}

impl RetryScheduler {
    /// Creates a scheduler that draws jitter from a process-wide random source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scheduler with reproducible jitter.
    ///
    /// Clones share one sequence.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rnd: Rnd::new_seeded(seed),
        }
    }

    #[cfg(test)]
    pub(crate) const fn with_rnd(rnd: Rnd) -> Self {
        Self { rnd }
    }

    /// Returns `true` if `failure` is worth retrying at all.
    #[must_use]
    pub fn is_transient<E: Recovery>(failure: &AttemptFailure<E>) -> bool {
        match failure {
            AttemptFailure::TimedOut { .. } => true,
            AttemptFailure::Remote(error) => error.recovery().kind() != RecoveryKind::Never,
        }
    }

    /// Decides whether to retry after `attempts_used` retries have already been made.
    ///
    /// The delay for retry `n` (zero-based) is derived from the policy's retry delay and
    /// backoff, capped by its maximum delay and jittered if enabled. Without a maximum delay
    /// the delay is capped at one day.
    #[must_use]
    pub fn should_retry<E: Recovery>(
        &self,
        attempts_used: u32,
        spec: &PolicySpec,
        failure: &AttemptFailure<E>,
    ) -> RetryDecision {
        if attempts_used >= spec.max_retries() || !Self::is_transient(failure) {
            return RetryDecision::STOP;
        }

        RetryDecision {
            retry: true,
            delay: self.delay(attempts_used, spec),
        }
    }

    fn delay(&self, retry: u32, spec: &PolicySpec) -> Duration {
        let delay = backoff::base_delay(spec.backoff(), spec.retry_delay(), retry);
        let delay = backoff::clamp_to_max(delay, spec.max_delay());

        if spec.jitter() {
            // Jitter may push a capped delay above the cap.
            backoff::clamp_to_max(backoff::apply_jitter(delay, &self.rnd), spec.max_delay())
        } else {
            delay
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use recoverable::RecoveryInfo;

    use super::*;
    use crate::Backoff;

    #[derive(Debug)]
    struct Failure(RecoveryInfo);

    impl Recovery for Failure {
        fn recovery(&self) -> RecoveryInfo {
            self.0.clone()
        }
    }

    fn spec() -> PolicySpec {
        PolicySpec::default()
            .with_max_retries(4)
            .with_retry_delay(Duration::from_millis(500))
    }

    fn timeout() -> AttemptFailure<Failure> {
        AttemptFailure::TimedOut {
            timeout: Duration::from_millis(250),
        }
    }

    #[test]
    fn timeouts_are_transient() {
        assert!(RetryScheduler::is_transient(&timeout()));
    }

    #[test]
    fn only_never_is_permanent() {
        assert!(RetryScheduler::is_transient(&AttemptFailure::Remote(Failure(RecoveryInfo::retry()))));
        assert!(RetryScheduler::is_transient(&AttemptFailure::Remote(Failure(RecoveryInfo::unknown()))));
        assert!(RetryScheduler::is_transient(&AttemptFailure::Remote(Failure(
            RecoveryInfo::unavailable()
        ))));
        assert!(!RetryScheduler::is_transient(&AttemptFailure::Remote(Failure(RecoveryInfo::never()))));
    }

    #[test]
    fn retries_until_budget_is_used() {
        let scheduler = RetryScheduler::new();

        for used in 0..4 {
            assert_eq!(
                scheduler.should_retry(used, &spec(), &timeout()),
                RetryDecision {
                    retry: true,
                    delay: Duration::from_millis(500)
                }
            );
        }

        assert_eq!(scheduler.should_retry(4, &spec(), &timeout()), RetryDecision::STOP);
    }

    #[test]
    fn zero_max_retries_never_retries() {
        let decision = RetryScheduler::new().should_retry(0, &spec().with_max_retries(0), &timeout());

        assert!(!decision.retry);
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let failure = AttemptFailure::Remote(Failure(RecoveryInfo::never()));

        assert_eq!(RetryScheduler::new().should_retry(0, &spec(), &failure), RetryDecision::STOP);
    }

    #[test]
    fn exponential_delay_is_capped() {
        let spec = spec()
            .with_backoff(Backoff::Exponential)
            .with_max_delay(Duration::from_millis(1500));
        let scheduler = RetryScheduler::new();

        let delays: Vec<_> = (0..4)
            .map(|used| scheduler.should_retry(used, &spec, &timeout()).delay)
            .collect();

        assert_eq!(
            delays,
            [
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(1500),
                Duration::from_millis(1500)
            ]
        );
    }

    #[test]
    fn uncapped_exponential_delay_stays_finite() {
        let spec = spec().with_backoff(Backoff::Exponential).with_max_retries(64);

        let decision = RetryScheduler::new().should_retry(40, &spec, &timeout());

        assert!(decision.retry);
        assert_eq!(decision.delay, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let spec = spec().with_jitter(true);
        let scheduler = RetryScheduler::with_seed(42);

        for used in 0..4 {
            let delay = scheduler.should_retry(used, &spec, &timeout()).delay;
            assert!(delay >= Duration::from_millis(375), "{delay:?}");
            assert!(delay <= Duration::from_millis(625), "{delay:?}");
        }
    }

    #[test]
    fn jitter_respects_cap() {
        let spec = spec().with_jitter(true).with_max_delay(Duration::from_millis(500));
        let scheduler = RetryScheduler::with_rnd(Rnd::Fixed(0.99));

        assert_eq!(scheduler.should_retry(0, &spec, &timeout()).delay, Duration::from_millis(500));
    }

    #[test]
    fn seeded_schedulers_agree() {
        let spec = spec().with_jitter(true);
        let a = RetryScheduler::with_seed(9);
        let b = RetryScheduler::with_seed(9);

        for used in 0..4 {
            assert_eq!(
                a.should_retry(used, &spec, &timeout()),
                b.should_retry(used, &spec, &timeout())
            );
        }
    }
}
