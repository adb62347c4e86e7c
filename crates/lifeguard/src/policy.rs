// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// How the delay between retries grows with each attempt.
///
/// All strategies start from [`PolicySpec::retry_delay`] and are capped by
/// [`PolicySpec::max_delay`] when one is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Backoff {
    /// The same delay before every retry.
    ///
    /// **Example with `500ms` retry delay:** `500ms, 500ms, 500ms, ...`
    #[default]
    Constant,

    /// The delay grows by the retry delay with each attempt.
    ///
    /// **Example with `500ms` retry delay:** `500ms, 1s, 1.5s, 2s, ...`
    Linear,

    /// The delay doubles with each attempt.
    ///
    /// **Example with `500ms` retry delay:** `500ms, 1s, 2s, 4s, ...`
    Exponential,
}

/// A policy value failed validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// The failure ratio is not a number in `[0, 1]`.
    #[error("failure ratio must be within [0, 1], got {0}")]
    FailureRatio(f64),

    /// The success threshold is zero, so a half-open breaker could never close.
    #[error("success threshold must be at least 1")]
    SuccessThreshold,

    /// The timeout is zero, so every attempt would time out.
    #[error("timeout must be greater than zero")]
    Timeout,
}

/// Fault-tolerance settings for one call site.
///
/// A `PolicySpec` is an immutable value. Builder methods return a modified copy.
/// The defaults match the customary fault-tolerance defaults for service calls:
///
/// | setting                    | default  |
/// |----------------------------|----------|
/// | timeout                    | 1s       |
/// | max retries                | 3        |
/// | retry delay                | 0        |
/// | backoff                    | constant |
/// | jitter                     | off      |
/// | request volume threshold   | 20       |
/// | failure ratio              | 0.5      |
/// | open duration              | 5s       |
/// | success threshold          | 1        |
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use lifeguard::PolicySpec;
///
/// let spec = PolicySpec::default()
///     .with_timeout(Duration::from_millis(250))
///     .with_max_retries(4)
///     .with_retry_delay(Duration::from_millis(500));
///
/// assert_eq!(spec.max_retries(), 4);
/// assert!(spec.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicySpec {
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    backoff: Backoff,
    max_delay: Option<Duration>,
    jitter: bool,
    request_volume_threshold: u32,
    failure_ratio: f64,
    open_duration: Duration,
    success_threshold: u32,
    rolling_window: Option<u32>,
}

impl Default for PolicySpec {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_retries: 3,
            retry_delay: Duration::ZERO,
            backoff: Backoff::Constant,
            max_delay: None,
            jitter: false,
            request_volume_threshold: 20,
            failure_ratio: 0.5,
            open_duration: Duration::from_secs(5),
            success_threshold: 1,
            rolling_window: None,
        }
    }
}

impl PolicySpec {
    /// Sets how long a single attempt may run before it is abandoned.
    #[must_use]
    pub const fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Sets how many times a failed call is retried. Zero disables retries.
    #[must_use]
    pub const fn with_max_retries(self, max_retries: u32) -> Self {
        Self { max_retries, ..self }
    }

    /// Sets the delay before a retry, or the base delay when a growing backoff is used.
    #[must_use]
    pub const fn with_retry_delay(self, retry_delay: Duration) -> Self {
        Self { retry_delay, ..self }
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub const fn with_backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }

    /// Caps every computed retry delay.
    #[must_use]
    pub const fn with_max_delay(self, max_delay: Duration) -> Self {
        Self {
            max_delay: Some(max_delay),
            ..self
        }
    }

    /// Enables or disables jitter. Jittered delays lie within `[0.75, 1.25]` of the computed delay.
    #[must_use]
    pub const fn with_jitter(self, jitter: bool) -> Self {
        Self { jitter, ..self }
    }

    /// Sets the minimum number of recorded attempts before the breaker evaluates the failure ratio.
    #[must_use]
    pub const fn with_request_volume_threshold(self, threshold: u32) -> Self {
        Self {
            request_volume_threshold: threshold,
            ..self
        }
    }

    /// Sets the failure ratio at or above which the breaker opens.
    #[must_use]
    pub const fn with_failure_ratio(self, failure_ratio: f64) -> Self {
        Self { failure_ratio, ..self }
    }

    /// Sets how long an open breaker rejects calls before letting a probe through.
    #[must_use]
    pub const fn with_open_duration(self, open_duration: Duration) -> Self {
        Self { open_duration, ..self }
    }

    /// Sets how many consecutive probe successes close a half-open breaker.
    #[must_use]
    pub const fn with_success_threshold(self, success_threshold: u32) -> Self {
        Self {
            success_threshold,
            ..self
        }
    }

    /// Sets how many recent attempts the breaker remembers.
    ///
    /// Values below the request volume threshold are raised to it.
    #[must_use]
    pub const fn with_rolling_window(self, size: u32) -> Self {
        Self {
            rolling_window: Some(size),
            ..self
        }
    }

    /// Per-attempt timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Maximum number of retries after the first attempt.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Fixed or base retry delay.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Backoff strategy.
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Upper bound for retry delays, if any.
    #[must_use]
    pub const fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// Whether retry delays are jittered.
    #[must_use]
    pub const fn jitter(&self) -> bool {
        self.jitter
    }

    /// Minimum window volume before the failure ratio is evaluated.
    #[must_use]
    pub const fn request_volume_threshold(&self) -> u32 {
        self.request_volume_threshold
    }

    /// Failure ratio that opens the breaker.
    #[must_use]
    pub const fn failure_ratio(&self) -> f64 {
        self.failure_ratio
    }

    /// Time the breaker stays open before probing.
    #[must_use]
    pub const fn open_duration(&self) -> Duration {
        self.open_duration
    }

    /// Consecutive probe successes needed to close the breaker.
    #[must_use]
    pub const fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    /// Number of recent attempts kept by the breaker.
    ///
    /// Never smaller than the request volume threshold, and at least one.
    #[must_use]
    pub fn rolling_window(&self) -> u32 {
        self.rolling_window
            .unwrap_or(self.request_volume_threshold)
            .max(self.request_volume_threshold)
            .max(1)
    }

    /// Checks that the settings describe a usable policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the failure ratio is outside `[0, 1]`, the success threshold
    /// is zero, or the timeout is zero.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !(0.0..=1.0).contains(&self.failure_ratio) {
            return Err(PolicyError::FailureRatio(self.failure_ratio));
        }

        if self.success_threshold == 0 {
            return Err(PolicyError::SuccessThreshold);
        }

        if self.timeout.is_zero() {
            return Err(PolicyError::Timeout);
        }

        Ok(())
    }
}
