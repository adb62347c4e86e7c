// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use recoverable::{Recovery, RecoveryInfo};

use crate::{CallId, CircuitState, PolicyError};

/// Why a single attempt failed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AttemptFailure<E> {
    /// The attempt did not complete within the policy timeout and was abandoned.
    #[error("attempt timed out after {timeout:?}")]
    TimedOut {
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// The operation returned an error.
    #[error(transparent)]
    Remote(E),
}

impl<E> AttemptFailure<E> {
    /// The operation's error, if the attempt did not time out.
    #[must_use]
    pub const fn remote_error(&self) -> Option<&E> {
        match self {
            Self::Remote(error) => Some(error),
            Self::TimedOut { .. } => None,
        }
    }
}

/// Terminal failure of a call made through [`PolicyExecutor`][crate::PolicyExecutor].
///
/// Every variant carries the call identifier, the number of times the operation was
/// invoked, and the breaker state observed when the call gave up. Breaker rejections
/// ([`CircuitOpen`][Self::CircuitOpen]) are distinct from failures of the remote
/// operation itself.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecuteError<E> {
    /// The only permitted attempt timed out.
    #[error("call '{call_id}' timed out after {timeout:?} (attempts: {attempts}, circuit: {state})")]
    Timeout {
        /// The call that failed.
        call_id: CallId,
        /// The timeout that was exceeded.
        timeout: Duration,
        /// Number of operation invocations.
        attempts: u32,
        /// Breaker state when the call gave up.
        state: CircuitState,
    },

    /// The breaker rejected the attempt without running the operation.
    #[error("circuit for '{call_id}' is open (attempts: {attempts}, retry after: {retry_after:?})")]
    CircuitOpen {
        /// The call that was rejected.
        call_id: CallId,
        /// Number of operation invocations before the rejection.
        attempts: u32,
        /// Breaker state when the call was rejected.
        state: CircuitState,
        /// Time left until the breaker lets a probe through.
        retry_after: Duration,
        /// Failure of the attempt before the rejection, if any ran.
        #[source]
        last: Option<AttemptFailure<E>>,
    },

    /// The operation failed and the failure is not retried.
    #[error("call '{call_id}' failed (attempts: {attempts}, circuit: {state})")]
    Remote {
        /// The call that failed.
        call_id: CallId,
        /// Number of operation invocations.
        attempts: u32,
        /// Breaker state when the call gave up.
        state: CircuitState,
        /// The operation's error.
        source: E,
    },

    /// Every permitted retry failed.
    #[error("call '{call_id}' failed after {attempts} attempts (circuit: {state})")]
    RetryExhausted {
        /// The call that failed.
        call_id: CallId,
        /// Number of operation invocations.
        attempts: u32,
        /// Breaker state when the call gave up.
        state: CircuitState,
        /// Failure of the last attempt.
        #[source]
        last: AttemptFailure<E>,
    },

    /// The fallback itself failed.
    #[error("fallback for '{call_id}' failed (attempts: {attempts}, circuit: {state})")]
    Fallback {
        /// The call whose fallback failed.
        call_id: CallId,
        /// Number of operation invocations before the fallback ran.
        attempts: u32,
        /// Breaker state when the fallback ran.
        state: CircuitState,
        /// The fallback's error.
        source: E,
    },

    /// The dependency reported itself as not ready and no attempt was made.
    #[error("dependency of '{call_id}' is not ready (attempts: {attempts}, circuit: {state})")]
    NotReady {
        /// The call that was short-circuited.
        call_id: CallId,
        /// Number of operation invocations before the short circuit.
        attempts: u32,
        /// Breaker state when the call was short-circuited.
        state: CircuitState,
        /// Failure of the attempt before the short circuit, if any ran.
        #[source]
        last: Option<AttemptFailure<E>>,
    },

    /// The policy failed validation and no attempt was made.
    #[error("policy for '{call_id}' is invalid")]
    InvalidPolicy {
        /// The call whose policy is invalid.
        call_id: CallId,
        /// Always zero.
        attempts: u32,
        /// Breaker state when the policy was rejected.
        state: CircuitState,
        /// What is wrong with the policy.
        source: PolicyError,
    },
}

impl<E> ExecuteError<E> {
    /// The call that failed.
    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        match self {
            Self::Timeout { call_id, .. }
            | Self::CircuitOpen { call_id, .. }
            | Self::Remote { call_id, .. }
            | Self::RetryExhausted { call_id, .. }
            | Self::Fallback { call_id, .. }
            | Self::NotReady { call_id, .. }
            | Self::InvalidPolicy { call_id, .. } => call_id,
        }
    }

    /// Number of times the operation was invoked.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Timeout { attempts, .. }
            | Self::CircuitOpen { attempts, .. }
            | Self::Remote { attempts, .. }
            | Self::RetryExhausted { attempts, .. }
            | Self::Fallback { attempts, .. }
            | Self::NotReady { attempts, .. }
            | Self::InvalidPolicy { attempts, .. } => *attempts,
        }
    }

    /// Breaker state observed when the call gave up.
    #[must_use]
    pub const fn state(&self) -> CircuitState {
        match self {
            Self::Timeout { state, .. }
            | Self::CircuitOpen { state, .. }
            | Self::Remote { state, .. }
            | Self::RetryExhausted { state, .. }
            | Self::Fallback { state, .. }
            | Self::NotReady { state, .. }
            | Self::InvalidPolicy { state, .. } => *state,
        }
    }

    /// Returns `true` if the breaker rejected the call.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Returns `true` if the call gave up because of a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::RetryExhausted {
                    last: AttemptFailure::TimedOut { .. },
                    ..
                }
        )
    }

    /// The last error returned by the operation or the fallback, if any.
    #[must_use]
    pub const fn remote_error(&self) -> Option<&E> {
        match self {
            Self::Remote { source, .. } | Self::Fallback { source, .. } => Some(source),
            Self::RetryExhausted { last, .. } => last.remote_error(),
            Self::CircuitOpen { last, .. } | Self::NotReady { last, .. } => match last {
                Some(last) => last.remote_error(),
                None => None,
            },
            Self::Timeout { .. } | Self::InvalidPolicy { .. } => None,
        }
    }
}

impl<E: Recovery> Recovery for ExecuteError<E> {
    fn recovery(&self) -> RecoveryInfo {
        match self {
            Self::Remote { source, .. } | Self::Fallback { source, .. } => source.recovery(),
            Self::RetryExhausted {
                last: AttemptFailure::Remote(source),
                ..
            } => source.recovery(),
            Self::Timeout { .. }
            | Self::RetryExhausted {
                last: AttemptFailure::TimedOut { .. },
                ..
            } => RecoveryInfo::retry(),
            Self::CircuitOpen { .. } | Self::NotReady { .. } => RecoveryInfo::unavailable(),
            Self::InvalidPolicy { .. } => RecoveryInfo::never(),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::error::Error;

    use recoverable::RecoveryKind;

    use super::*;

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    #[error("boom")]
    struct Boom;

    impl Recovery for Boom {
        fn recovery(&self) -> RecoveryInfo {
            RecoveryInfo::never()
        }
    }

    static_assertions::assert_impl_all!(ExecuteError<Boom>: Send, Sync, Error);

    fn id() -> CallId {
        CallId::from("baggage.get")
    }

    #[test]
    fn display_mentions_call_and_attempts() {
        let error: ExecuteError<Boom> = ExecuteError::RetryExhausted {
            call_id: id(),
            attempts: 5,
            state: CircuitState::Closed,
            last: AttemptFailure::TimedOut {
                timeout: Duration::from_millis(250),
            },
        };

        assert_eq!(error.to_string(), "call 'baggage.get' failed after 5 attempts (circuit: closed)");
        assert_eq!(error.source().unwrap().to_string(), "attempt timed out after 250ms");
        assert!(error.is_timeout());
        assert_eq!(error.attempts(), 5);
    }

    #[test]
    fn remote_error_is_exposed() {
        let error = ExecuteError::RetryExhausted {
            call_id: id(),
            attempts: 2,
            state: CircuitState::Closed,
            last: AttemptFailure::Remote(Boom),
        };

        assert_eq!(error.remote_error(), Some(&Boom));
        assert_eq!(error.source().unwrap().to_string(), "boom");
        assert!(!error.is_timeout());
    }

    #[test]
    fn circuit_open_is_distinguishable() {
        let error: ExecuteError<Boom> = ExecuteError::CircuitOpen {
            call_id: id(),
            attempts: 0,
            state: CircuitState::Open,
            retry_after: Duration::from_secs(1),
            last: None,
        };

        assert!(error.is_circuit_open());
        assert_eq!(error.remote_error(), None);
        assert_eq!(error.state(), CircuitState::Open);
        assert_eq!(error.call_id(), &id());
        assert_eq!(error.recovery().kind(), RecoveryKind::Unavailable);
    }

    #[test]
    fn recovery_follows_remote_error() {
        let error = ExecuteError::Remote {
            call_id: id(),
            attempts: 1,
            state: CircuitState::Closed,
            source: Boom,
        };

        assert_eq!(error.recovery().kind(), RecoveryKind::Never);
    }

    #[test]
    fn rejection_keeps_previous_failure() {
        let error = ExecuteError::CircuitOpen {
            call_id: id(),
            attempts: 2,
            state: CircuitState::Open,
            retry_after: Duration::from_secs(1),
            last: Some(AttemptFailure::Remote(Boom)),
        };

        assert_eq!(error.remote_error(), Some(&Boom));
        assert_eq!(error.source().unwrap().to_string(), "boom");
        assert_eq!(error.recovery().kind(), RecoveryKind::Unavailable);
    }

    #[test]
    fn invalid_policy_is_not_recoverable() {
        let error: ExecuteError<Boom> = ExecuteError::InvalidPolicy {
            call_id: id(),
            attempts: 0,
            state: CircuitState::Closed,
            source: PolicyError::SuccessThreshold,
        };

        assert_eq!(error.to_string(), "policy for 'baggage.get' is invalid");
        assert!(error.source().is_some());
        assert_eq!(error.recovery().kind(), RecoveryKind::Never);
        assert_eq!(error.remote_error(), None);
    }
}
