// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Circuit breaking per call identifier.
//!
//! A breaker starts [closed][CircuitState::Closed] and records the outcome of every
//! attempt in a bounded rolling window. Once the window holds at least the request
//! volume threshold and its failure ratio reaches the configured ratio, the breaker
//! [opens][CircuitState::Open] and rejects attempts without running them. After the
//! open duration it turns [half-open][CircuitState::HalfOpen] and lets a single probe
//! through at a time. Enough consecutive successful probes close it again with a fresh
//! window. A failed probe opens it again and restarts the timer.

use std::fmt::{self, Display};

mod engine;
mod registry;
mod window;

pub use engine::{BreakerPermit, BreakerSnapshot, CircuitBreaker, Rejected, Transition};
pub use registry::CircuitBreakers;
pub use window::{AttemptOutcome, AttemptRecord};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CircuitState {
    /// Attempts run normally and their outcomes are recorded.
    Closed,

    /// Attempts are rejected until the open duration elapses.
    Open,

    /// A limited number of probe attempts decide whether to close or reopen.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state as a `snake_case` string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(CircuitState::Closed.as_str(), "closed");
        assert_eq!(CircuitState::Open.as_str(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
