// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How a single attempt ended, as seen by the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AttemptOutcome {
    /// The attempt completed successfully.
    Success,

    /// The attempt failed.
    Failure,

    /// The attempt did not complete within its timeout.
    Timeout,
}

impl AttemptOutcome {
    /// Returns `true` for [`Failure`][Self::Failure] and [`Timeout`][Self::Timeout].
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failure | Self::Timeout)
    }
}

/// One recorded attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    /// When the attempt completed.
    pub timestamp: Instant,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// How long the attempt took.
    pub latency: Duration,
}

/// The most recent attempts for one call identifier, oldest first.
#[derive(Debug, Default)]
pub(crate) struct RollingWindow {
    records: VecDeque<AttemptRecord>,
    failures: usize,
}

impl RollingWindow {
    /// Appends `record`, evicting the oldest records so that at most `bound` remain.
    pub(crate) fn push(&mut self, record: AttemptRecord, bound: usize) {
        let bound = bound.max(1);

        while self.records.len() >= bound {
            if let Some(evicted) = self.records.pop_front()
                && evicted.outcome.is_failure()
            {
                self.failures -= 1;
            }
        }

        if record.outcome.is_failure() {
            self.failures += 1;
        }

        self.records.push_back(record);
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// Fraction of failed attempts in the window, zero when empty.
    #[expect(clippy::cast_precision_loss, reason = "window sizes are far below 2^52")]
    pub(crate) fn failure_ratio(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }

        self.failures as f64 / self.records.len() as f64
    }

    #[cfg(test)]
    pub(crate) fn records(&self) -> impl Iterator<Item = &AttemptRecord> {
        self.records.iter()
    }
}
