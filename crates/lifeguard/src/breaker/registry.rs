// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use dashmap::DashMap;
use tick::Clock;

use super::{CircuitBreaker, CircuitState};
use crate::CallId;
use crate::telemetry::Telemetry;

/// Circuit breakers keyed by call identifier.
///
/// A breaker is created on first use and kept for the lifetime of the registry.
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: DashMap<CallId, Arc<CircuitBreaker>>,
    clock: Clock,
    telemetry: Telemetry,
}

impl CircuitBreakers {
    pub(crate) fn new(clock: Clock, telemetry: Telemetry) -> Self {
        Self {
            breakers: DashMap::new(),
            clock,
            telemetry,
        }
    }

    /// Returns the breaker for `call_id`, creating it if needed.
    #[must_use]
    pub fn get(&self, call_id: &CallId) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(call_id) {
            return Arc::clone(&breaker);
        }

        let entry = self.breakers.entry(call_id.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                call_id.clone(),
                self.clock.clone(),
                self.telemetry.clone(),
            ))
        });

        Arc::clone(&entry)
    }

    /// State of the breaker for `call_id`, or `None` if it has never been used.
    #[must_use]
    pub fn state(&self, call_id: &CallId) -> Option<CircuitState> {
        self.breakers.get(call_id).map(|breaker| breaker.state())
    }

    /// Number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns `true` if no breaker has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
