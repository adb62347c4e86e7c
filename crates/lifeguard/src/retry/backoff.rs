// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cmp::min;
use std::time::Duration;

use crate::Backoff;
use crate::rnd::Rnd;

/// The factor used to determine the range of jitter applied to delays.
const JITTER_FACTOR: f64 = 0.5;

/// Upper bound of every retry delay, including policies without a `max_delay`.
pub(super) const DELAY_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay before retry number `retry` (zero-based), before jitter and capping.
pub(super) fn base_delay(backoff: Backoff, retry_delay: Duration, retry: u32) -> Duration {
    // zero base delay => always zero
    if retry_delay.is_zero() {
        return Duration::ZERO;
    }

    match backoff {
        Backoff::Constant => retry_delay,
        Backoff::Linear => retry_delay.saturating_mul(retry.saturating_add(1)),
        Backoff::Exponential => 2_u32
            .checked_pow(retry)
            .map_or(Duration::MAX, |factor| retry_delay.saturating_mul(factor)),
    }
}

pub(super) fn clamp_to_max(delay: Duration, max: Option<Duration>) -> Duration {
    min(delay, max.map_or(DELAY_CEILING, |m| min(m, DELAY_CEILING)))
}

/// Adds a symmetric, uniform jitter around the given delay.
///
/// With `JITTER_FACTOR = 0.5`, the result lies in `[0.75*delay, 1.25*delay]`.
pub(super) fn apply_jitter(delay: Duration, rnd: &Rnd) -> Duration {
    let ms = delay.as_secs_f64() * 1000.0;
    let offset = (ms * JITTER_FACTOR) / 2.0;
    let random_delay = (ms * JITTER_FACTOR).mul_add(rnd.next_f64(), -offset);

    secs_to_duration_saturating((ms + random_delay) / 1000.0)
}

fn secs_to_duration_saturating(secs: f64) -> Duration {
    if secs <= 0.0 {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
