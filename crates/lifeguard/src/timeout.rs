// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use tick::{Clock, FutureExt};

/// Runs `future` until it completes or `timeout` elapses on `clock`.
///
/// Returns `None` on timeout. The future is dropped at that point, so any result it
/// would have produced later is discarded.
pub(crate) async fn with_timeout<F: Future>(clock: &Clock, timeout: Duration, future: F) -> Option<F::Output> {
    future.timeout(clock, timeout).await.ok()
}
