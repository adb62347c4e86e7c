// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Readiness probing and short-circuiting of calls to dependencies that are down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::Poll;
use std::time::Duration;

use breadcrumb::TraceContext;
use lifeguard::{
    CallId, ExecuteError, PolicyExecutor, PolicySpec, Readiness, ReadinessMonitor, ReadinessRegistry, Recovery, RecoveryInfo,
};
use tick::ClockControl;

#[derive(Debug)]
struct Unavailable;

impl Recovery for Unavailable {
    fn recovery(&self) -> RecoveryInfo {
        RecoveryInfo::retry()
    }
}

#[tokio::test]
async fn monitor_runs_until_shutdown() {
    let clock = ClockControl::new().auto_advance_timers(true).to_clock();
    let registry = Arc::new(ReadinessRegistry::new());
    let probes = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&probes);

    let monitor = ReadinessMonitor::new(Arc::clone(&registry), &clock)
        .interval(Duration::from_secs(10))
        .probe("baggage.get", move || {
            // Healthy on the first two probes only.
            let healthy = counter.fetch_add(1, Ordering::Relaxed) < 2;
            async move { healthy }
        });

    let start = clock.instant();
    let shutdown = std::future::poll_fn(|_| {
        if probes.load(Ordering::Relaxed) >= 3 {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    });

    monitor.run(shutdown).await;

    assert_eq!(probes.load(Ordering::Relaxed), 3);
    assert!(!registry.is_ready(&CallId::from("baggage.get")));
    assert!(clock.instant().duration_since(start) >= Duration::from_secs(30));
}

#[tokio::test]
async fn executor_follows_probe_results() {
    let clock = ClockControl::new().auto_advance_timers(true).to_clock();
    let registry = Arc::new(ReadinessRegistry::new());
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&healthy);

    let monitor = ReadinessMonitor::new(Arc::clone(&registry), &clock).probe("baggage.get", move || {
        let healthy = flag.load(Ordering::Relaxed);
        async move { healthy }
    });
    let executor = PolicyExecutor::new(&clock).readiness(registry);
    let spec = PolicySpec::default();
    let parent = TraceContext::new_root();

    monitor.check_all().await;
    let error = executor
        .execute("baggage.get", &spec, &parent, |_| async { Ok::<_, Unavailable>(()) })
        .await
        .unwrap_err();
    assert!(matches!(error, ExecuteError::NotReady { attempts: 0, .. }));

    let value = executor
        .execute_with_fallback(
            "baggage.get",
            &spec,
            &parent,
            |_| async { Ok::<_, Unavailable>(1) },
            |_| async { Ok(0) },
        )
        .await
        .unwrap();
    assert_eq!(value, 0);

    // Other dependencies are unaffected.
    executor
        .execute("passenger.get", &spec, &parent, |_| async { Ok::<_, Unavailable>(()) })
        .await
        .unwrap();

    healthy.store(true, Ordering::Relaxed);
    monitor.check_all().await;
    let value = executor
        .execute("baggage.get", &spec, &parent, |_| async { Ok::<_, Unavailable>(1) })
        .await
        .unwrap();
    assert_eq!(value, 1);
}
