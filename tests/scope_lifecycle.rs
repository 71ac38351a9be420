//! Scope Lifecycle Tests
//!
//! Exercises the per-component scope under paused virtual time: timer and
//! subscription ownership, teardown cancellation guarantees, retry backoff
//! pacing, and cache-over-fallback recovery.

use futures::SinkExt;
use selfmend::{FaultInterceptor, HealConfig, ProtectionScope, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn scope() -> ProtectionScope {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let interceptor = Arc::new(FaultInterceptor::new(HealConfig::default()));
    ProtectionScope::new(interceptor, "lifecycle-test")
}

#[tokio::test(start_paused = true)]
async fn timer_fires_while_mounted() {
    let scope = scope();
    let fired = Arc::new(AtomicU32::new(0));
    let fired_in_cb = Arc::clone(&fired);

    let key = scope.guarded_timer(
        Duration::from_millis(100),
        move || {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        },
        None,
    );
    assert!(key.is_some());
    assert_eq!(scope.stats().active_timers, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    // One-shot handles remove their own bookkeeping after firing.
    assert_eq!(scope.stats().active_timers, 0);
}

#[tokio::test(start_paused = true)]
async fn no_timer_fires_after_teardown() {
    let scope = scope();
    let fired = Arc::new(AtomicU32::new(0));

    for key in ["a", "b"] {
        let fired = Arc::clone(&fired);
        scope.guarded_timer(
            Duration::from_millis(100),
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
            Some(key),
        );
    }
    scope.teardown();
    assert_eq!(scope.stats().active_timers, 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn same_key_registration_cancels_the_predecessor() {
    let scope = scope();
    let first = Arc::new(AtomicU32::new(0));
    let second = Arc::new(AtomicU32::new(0));

    {
        let first = Arc::clone(&first);
        scope.guarded_timer(
            Duration::from_millis(100),
            move || {
                first.fetch_add(1, Ordering::SeqCst);
            },
            Some("refresh"),
        );
    }
    {
        let second = Arc::clone(&second);
        scope.guarded_timer(
            Duration::from_millis(100),
            move || {
                second.fetch_add(1, Ordering::SeqCst);
            },
            Some("refresh"),
        );
    }
    assert_eq!(scope.stats().active_timers, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn interval_self_cancels_on_unmount() {
    let scope = scope();
    let ticks = Arc::new(AtomicU32::new(0));
    let ticks_in_cb = Arc::clone(&ticks);

    scope.guarded_interval(
        Duration::from_millis(10),
        move || {
            ticks_in_cb.fetch_add(1, Ordering::SeqCst);
        },
        Some("poll"),
    );

    tokio::time::sleep(Duration::from_millis(35)).await;
    let before = ticks.load(Ordering::SeqCst);
    assert!(before >= 3);

    scope.teardown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), before);
}

#[tokio::test(start_paused = true)]
async fn retryable_exhausts_with_linear_backoff() {
    let scope = scope();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let attempts_in_op = Arc::clone(&attempts);

    let policy = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(100),
    };
    let result = scope
        .guarded_retryable_with(
            move || {
                let attempts = Arc::clone(&attempts_in_op);
                async move {
                    attempts
                        .lock()
                        .expect("attempt log")
                        .push(tokio::time::Instant::now());
                    Err::<u8, _>(anyhow::anyhow!("flaky backend"))
                }
            },
            Some(42),
            policy,
            None,
        )
        .await;

    assert_eq!(result, Some(42));
    let attempts = attempts.lock().expect("attempt log");
    assert_eq!(attempts.len(), 3, "initial call + 2 retries");

    let first_gap = attempts[1] - attempts[0];
    let second_gap = attempts[2] - attempts[1];
    assert!(first_gap >= Duration::from_millis(100));
    assert!(second_gap >= Duration::from_millis(200));
    assert!(second_gap >= first_gap, "backoff must not decrease");
}

#[tokio::test(start_paused = true)]
async fn retryable_aborts_to_fallback_when_unmounted_between_attempts() {
    let scope = scope();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_op = Arc::clone(&calls);
    let scope_ref = &scope;

    let policy = RetryPolicy {
        max_retries: 5,
        base_delay: Duration::from_millis(50),
    };
    let result = scope_ref
        .guarded_retryable_with(
            move || {
                calls_in_op.fetch_add(1, Ordering::SeqCst);
                scope_ref.teardown();
                async { Err::<u8, _>(anyhow::anyhow!("never succeeds")) }
            },
            Some(7),
            policy,
            None,
        )
        .await;

    assert_eq!(result, Some(7));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry after unmount");
}

#[tokio::test(start_paused = true)]
async fn retryable_prefers_cache_on_exhaustion() {
    let scope = scope();
    scope.guard(|| Ok::<_, anyhow::Error>("stale-but-real"), None, Some("feed"));

    let policy = RetryPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(10),
    };
    let result = scope
        .guarded_retryable_with(
            || async { Err::<&str, _>(anyhow::anyhow!("offline")) },
            Some("fallback"),
            policy,
            Some("feed"),
        )
        .await;
    assert_eq!(result, Some("stale-but-real"));
}

#[tokio::test(start_paused = true)]
async fn subscription_delivers_forwards_errors_and_completes() {
    let scope = scope();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(AtomicU32::new(0));
    let done = Arc::new(AtomicU32::new(0));

    let stream = futures::stream::iter(vec![
        Ok(1),
        Ok(2),
        Err(anyhow::anyhow!("sensor glitch")),
        Ok(3),
    ]);
    {
        let seen = Arc::clone(&seen);
        let errors = Arc::clone(&errors);
        let done = Arc::clone(&done);
        scope.guarded_subscribe_with(
            stream,
            move |value| seen.lock().expect("seen log").push(value),
            move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                done.fetch_add(1, Ordering::SeqCst);
            },
            Some("sensor"),
        );
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*seen.lock().expect("seen log"), vec![1, 2, 3]);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(scope.interceptor().total_intercepted(), 1);
    // Natural completion removed the bookkeeping entry.
    assert_eq!(scope.stats().active_subscriptions, 0);
}

#[tokio::test(start_paused = true)]
async fn subscription_stops_delivering_after_teardown() {
    let scope = scope();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_cb = Arc::clone(&seen);

    let (mut tx, rx) = futures::channel::mpsc::channel::<anyhow::Result<i32>>(8);
    scope.guarded_subscribe(
        rx,
        move |value| seen_in_cb.lock().expect("seen log").push(value),
        Some("live"),
    );

    tx.send(Ok(1)).await.expect("send");
    tokio::time::sleep(Duration::from_millis(5)).await;

    scope.teardown();
    let _ = tx.send(Ok(2)).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(*seen.lock().expect("seen log"), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_mounted_scope_tears_it_down() {
    let fired = Arc::new(AtomicU32::new(0));
    {
        let scope = scope();
        let fired = Arc::clone(&fired);
        scope.guarded_timer(
            Duration::from_millis(50),
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn teardown_is_safe_to_repeat() {
    let scope = scope();
    scope.guarded_timer(Duration::from_millis(10), || {}, Some("t"));
    scope.teardown();
    scope.teardown();
    assert!(!scope.is_mounted());
    assert_eq!(scope.stats().active_timers, 0);
}

#[tokio::test(start_paused = true)]
async fn registration_is_refused_after_teardown() {
    let scope = scope();
    scope.teardown();
    assert!(scope
        .guarded_timer(Duration::from_millis(10), || {}, None)
        .is_none());
    assert!(scope
        .guarded_subscribe(futures::stream::empty::<anyhow::Result<u8>>(), |_| {}, None)
        .is_none());
}
