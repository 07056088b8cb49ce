//! The blocking entry point behaves like the suspendable one

mod common;

use api_toolkit::{
    BlockingCallGuard, CacheTtl, CallError, CallGuard, CallSignature, GuardConfig, IgnorePolicy,
    Outcome, RetryPolicy,
};
use common::{manual_store, FakeEndpoint};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_test::assert_ok;

fn blocking(config: GuardConfig) -> (BlockingCallGuard, api_toolkit::ManualClock) {
    let (store, clock) = manual_store();
    let guard = assert_ok!(CallGuard::new(config, store));
    (assert_ok!(BlockingCallGuard::from_guard(guard)), clock)
}

#[test]
fn test_blocking_cache_expiry() {
    let (guard, clock) = blocking(GuardConfig::new("sync_cache").ttl(CacheTtl::seconds(60)));
    let endpoint = FakeEndpoint::default();
    let sig = CallSignature::new("GET", "/a");

    assert!(!assert_ok!(guard.call(&sig, || endpoint.respond(200))).is_cached());
    clock.advance(Duration::from_secs(30));
    assert!(assert_ok!(guard.call(&sig, || endpoint.respond(200))).is_cached());
    clock.advance(Duration::from_secs(31));
    assert!(!assert_ok!(guard.call(&sig, || endpoint.respond(200))).is_cached());
    assert_eq!(endpoint.calls(), 2);
}

#[test]
fn test_blocking_classification_matches_async() {
    let (guard, _clock) = blocking(
        GuardConfig::new("sync_classify")
            .retry(RetryPolicy::on_statuses([500], 3, Duration::from_millis(5)))
            .ignore(IgnorePolicy::on_statuses([404])),
    );
    let endpoint = FakeEndpoint::default();

    let exhausted = guard.call(&CallSignature::new("GET", "/500"), || endpoint.respond(500));
    assert!(matches!(exhausted, Err(CallError::RetryExhausted { attempts: 3, .. })));
    assert_eq!(endpoint.calls(), 3);

    let ignored = assert_ok!(guard.call(&CallSignature::new("GET", "/404"), || endpoint.respond(404)));
    assert!(matches!(ignored, Outcome::Ignored(Ok(ref r)) if r.status == 404));
    assert_eq!(endpoint.calls(), 4);
}

#[test]
fn test_blocking_threads_respect_concurrency_limit() {
    let (guard, _clock) = blocking(GuardConfig::new("sync_threads").concurrency_limit(2));
    let guard = Arc::new(guard);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..6)
        .map(|i| {
            let guard = Arc::clone(&guard);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                let sig = CallSignature::new("PUT", format!("/jobs/{i}"));
                guard.call(&sig, || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(204u16)
                })
            })
        })
        .collect();

    for worker in workers {
        assert_ok!(worker.join().unwrap());
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
}
