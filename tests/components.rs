//! Component edge cases exercised through the public crate APIs: circuit
//! breaker cycling, idempotency capacity behavior, rate-limit carry-over, and
//! event listeners.

use paygate_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use paygate_core::Hooks;
use paygate_idempotency::{Acquire, IdempotencyCache, IdempotencyConfig};
use paygate_ratelimit::{RateLimitConfig, RateLimiter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn breaker_full_cycle_closed_open_half_open_closed() {
    let breaker = CircuitBreaker::new(
        BreakerConfig::builder()
            .failure_threshold(5)
            .open_duration(Duration::from_secs(30))
            .build(),
    );
    let endpoint = "https://seller.example/api";

    // Exactly `threshold` consecutive failures open the circuit.
    for _ in 0..4 {
        breaker.record_failure(endpoint);
        assert_eq!(breaker.state(endpoint), CircuitState::Closed);
    }
    breaker.record_failure(endpoint);
    assert_eq!(breaker.state(endpoint), CircuitState::Open);
    assert!(!breaker.try_acquire(endpoint));

    // After the open window one probe is admitted.
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(breaker.try_acquire(endpoint));
    assert_eq!(breaker.state(endpoint), CircuitState::HalfOpen);
    assert!(!breaker.try_acquire(endpoint));

    // Probe success closes.
    breaker.record_success(endpoint);
    assert_eq!(breaker.state(endpoint), CircuitState::Closed);

    // And from half-open, a failed probe reopens.
    for _ in 0..5 {
        breaker.record_failure(endpoint);
    }
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(breaker.try_acquire(endpoint));
    breaker.record_failure(endpoint);
    assert_eq!(breaker.state(endpoint), CircuitState::Open);
}

#[tokio::test]
async fn breaker_transition_listener_receives_events() {
    let transitions = Arc::new(AtomicUsize::new(0));
    let transitions_clone = Arc::clone(&transitions);

    let breaker = CircuitBreaker::new(
        BreakerConfig::builder()
            .failure_threshold(1)
            .on_state_transition(move |_endpoint, from, to| {
                assert_ne!(from, to);
                transitions_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build(),
    );

    breaker.record_failure("ep");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transitions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn idempotency_cache_never_exceeds_capacity() {
    let cache: IdempotencyCache<u32> = IdempotencyCache::new(IdempotencyConfig {
        capacity: 100,
        ttl: Duration::from_secs(60),
    });

    let mut guards = Vec::new();
    let mut bypassed = 0usize;
    for i in 0..150 {
        match cache.get_or_reserve("session", &format!("key-{i}")).await {
            Acquire::Reserved(guard) => guards.push(guard),
            Acquire::Bypass => bypassed += 1,
            Acquire::Found(_) => panic!("nothing completed yet"),
        }
    }

    assert_eq!(cache.len(), 100);
    assert_eq!(bypassed, 50);
}

#[tokio::test]
async fn idempotency_completion_frees_no_capacity_until_ttl() {
    let cache: IdempotencyCache<u32> = IdempotencyCache::new(IdempotencyConfig {
        capacity: 2,
        ttl: Duration::from_secs(60),
    });

    match cache.get_or_reserve("s", "a").await {
        Acquire::Reserved(guard) => guard.complete(1),
        _ => panic!(),
    }
    match cache.get_or_reserve("s", "b").await {
        Acquire::Reserved(guard) => guard.complete(2),
        _ => panic!(),
    }

    // Completed entries still occupy capacity until they expire.
    match cache.get_or_reserve("s", "c").await {
        Acquire::Bypass => {}
        _ => panic!("expected bypass"),
    }

    // But a completed key is served from cache, not counted against capacity.
    match cache.get_or_reserve("s", "a").await {
        Acquire::Found(v) => assert_eq!(v, 1),
        _ => panic!("expected cached outcome"),
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_carry_over_is_bounded() {
    let limiter = RateLimiter::new(RateLimitConfig {
        window: Duration::from_secs(60),
    });

    assert!(limiter.check("s", 10).is_allowed());

    // A week of idleness still only grants two windows' worth.
    tokio::time::advance(Duration::from_secs(7 * 24 * 3600)).await;
    let mut allowed = 0;
    for _ in 0..100 {
        if limiter.check("s", 10).is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 20);
}

#[tokio::test]
async fn component_hooks_isolate_panics() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered_clone = Arc::clone(&delivered);

    let mut hooks: Hooks<&str> = Hooks::new();
    hooks.attach("broken", |_| panic!("hook bug"));
    hooks.attach("counter", move |_| {
        delivered_clone.fetch_add(1, Ordering::SeqCst);
    });

    hooks.dispatch(&"circuit opened");
    hooks.dispatch(&"circuit closed");

    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert_eq!(hooks.panic_count(), 2);
}
