//! Concurrent-proxy invariants: bounded spend, reservation visibility, and
//! idempotency under contention.

mod support;

use paygate::{Amount, CreateSessionRequest, GatewayStore, ProxyRequest};
use std::sync::Arc;
use support::{amount, candidate, default_gateway};

const BUYER: &str = "0xbuyer";

fn create_request(max_total: &str, max_per_request: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        max_total: amount(max_total),
        max_per_request: amount(max_per_request),
        strategy: None,
        allowed_service_types: None,
        warn_at_percent: None,
        rate_limit_per_minute: Some(1_000),
        expires_in_secs: 0,
    }
}

fn proxy_request() -> ProxyRequest {
    ProxyRequest {
        service_type: "inference".to_string(),
        params: serde_json::json!({}),
        idempotency_key: None,
        prefer_agent: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_spend_never_exceeds_max_total() {
    let t = default_gateway();
    t.registry.set_candidates(vec![candidate("svc", "0.400000", 0.9)]);
    t.forwarder.set_delay_ms(30);

    let session = t
        .gateway
        .create_session(BUYER, None, create_request("1.000000", "0.500000"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let gateway = Arc::clone(&t.gateway);
        let session_id = session.id.clone();
        handles.push(tokio::spawn(async move {
            gateway.proxy(&session_id, proxy_request()).await
        }));
    }

    let mut paid_total = Amount::ZERO;
    let mut successes = 0usize;
    for handle in handles {
        if let Ok(result) = handle.await.unwrap() {
            paid_total = paid_total.checked_add(result.amount_paid).unwrap();
            successes += 1;
        }
    }

    // 0.4 fits at most twice into a 1.0 budget (the third would need 0.4
    // against 0.2 remaining).
    assert_eq!(successes, 2);
    assert_eq!(paid_total.to_string(), "0.800000");
    assert!(paid_total <= session.max_total);
    assert_eq!(t.ledger.settled_total(), paid_total);

    let stored = t.store.get_session(&session.id).await.unwrap();
    assert_eq!(stored.total_spent, paid_total);
    assert_eq!(stored.request_count, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn policy_sees_in_flight_reservations() {
    let t = default_gateway();
    t.registry.set_candidates(vec![candidate("svc", "0.400000", 0.9)]);
    t.forwarder.set_delay_ms(50);

    let session = t
        .gateway
        .create_session(BUYER, None, create_request("2.000000", "0.500000"))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        t.gateway.proxy(&session.id, proxy_request()),
        t.gateway.proxy(&session.id, proxy_request()),
    );
    a.unwrap();
    b.unwrap();

    // One of the two reserve-phase evaluations ran while the other call's
    // reservation was still in flight: its projected spend includes it even
    // though nothing was persisted yet.
    let projected: Vec<Amount> = t
        .policy
        .contexts()
        .iter()
        .filter(|ctx| !ctx.service_type.is_empty())
        .map(|ctx| ctx.total_spent)
        .collect();
    assert_eq!(projected.len(), 2);
    assert!(
        projected.contains(&amount("0.400000")),
        "second evaluation must see the first call's pending reservation: {projected:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn distinct_idempotency_keys_settle_independently() {
    let t = default_gateway();
    t.registry.set_candidates(vec![candidate("svc", "0.100000", 0.9)]);
    t.forwarder.set_delay_ms(20);

    let session = t
        .gateway
        .create_session(BUYER, None, create_request("1.000000", "0.500000"))
        .await
        .unwrap();

    let request_a = ProxyRequest {
        idempotency_key: Some("key-a".into()),
        ..proxy_request()
    };
    let request_b = ProxyRequest {
        idempotency_key: Some("key-b".into()),
        ..proxy_request()
    };

    let (a, b) = tokio::join!(
        t.gateway.proxy(&session.id, request_a),
        t.gateway.proxy(&session.id, request_b),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(t.ledger.settlements().len(), 2);
}

#[tokio::test]
async fn failed_attempt_is_not_cached_for_the_key() {
    let t = default_gateway();
    let svc = candidate("svc", "0.100000", 0.9);
    t.forwarder
        .set_behavior(&svc.endpoint, support::ForwardBehavior::Transport);
    t.registry.set_candidates(vec![svc.clone()]);

    let session = t
        .gateway
        .create_session(BUYER, None, create_request("1.000000", "0.500000"))
        .await
        .unwrap();

    let request = ProxyRequest {
        idempotency_key: Some("key-1".into()),
        ..proxy_request()
    };

    t.gateway
        .proxy(&session.id, request.clone())
        .await
        .unwrap_err();

    // The endpoint recovers; the same key must re-execute, not replay the
    // failure.
    t.forwarder.set_behavior(
        &svc.endpoint,
        support::ForwardBehavior::Ok(200, serde_json::json!({"ok": true})),
    );
    let result = t.gateway.proxy(&session.id, request).await.unwrap();
    assert_eq!(result.amount_paid.to_string(), "0.100000");
    assert_eq!(t.ledger.settlements().len(), 1);
}

#[tokio::test]
async fn completed_key_replays_without_a_second_settlement() {
    let t = default_gateway();
    t.registry.set_candidates(vec![candidate("svc", "0.100000", 0.9)]);

    let session = t
        .gateway
        .create_session(BUYER, None, create_request("1.000000", "0.500000"))
        .await
        .unwrap();

    let request = ProxyRequest {
        idempotency_key: Some("key-1".into()),
        ..proxy_request()
    };

    let first = t.gateway.proxy(&session.id, request.clone()).await.unwrap();
    let second = t.gateway.proxy(&session.id, request).await.unwrap();

    assert_eq!(first.request_reference, second.request_reference);
    assert_eq!(t.ledger.settlements().len(), 1);

    let stored = t.store.get_session(&session.id).await.unwrap();
    assert_eq!(stored.total_spent.to_string(), "0.100000");
}
