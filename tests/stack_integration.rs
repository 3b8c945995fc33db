use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, ServiceBuilder, ServiceExt};
use turnstile::{
    AdmissionConfig, AdmissionError, AdmissionLayer, AdmissionStack, AdmitContext,
    CircuitBreakerLayer, CircuitBreakerPolicy, CircuitState, ConcurrencyLimiter,
    FixedWindowLimiter, ManualClock, MemoryWindowStore, RejectReason, StatusCode, WindowStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestError(&'static str);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestError: {}", self.0)
    }
}

impl std::error::Error for TestError {}

#[tokio::test]
async fn throttling_does_not_trip_the_breaker() {
    let breaker = CircuitBreakerPolicy::new(1, Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));
    let stack = AdmissionStack::builder()
        .limiter(FixedWindowLimiter::new(2, Duration::from_secs(60)))
        .circuit_breaker_policy(breaker.clone())
        .build();
    let ctx = AdmitContext::default();

    let mut rejected = 0;
    for _ in 0..10 {
        let calls = calls.clone();
        let result = stack
            .execute(&ctx, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AdmissionError<TestError>>(())
            })
            .await;
        if let Err(err) = result {
            assert_eq!(err.status(), Some(StatusCode::ResourceExhausted));
            rejected += 1;
        }
    }

    assert_eq!(rejected, 8);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn breaker_recovers_after_cooldown() {
    let clock = ManualClock::new();
    let breaker =
        CircuitBreakerPolicy::new(2, Duration::from_millis(500)).with_clock(clock.clone());
    let stack = AdmissionStack::builder()
        .limiter(ConcurrencyLimiter::new(8))
        .circuit_breaker_policy(breaker.clone())
        .build();
    let ctx = AdmitContext::default();

    for _ in 0..2 {
        let _ = stack
            .execute(&ctx, || async { Err::<(), _>(AdmissionError::Inner(TestError("down"))) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = stack
        .execute(&ctx, || async { Ok::<_, AdmissionError<TestError>>(()) })
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(err.status(), Some(StatusCode::Unavailable));

    clock.advance(500);
    stack
        .execute(&ctx, || async { Ok::<_, AdmissionError<TestError>>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn tower_layers_compose_limiter_and_breaker() {
    let limiter = Arc::new(ConcurrencyLimiter::new(4));
    let service = ServiceBuilder::new()
        .layer(AdmissionLayer::from_arc(limiter.clone()))
        .layer(CircuitBreakerLayer::new(CircuitBreakerPolicy::new(3, Duration::from_secs(1))))
        .service(service_fn(|req: &'static str| async move {
            if req == "fail" {
                Err(TestError("handler"))
            } else {
                Ok(req.len())
            }
        }));

    let ok = service.clone().oneshot("hello").await.map_err(AdmissionError::flatten);
    assert_eq!(ok.unwrap(), 5);

    let failed = service.clone().oneshot("fail").await.map_err(AdmissionError::flatten);
    assert_eq!(failed.unwrap_err().into_inner(), Some(TestError("handler")));
    assert_eq!(limiter.in_flight(), 0);
}

#[tokio::test]
async fn keyed_requests_through_the_tower_layer() {
    let store = MemoryWindowStore::new();
    let limiter = turnstile::SlidingWindowLimiter::new(store, 1, Duration::from_secs(60));
    let layer = AdmissionLayer::new(limiter)
        .with_context(|tenant: &&'static str| AdmitContext::keyed(*tenant));
    let service = ServiceBuilder::new()
        .layer(layer)
        .service(service_fn(|_tenant: &'static str| async { Ok::<_, Infallible>(()) }));

    assert!(service.clone().oneshot("acme").await.is_ok());
    assert!(service.clone().oneshot("globex").await.is_ok());
    let err = service.clone().oneshot("acme").await.unwrap_err();
    assert_eq!(err.reject_reason(), Some(RejectReason::SlidingWindowExhausted));
}

#[tokio::test(start_paused = true)]
async fn config_driven_stack_end_to_end() {
    let config: AdmissionConfig = serde_json::from_str(
        r#"{
            "limiters": [
                { "strategy": "concurrency", "threshold": 2 },
                { "strategy": "sliding_window", "threshold": 3, "window_ms": 1000 },
                { "strategy": "leaky_bucket", "capacity": 2, "rate_ms": 100 }
            ],
            "circuit_breaker": { "failure_threshold": 2, "recovery_timeout_ms": 1000 }
        }"#,
    )
    .unwrap();
    let store: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new());
    let stack = AdmissionStack::from_config(&config, Some(store)).unwrap();
    let ctx = AdmitContext::keyed("client-7");

    let mut reasons = Vec::new();
    for _ in 0..3 {
        match stack.execute(&ctx, || async { Ok::<_, AdmissionError<TestError>>(()) }).await {
            Ok(()) => reasons.push(None),
            Err(err) => reasons.push(err.reject_reason()),
        }
    }
    assert_eq!(reasons, vec![None, None, Some(RejectReason::BucketEmpty)]);

    // The third sliding-window slot was spent by the request the bucket turned away.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let err = stack
        .execute(&ctx, || async { Ok::<_, AdmissionError<TestError>>(()) })
        .await
        .unwrap_err();
    assert_eq!(err.reject_reason(), Some(RejectReason::SlidingWindowExhausted));

    stack.shutdown().await;
}
