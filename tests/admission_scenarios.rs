use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::time::sleep;
use turnstile::{
    Admission, AdmissionError, AdmitContext, ConcurrencyLimiter, FailurePolicy,
    FixedWindowLimiter, LeakyBucket, Limiter, ManualClock, MemoryWindowStore, RejectReason,
    SlidingWindowLimiter, StatusCode, StoreError, TokenBucket, WindowRequest, WindowStore,
};

#[derive(Debug)]
struct TestError;

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestError")
    }
}

impl std::error::Error for TestError {}

#[tokio::test(start_paused = true)]
async fn leaky_bucket_capacity_two_rate_hundred() {
    let admission = Admission::new(LeakyBucket::new(2, Duration::from_millis(100)).unwrap());
    let ctx = AdmitContext::default();

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(admission.execute(&ctx, || async { Ok::<_, AdmissionError<TestError>>(()) }).await);
    }
    let admitted = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 2);
    for rejected in outcomes.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(rejected.reject_reason(), Some(RejectReason::BucketEmpty));
        assert_eq!(rejected.status(), Some(StatusCode::ResourceExhausted));
    }

    sleep(Duration::from_millis(250)).await;
    let result = admission.execute(&ctx, || async { Ok::<_, AdmissionError<TestError>>(()) }).await;
    assert!(result.is_ok());
    admission.shutdown().await;
}

#[tokio::test]
async fn fixed_window_threshold_three() {
    let clock = ManualClock::new();
    let limiter =
        FixedWindowLimiter::new(3, Duration::from_secs(1)).with_clock(clock.clone());
    let ctx = AdmitContext::default();

    for _ in 0..3 {
        assert!(limiter.admit(&ctx).await.is_admitted());
    }
    clock.advance(10);
    let decision = limiter.admit(&ctx).await;
    assert_eq!(decision.reason(), Some(RejectReason::WindowExhausted));

    clock.set(1005);
    assert!(limiter.admit(&ctx).await.is_admitted());
}

#[tokio::test]
async fn fixed_window_allows_boundary_overshoot() {
    let clock = ManualClock::new();
    let limiter =
        FixedWindowLimiter::new(5, Duration::from_millis(100)).with_clock(clock.clone());
    let ctx = AdmitContext::default();

    // The window opens with the first request at t=0.
    assert!(limiter.admit(&ctx).await.is_admitted());
    clock.set(99);
    let late = join_all((0..5).map(|_| limiter.admit(&ctx))).await;
    clock.set(100);
    let early = join_all((0..5).map(|_| limiter.admit(&ctx))).await;

    assert_eq!(late.iter().filter(|d| d.is_admitted()).count(), 4);
    assert_eq!(early.iter().filter(|d| d.is_admitted()).count(), 5);
}

#[tokio::test(start_paused = true)]
async fn token_bucket_admits_bounded_by_elapsed_time() {
    let bucket = TokenBucket::new(5, Duration::from_millis(20)).unwrap();
    let ctx = AdmitContext::default();

    sleep(Duration::from_millis(70)).await;
    let mut admitted = 0;
    while bucket.admit(&ctx).await.is_admitted() {
        admitted += 1;
    }
    assert!(admitted <= 3, "admitted {admitted}");
    bucket.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_limit_never_exceeded_under_contention() {
    let limiter = Arc::new(ConcurrencyLimiter::new(3));
    let admission = Admission::from_arc(limiter.clone());
    let peak = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(32));

    let tasks = (0..32).map(|_| {
        let admission = admission.clone();
        let limiter = limiter.clone();
        let peak = peak.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            for _ in 0..50 {
                let (peak, limiter) = (&peak, &limiter);
                let _ = admission
                    .execute(&AdmitContext::default(), move || async move {
                        peak.fetch_max(limiter.in_flight(), Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok::<_, AdmissionError<TestError>>(())
                    })
                    .await;
            }
        })
    });
    for task in join_all(tasks).await {
        task.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(limiter.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sliding_window_holds_under_hammering() {
    let clock = ManualClock::starting_at(1_000);
    let store = MemoryWindowStore::new().with_clock(clock.clone());
    let limiter = SlidingWindowLimiter::new(store, 10, Duration::from_secs(1));
    let barrier = Arc::new(Barrier::new(50));

    let tasks = (0..50).map(|_| {
        let limiter = limiter.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            limiter.admit(&AdmitContext::keyed("hot-key")).await.is_admitted()
        })
    });
    let admitted = join_all(tasks).await.into_iter().filter(|r| *r.as_ref().unwrap()).count();
    assert_eq!(admitted, 10);

    // Another key has its own window.
    assert!(limiter.admit(&AdmitContext::keyed("cold-key")).await.is_admitted());

    clock.advance(1_000);
    assert!(limiter.admit(&AdmitContext::keyed("hot-key")).await.is_admitted());
}

#[derive(Debug)]
struct UnreachableStore;

#[async_trait::async_trait]
impl WindowStore for UnreachableStore {
    async fn record_if_below(&self, _request: &WindowRequest) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn store_outage_follows_failure_policy() {
    let ctx = AdmitContext::keyed("tenant");

    let closed = Admission::new(SlidingWindowLimiter::new(UnreachableStore, 5, Duration::from_secs(1)));
    let err = closed
        .execute(&ctx, || async { Ok::<_, AdmissionError<TestError>>(()) })
        .await
        .unwrap_err();
    assert!(err.is_backend_unavailable());
    assert_eq!(err.status(), Some(StatusCode::Unavailable));

    let open = Admission::new(
        SlidingWindowLimiter::new(UnreachableStore, 5, Duration::from_secs(1))
            .with_failure_policy(FailurePolicy::FailOpen),
    );
    let result = open.execute(&ctx, || async { Ok::<_, AdmissionError<TestError>>(7) }).await;
    assert_eq!(result.unwrap(), 7);
}

#[tokio::test]
async fn expired_context_is_rejected_without_touching_the_limiter() {
    let limiter = Arc::new(ConcurrencyLimiter::new(1));
    let admission = Admission::from_arc(limiter.clone());

    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    let cancelled = AdmitContext::default().with_cancellation(token);
    let err = admission
        .execute(&cancelled, || async { Ok::<_, AdmissionError<TestError>>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::Cancelled));

    let expired = AdmitContext::default().with_deadline(tokio::time::Instant::now());
    let err = admission
        .execute(&expired, || async { Ok::<_, AdmissionError<TestError>>(()) })
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::DeadlineExceeded));
    assert_eq!(limiter.in_flight(), 0);
}
