use crate::context::AdmitContext;
use crate::error::AdmissionError;
use crate::rate_limit::{decide, CompletionGuard, Limiter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Derives the [`AdmitContext`] for a request.
pub trait ContextExtractor<Req>: Send + Sync {
    fn extract(&self, req: &Req) -> AdmitContext;
}

/// Gives every request an empty context (global key, no deadline).
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultContext;

impl<Req> ContextExtractor<Req> for DefaultContext {
    fn extract(&self, _req: &Req) -> AdmitContext {
        AdmitContext::default()
    }
}

impl<Req, F> ContextExtractor<Req> for F
where
    F: Fn(&Req) -> AdmitContext + Send + Sync,
{
    fn extract(&self, req: &Req) -> AdmitContext {
        self(req)
    }
}

/// A layer that gates requests through a [`Limiter`].
#[derive(Debug)]
pub struct AdmissionLayer<L: ?Sized, X = DefaultContext> {
    limiter: Arc<L>,
    extractor: Arc<X>,
}

impl<L: ?Sized, X> Clone for AdmissionLayer<L, X> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), extractor: self.extractor.clone() }
    }
}

impl<L: Limiter> AdmissionLayer<L, DefaultContext> {
    /// Create a new admission layer.
    pub fn new(limiter: L) -> Self {
        Self::from_arc(Arc::new(limiter))
    }
}

impl<L: Limiter + ?Sized> AdmissionLayer<L, DefaultContext> {
    /// Share an existing limiter between several layers.
    pub fn from_arc(limiter: Arc<L>) -> Self {
        Self { limiter, extractor: Arc::new(DefaultContext) }
    }
}

impl<L: ?Sized, X> AdmissionLayer<L, X> {
    /// Derive each request's key, deadline and cancellation from the request itself.
    pub fn with_context<Y>(self, extractor: Y) -> AdmissionLayer<L, Y> {
        AdmissionLayer { limiter: self.limiter, extractor: Arc::new(extractor) }
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}

impl<S, L, X> Layer<S> for AdmissionLayer<L, X>
where
    L: Limiter + ?Sized + 'static,
{
    type Service = AdmissionService<S, L, X>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

/// Middleware service that enforces admission control.
#[derive(Debug)]
pub struct AdmissionService<S, L: ?Sized, X = DefaultContext> {
    inner: S,
    limiter: Arc<L>,
    extractor: Arc<X>,
}

impl<S: Clone, L: ?Sized, X> Clone for AdmissionService<S, L, X> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

impl<S, L, X, Req> Service<Req> for AdmissionService<S, L, X>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    L: Limiter + ?Sized + 'static,
    X: ContextExtractor<Req> + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let ctx = self.extractor.extract(&req);
        // Keep the instance that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            decide(&*limiter, &ctx).await.into_result()?;
            let _guard = CompletionGuard::new(limiter);
            inner.call(req).await.map_err(AdmissionError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::strategies::ConcurrencyLimiter;
    use crate::rate_limit::RejectReason;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    #[tokio::test]
    async fn passes_admitted_requests_through() {
        let layer = AdmissionLayer::new(ConcurrencyLimiter::new(2));
        let svc = layer.layer(service_fn(|req: u32| async move { Ok::<_, Infallible>(req * 2) }));
        assert_eq!(svc.oneshot(21).await.unwrap(), 42);
        assert_eq!(layer.limiter().in_flight(), 0);
    }

    #[tokio::test]
    async fn rejects_without_calling_inner() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let held = limiter.try_acquire().expect("slot available");
        let calls = Arc::new(AtomicUsize::new(0));

        let layer = AdmissionLayer::from_arc(limiter.clone());
        let calls_clone = calls.clone();
        let svc = layer.layer(service_fn(move |_: ()| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), Infallible>(()) }
        }));
        let err = svc.oneshot(()).await.unwrap_err();
        assert_eq!(err.reject_reason(), Some(RejectReason::ConcurrencyLimit));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(held);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn extractor_supplies_cancellation() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let layer = AdmissionLayer::new(ConcurrencyLimiter::new(8)).with_context(
            move |_: &String| AdmitContext::keyed("svc/method").with_cancellation(token.clone()),
        );
        let svc = layer.layer(service_fn(|req: String| async move { Ok::<_, Infallible>(req) }));
        let err = svc.oneshot("hello".to_string()).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Cancelled));
    }
}
