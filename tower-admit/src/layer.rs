use std::marker::PhantomData;
use std::sync::Arc;

use quanta::Clock;
use tower::Layer;
use tower::Service;

use admit_limit::Strategy;

use crate::AdmissionConfig;
use crate::AdmissionCoordinator;
use crate::service::AdmissionService;

/// Wraps a processing service in an [`AdmissionCoordinator`].
///
/// Each call to [`Layer::layer`] builds a new coordinator with its own pool, sharing the
/// layer's limiter.
#[derive(Debug)]
pub struct AdmissionLayer<L, Req>
where
    L: ?Sized,
{
    limiter: Arc<L>,
    config: AdmissionConfig,
    clock: Clock,
    _phantom: PhantomData<fn(Req)>,
}

// Note: Deriving Clone would require `L: Clone` and `Req: Clone`.
impl<L, Req> Clone for AdmissionLayer<L, Req>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            config: self.config.clone(),
            clock: self.clock.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<L, Req> AdmissionLayer<L, Req>
where
    L: Strategy + ?Sized,
{
    pub fn new(limiter: Arc<L>, config: AdmissionConfig) -> Self {
        Self {
            limiter,
            config,
            clock: Clock::new(),
            _phantom: PhantomData,
        }
    }

    /// Use `clock` for residency and backoff timing.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

impl<L, S, Req> Layer<S> for AdmissionLayer<L, Req>
where
    L: Strategy + ?Sized,
    S: Service<Req>,
{
    type Service = AdmissionService<L, S, Req, S::Response>;

    fn layer(&self, inner: S) -> Self::Service {
        let coordinator = AdmissionCoordinator::with_clock(
            Arc::clone(&self.limiter),
            inner,
            self.config.clone(),
            self.clock.clone(),
        );
        AdmissionService::new(Arc::new(coordinator))
    }
}
