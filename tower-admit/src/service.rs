use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use tower::BoxError;
use tower::Service;

use admit_limit::Strategy;

use crate::AdmissionCoordinator;
use crate::item::WorkItem;
use crate::protocol::Submission;

pub type ResponseFuture<T> =
    Pin<Box<dyn Future<Output = Result<Submission<T>, BoxError>> + Send + 'static>>;

/// An [`AdmissionCoordinator`] presented as a `tower` service.
///
/// The service is always ready: work that cannot run yet comes back as
/// [`Submission::Deferred`] rather than holding the caller in `poll_ready`.
#[derive(Debug)]
pub struct AdmissionService<L, S, Req, T>
where
    L: ?Sized,
{
    coordinator: Arc<AdmissionCoordinator<L, S, Req, T>>,
}

// Manually implement Clone so `S`, `Req` and `T` need not be Clone
impl<L, S, Req, T> Clone for AdmissionService<L, S, Req, T>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

impl<L, S, Req, T> AdmissionService<L, S, Req, T>
where
    L: ?Sized,
{
    pub fn new(coordinator: Arc<AdmissionCoordinator<L, S, Req, T>>) -> Self {
        Self { coordinator }
    }

    /// The shared coordinator, for `retry`, `status` and `cancel`.
    pub fn coordinator(&self) -> &Arc<AdmissionCoordinator<L, S, Req, T>> {
        &self.coordinator
    }
}

impl<L, S, Req, T> Service<WorkItem<Req>> for AdmissionService<L, S, Req, T>
where
    L: Strategy + ?Sized + Send + Sync + 'static,
    S: Service<Req, Response = T, Error = BoxError> + Clone + Send + Sync + 'static,
    S::Future: Send,
    Req: Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    type Response = Submission<T>;
    type Error = BoxError;
    type Future = ResponseFuture<T>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, item: WorkItem<Req>) -> Self::Future {
        let coordinator = Arc::clone(&self.coordinator);
        Box::pin(async move { coordinator.submit(item).await.map_err(BoxError::from) })
    }
}
