use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower::BoxError;
use tower::Service;

use admit_limit::Strategy;

use crate::AdmissionCoordinator;
use crate::coordinator::PromoteStep;

const MIN_PAUSE: Duration = Duration::from_millis(1);

/// A running background task.
///
/// [`shutdown`](Self::shutdown) stops it after its current step. Dropping the handle
/// aborts it instead.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    fn spawn<F>(name: &'static str, task: impl FnOnce(oneshot::Receiver<()>) -> F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (stop, stopped) = oneshot::channel();
        Self {
            name,
            stop: Some(stop),
            handle: Some(tokio::spawn(task(stopped))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Ask the task to stop and wait until it has.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.await
        {
            tracing::warn!(task = self.name, error = %err, "background task did not stop cleanly");
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Run [`AdmissionCoordinator::sweep_expired`] every `sweep_interval`.
pub fn spawn_sweeper<L, S, Req, T>(
    coordinator: Arc<AdmissionCoordinator<L, S, Req, T>>,
) -> BackgroundTask
where
    L: Strategy + ?Sized + Send + Sync + 'static,
    S: Send + Sync + 'static,
    Req: Send + 'static,
    T: Send + Sync + 'static,
{
    let period = coordinator.config().sweep_interval;

    BackgroundTask::spawn("sweeper", move |mut stopped| async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(period_ms = period.as_millis() as u64, "started pool sweeper");

        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = ticker.tick() => {
                    coordinator.sweep_expired();
                }
            }
        }

        tracing::info!("stopped pool sweeper");
    })
}

/// Admit pending work in scheduling order, on callers' behalf.
///
/// Pair this with [`PromotionMode::Push`](crate::PromotionMode::Push), so that new
/// submissions queue behind pending work instead of racing the promoter for capacity.
/// While the limiter is full the promoter sleeps for its retry hint, capped at
/// `sweep_interval`; while nothing is pending it waits for the next submission.
pub fn spawn_promoter<L, S, Req, T>(
    coordinator: Arc<AdmissionCoordinator<L, S, Req, T>>,
) -> BackgroundTask
where
    L: Strategy + ?Sized + Send + Sync + 'static,
    S: Service<Req, Response = T, Error = BoxError> + Clone + Send + Sync + 'static,
    S::Future: Send,
    Req: Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    let idle_recheck = coordinator.config().sweep_interval;

    BackgroundTask::spawn("promoter", move |mut stopped| async move {
        tracing::info!("started deferred request promoter");

        loop {
            let pause = match coordinator.promote_next().await {
                PromoteStep::Progressed => {
                    if !matches!(stopped.try_recv(), Err(TryRecvError::Empty)) {
                        break;
                    }
                    continue;
                }
                PromoteStep::Throttled(retry_after) => {
                    Some(retry_after.clamp(MIN_PAUSE, idle_recheck.max(MIN_PAUSE)))
                }
                PromoteStep::Idle => None,
            };

            let arrived = coordinator.pool().arrived().notified();
            match pause {
                Some(pause) => {
                    tokio::select! {
                        _ = &mut stopped => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = &mut stopped => break,
                        _ = arrived => {}
                        _ = tokio::time::sleep(idle_recheck) => {}
                    }
                }
            }
        }

        tracing::info!("stopped deferred request promoter");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_waits_for_the_task() {
        let task = BackgroundTask::spawn("test", |stopped| async move {
            let _ = stopped.await;
        });

        assert_eq!(task.name(), "test");
        assert!(!task.is_finished());
        task.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_the_handle_aborts_the_task() {
        let (tx, rx) = oneshot::channel::<()>();
        let task = BackgroundTask::spawn("test", |_stopped| async move {
            // Holds `tx` until aborted.
            let _tx = tx;
            std::future::pending::<()>().await;
        });

        drop(task);
        assert!(rx.await.is_err());
    }
}
