use std::time::Duration;

use tokio::time::Instant;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;

use admit_limit::Strategy;

use crate::AdmissionCoordinator;
use crate::AdmitError;
use crate::item::EntryId;
use crate::item::EntryStatus;

/// The outcome of [`AdmissionCoordinator::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Submission<T> {
    /// Admitted and processed within the call.
    Immediate(T),
    /// Not admitted yet. Come back after `retry_after`.
    Deferred(DeferredHandle),
}

impl<T> Submission<T> {
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate(_))
    }

    pub fn deferred(&self) -> Option<&DeferredHandle> {
        match self {
            Self::Immediate(_) => None,
            Self::Deferred(handle) => Some(handle),
        }
    }
}

/// What a caller needs to come back for deferred work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredHandle {
    pub id: EntryId,
    /// Do not retry before this much time has passed.
    pub retry_after: Duration,
    /// 1-based position in the scheduling order when the handle was issued.
    pub queue_position: usize,
    /// Advisory; never used for admission decisions.
    pub estimated_wait: Duration,
}

impl DeferredHandle {
    /// `retry_after` in whole seconds, rounded up and never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.retry_after).max(1)
    }
}

/// The outcome of [`AdmissionCoordinator::retry`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Completed(T),
    Failed(String),
    /// Not admitted yet, or still being processed.
    StillPending {
        status: EntryStatus,
        retry_after: Duration,
        queue_position: Option<usize>,
    },
}

/// A read-only view of an entry, as returned by [`AdmissionCoordinator::status`].
#[derive(Debug, Clone, PartialEq)]
pub enum StatusSnapshot<T> {
    Pending {
        queue_position: usize,
        estimated_wait: Duration,
    },
    Processing,
    Completed(T),
    Failed(String),
    NotFound,
}

impl<T> StatusSnapshot<T> {
    /// Whether the entry can still change.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending { .. } | Self::Processing)
    }
}

/// How [`poll_until_complete`] paces and bounds its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Stop with [`AdmitError::GaveUp`] once the next retry would land past this.
    pub give_up_after: Duration,
    /// Never retry sooner than this, whatever the hint says.
    pub min_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            give_up_after: Duration::from_secs(300),
            min_interval: Duration::from_millis(100),
        }
    }
}

/// Drive deferred work to completion from the caller's side.
///
/// Calls [`AdmissionCoordinator::retry`] no sooner than the returned hint, until the work
/// completes, fails, disappears, or the policy gives up.
pub async fn poll_until_complete<L, S, Req, T>(
    coordinator: &AdmissionCoordinator<L, S, Req, T>,
    id: &EntryId,
    policy: PollPolicy,
) -> Result<T, AdmitError>
where
    L: Strategy + ?Sized + Send + Sync,
    S: Service<Req, Response = T, Error = BoxError> + Clone + Send + Sync,
    S::Future: Send,
    Req: Send,
    T: Clone + Send + Sync,
{
    let deadline = Instant::now() + policy.give_up_after;
    loop {
        match coordinator.retry(id.as_str()).await? {
            RetryOutcome::Completed(result) => return Ok(result),
            RetryOutcome::Failed(message) => return Err(AdmitError::Processing(message)),
            RetryOutcome::StillPending { retry_after, .. } => {
                let pause = retry_after.max(policy.min_interval);
                if Instant::now() + pause > deadline {
                    return Err(AdmitError::GaveUp { id: id.clone() });
                }
                tracing::trace!(%id, pause_ms = pause.as_millis() as u64, "still pending");
                sleep(pause).await;
            }
        }
    }
}

pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

#[cfg(feature = "axum")]
mod http {
    use axum::Json;
    use axum::http::HeaderValue;
    use axum::http::StatusCode;
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::response::Response;
    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct DeferredBody<'a> {
        id: &'a EntryId,
        retry_after_seconds: u64,
        queue_position: usize,
        estimated_wait_seconds: u64,
    }

    #[derive(Serialize)]
    #[serde(tag = "status")]
    enum StatusBody<'a, T> {
        Pending {
            queue_position: usize,
            estimated_wait_seconds: u64,
        },
        Processing,
        Completed {
            data: &'a T,
        },
        Failed {
            error: &'a str,
        },
    }

    /// `429 Too Many Requests` with `Retry-After`, `X-Request-Id` and `X-Queue-Position`.
    impl IntoResponse for DeferredHandle {
        fn into_response(self) -> Response {
            let body = DeferredBody {
                id: &self.id,
                retry_after_seconds: self.retry_after_secs(),
                queue_position: self.queue_position,
                estimated_wait_seconds: ceil_secs(self.estimated_wait),
            };
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();

            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(self.retry_after_secs()));
            if let Ok(id) = HeaderValue::from_str(self.id.as_str()) {
                headers.insert("x-request-id", id);
            }
            headers.insert("x-queue-position", HeaderValue::from(self.queue_position));
            response
        }
    }

    impl<T: Serialize> IntoResponse for Submission<T> {
        fn into_response(self) -> Response {
            match self {
                Self::Immediate(data) => (StatusCode::OK, Json(data)).into_response(),
                Self::Deferred(handle) => handle.into_response(),
            }
        }
    }

    /// `202 Accepted` while in flight, `200 OK` once terminal, `404 Not Found` if unknown.
    impl<T: Serialize> IntoResponse for StatusSnapshot<T> {
        fn into_response(self) -> Response {
            match &self {
                Self::Pending {
                    queue_position,
                    estimated_wait,
                } => (
                    StatusCode::ACCEPTED,
                    Json(StatusBody::<T>::Pending {
                        queue_position: *queue_position,
                        estimated_wait_seconds: ceil_secs(*estimated_wait),
                    }),
                )
                    .into_response(),
                Self::Processing => {
                    (StatusCode::ACCEPTED, Json(StatusBody::<T>::Processing)).into_response()
                }
                Self::Completed(data) => {
                    (StatusCode::OK, Json(StatusBody::Completed { data })).into_response()
                }
                Self::Failed(error) => {
                    (StatusCode::OK, Json(StatusBody::<T>::Failed { error })).into_response()
                }
                Self::NotFound => StatusCode::NOT_FOUND.into_response(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(retry_after: Duration) -> DeferredHandle {
        DeferredHandle {
            id: EntryId::from("abc"),
            retry_after,
            queue_position: 1,
            estimated_wait: Duration::ZERO,
        }
    }

    #[test]
    fn retry_after_rounds_up_to_whole_seconds() {
        assert_eq!(handle(Duration::from_secs(50)).retry_after_secs(), 50);
        assert_eq!(handle(Duration::from_millis(50_001)).retry_after_secs(), 51);
        assert_eq!(handle(Duration::from_millis(1)).retry_after_secs(), 1);
        // A deferred caller is never told to come back immediately.
        assert_eq!(handle(Duration::ZERO).retry_after_secs(), 1);
    }

    #[test]
    fn only_pending_and_processing_are_in_flight() {
        let pending: StatusSnapshot<()> = StatusSnapshot::Pending {
            queue_position: 1,
            estimated_wait: Duration::ZERO,
        };
        assert!(pending.is_in_flight());
        assert!(StatusSnapshot::<()>::Processing.is_in_flight());
        assert!(!StatusSnapshot::Completed(()).is_in_flight());
        assert!(!StatusSnapshot::<()>::Failed("x".into()).is_in_flight());
        assert!(!StatusSnapshot::<()>::NotFound.is_in_flight());
    }

    #[test]
    fn submission_accessors() {
        let immediate: Submission<u8> = Submission::Immediate(1);
        assert!(immediate.is_immediate());
        assert!(immediate.deferred().is_none());

        let deferred: Submission<u8> = Submission::Deferred(handle(Duration::from_secs(3)));
        assert_eq!(deferred.deferred().map(|h| h.queue_position), Some(1));
    }
}
