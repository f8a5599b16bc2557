//! # Tower Admit
//!
//! `tower-admit` admits work within a rate limit and, instead of rejecting the excess,
//! parks it in a bounded pool and hands the caller a ticket to come back with.
//!
//! ## The Retry Protocol
//! Every submission to an [`AdmissionCoordinator`] ends one of three ways:
//!
//! 1. **Immediate**: the [`admit_limit::Strategy`] had room, so the work ran and its result
//!    is returned as [`Submission::Immediate`].
//! 2. **Deferred**: the limiter was full, so the work was stored and the caller receives a
//!    [`DeferredHandle`] with an id, a retry-after hint and its queue position. Calling
//!    [`AdmissionCoordinator::retry`] later admits and runs it once the limiter allows.
//! 3. **Rejected**: the limiter *and* the pool were full, so the work is refused with
//!    [`AdmitError::PoolFull`]. Older work is never dropped to make room.
//!
//! Deferred work that is neither collected nor canceled is expired after `max_residency` by
//! the sweeper ([`spawn_sweeper`]). With [`PromotionMode::Push`] a background promoter
//! ([`spawn_promoter`]) admits pending work in [`SchedulePolicy`] order instead of waiting
//! for callers to poll.
//!
//! ```rust
//! use std::num::NonZeroUsize;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use admit_limit::SlidingWindow;
//! use tower::service_fn;
//! use tower_admit::{AdmissionConfig, AdmissionCoordinator, Submission, WorkItem};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = Arc::new(SlidingWindow::new(
//!     NonZeroUsize::new(1).unwrap(),
//!     Duration::from_secs(60),
//! ));
//! let double = service_fn(|n: u32| async move { Ok::<_, tower::BoxError>(n * 2) });
//! let coordinator = AdmissionCoordinator::new(limiter, double, AdmissionConfig::default());
//!
//! let first = coordinator.submit(WorkItem::new(21)).await.unwrap();
//! assert_eq!(first, Submission::Immediate(42));
//!
//! let second = coordinator.submit(WorkItem::new(1)).await.unwrap();
//! let handle = second.deferred().unwrap();
//! assert!(handle.retry_after_secs() > 0);
//! assert_eq!(handle.queue_position, 1);
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`AdmitError`], [`Submission`] and
//!   [`StatusSnapshot`]. A deferred submission becomes `429 Too Many Requests` with
//!   `Retry-After`, `X-Request-Id` and `X-Queue-Position` headers.

mod background;
mod backoff;
mod config;
mod coordinator;
mod error;
mod item;
mod layer;
mod pool;
mod protocol;
mod scheduler;
mod service;
pub mod telemetry;


pub use background::BackgroundTask;
pub use background::spawn_promoter;
pub use background::spawn_sweeper;
pub use backoff::AdaptiveBackoff;
pub use backoff::BackoffConfig;
pub use config::AdmissionConfig;
pub use config::LimiterConfig;
pub use config::LimiterKind;
pub use config::PromotionMode;
pub use coordinator::AdmissionCoordinator;
pub use coordinator::SweepReport;
pub use error::AdmitError;
pub use error::ConfigError;
pub use item::EntryId;
pub use item::EntryState;
pub use item::EntryStatus;
pub use item::PooledEntry;
pub use item::WorkItem;
pub use layer::AdmissionLayer;
pub use pool::RequestPool;
pub use protocol::DeferredHandle;
pub use protocol::PollPolicy;
pub use protocol::RetryOutcome;
pub use protocol::StatusSnapshot;
pub use protocol::Submission;
pub use protocol::poll_until_complete;
pub use scheduler::SchedulePolicy;
pub use service::AdmissionService;
pub use service::ResponseFuture;
