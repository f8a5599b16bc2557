//! # admit-limit
//!
//! `admit-limit` provides the admission strategies used to decide whether a unit of work
//! may run *now* or must be deferred.
//!
//! ## Core Philosophy
//!
//! An admission decision is only useful if it is exact under contention. Every strategy
//! fuses the capacity check and the commit into a single operation,
//! [`Strategy::try_acquire`], so two callers can never both observe the last free slot
//! and both take it.
//!
//! ## Key Concepts
//!
//! * **Hard capacity**: [`SlidingWindow`] keeps the exact admission log, so no rolling
//!   window of length `period` ever holds more than `capacity` admissions.
//! * **Read-only probes**: [`Strategy::can_process`] and [`Strategy::retry_after`] never
//!   record an admission, so callers may ask without committing.
//! * **Injectable time**: strategies read time from a [`quanta::Clock`], which tests can
//!   replace with `Clock::mock()`.
//!
//! ## Example
//!
//! ```rust
//! use admit_limit::SlidingWindow;
//! use admit_limit::Strategy;
//! use std::time::Duration;
//! use std::num::NonZeroUsize;
//!
//! let limit = NonZeroUsize::new(2).unwrap();
//! let window = SlidingWindow::new(limit, Duration::from_secs(60));
//!
//! assert!(window.try_acquire(1).is_continue());
//! assert!(window.try_acquire(1).is_continue());
//! assert!(window.try_acquire(1).is_break());
//! assert!(window.retry_after() > Duration::ZERO);
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

mod sliding_window;
mod token_bucket;

pub use sliding_window::SlidingWindow;
pub use sliding_window::WindowGuard;
pub use token_bucket::TokenBucket;

/// Reasons why an admission might be refused by a strategy.
#[derive(Debug, PartialEq)]
pub enum Reason {
    Overloaded { retry_after: Duration },
}

/// The core trait for all admission algorithms.
///
/// Strategies are shared across threads via `Arc`, so implementations keep all
/// mutable state behind atomics or locks.
pub trait Strategy: Debug {
    /// Returns whether `1` more admission would currently be allowed.
    ///
    /// This never records an admission.
    fn can_process(&self) -> bool;

    /// Atomically checks capacity for `permits` admissions and records them.
    ///
    /// # Errors
    ///
    /// Returns `Reason` if the admissions do not fit. Nothing is recorded in that case.
    fn try_acquire(&self, permits: usize) -> ControlFlow<Reason>;

    /// Time until the next admission slot frees up. Zero if one is available now.
    fn retry_after(&self) -> Duration;

    /// The maximum number of admissions per period.
    fn capacity(&self) -> usize;

    /// The period over which `capacity` applies.
    fn period(&self) -> Duration;

    /// A short, stable name used to label logs and metrics.
    fn name(&self) -> &'static str;

    /// Average interval between admissions when the strategy runs at capacity.
    fn admission_interval(&self) -> Duration {
        let capacity = self.capacity().max(1) as u128;
        Duration::from_nanos((self.period().as_nanos() / capacity) as u64)
    }
}
