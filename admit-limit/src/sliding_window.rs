use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use quanta::Clock;
use quanta::Instant;

use super::Reason;
use super::Strategy;

/// A Sliding Log implementation.
///
/// Every admission instant is kept until it is `period` old. An admission is allowed
/// while fewer than `capacity` instants fall inside the half-open window
/// `(now - period, now]`. Pruning, the capacity check and the append all happen under
/// one lock, so the count can never be exceeded by racing callers.
#[derive(Debug)]
pub struct SlidingWindow {
    capacity: usize,
    period: Duration,
    /// Admission instants, oldest first
    log: Mutex<VecDeque<Instant>>,
    clock: Clock,
}

impl SlidingWindow {
    pub fn new(capacity: NonZeroUsize, period: Duration) -> Self {
        Self::with_clock(capacity, period, Clock::new())
    }

    /// Create a window that reads time from `clock`.
    ///
    /// Use `quanta::Clock::mock()` to drive the window deterministically.
    pub fn with_clock(capacity: NonZeroUsize, period: Duration, clock: Clock) -> Self {
        Self {
            capacity: capacity.get(),
            period,
            log: Mutex::new(VecDeque::with_capacity(capacity.get())),
            clock,
        }
    }

    /// Lock the window, pruned as of now.
    ///
    /// The returned guard holds the window lock, so a `can_process()` followed by a
    /// `record()` on the same guard is a single critical section.
    pub fn lock(&self) -> WindowGuard<'_> {
        let mut log = self.log.lock();
        // Read the clock under the lock so the log stays ordered.
        let now = self.clock.now();
        while let Some(oldest) = log.front() {
            if now.saturating_duration_since(*oldest) >= self.period {
                log.pop_front();
            } else {
                break;
            }
        }
        WindowGuard {
            log,
            now,
            capacity: self.capacity,
            period: self.period,
        }
    }

    /// Number of admissions currently inside the window.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to a pruned [`SlidingWindow`].
#[derive(Debug)]
pub struct WindowGuard<'a> {
    log: MutexGuard<'a, VecDeque<Instant>>,
    now: Instant,
    capacity: usize,
    period: Duration,
}

impl WindowGuard<'_> {
    /// The instant the guard was taken. Recorded admissions use this instant.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn can_process(&self) -> bool {
        self.fits(1)
    }

    /// Whether `permits` more admissions fit in the window.
    pub fn fits(&self, permits: usize) -> bool {
        permits <= self.capacity.saturating_sub(self.log.len())
    }

    /// Commit one admission at [`WindowGuard::now`].
    ///
    /// This does not check capacity; pair it with `can_process()` on the same guard.
    pub fn record(&mut self) {
        self.log.push_back(self.now);
    }

    /// Time until `permits` more admissions would fit.
    ///
    /// Returns the full period when `permits` exceeds the capacity, as such a request
    /// can never fit.
    pub fn retry_after_for(&self, permits: usize) -> Duration {
        if self.fits(permits) {
            return Duration::ZERO;
        }
        if permits > self.capacity {
            return self.period;
        }
        // The admission that must expire before `permits` fit.
        let blocking = self.log.len().saturating_add(permits) - self.capacity - 1;
        match self.log.get(blocking) {
            Some(at) => self
                .period
                .saturating_sub(self.now.saturating_duration_since(*at)),
            None => self.period,
        }
    }
}

impl Strategy for SlidingWindow {
    fn can_process(&self) -> bool {
        self.lock().can_process()
    }

    #[inline]
    fn try_acquire(&self, permits: usize) -> ControlFlow<Reason> {
        let mut guard = self.lock();
        if guard.fits(permits) {
            for _ in 0..permits {
                guard.record();
            }
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(Reason::Overloaded {
                retry_after: guard.retry_after_for(permits),
            })
        }
    }

    fn retry_after(&self) -> Duration {
        self.lock().retry_after_for(1)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn name(&self) -> &'static str {
        "sliding_window"
    }
}
