use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

use super::Reason;
use super::Strategy;

/// A Token Bucket implementation.
///
/// The bucket starts full and gains `increment` tokens every `interval`, up to
/// `capacity`. Each admission takes one token per permit.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: usize,
    remaining: AtomicUsize,
    interval_ns: u64,
    /// Nanos from anchor of the last refill boundary
    last: AtomicU64,
    increment: usize,
    clock: Clock,
    anchor: Instant,
}

impl Strategy for TokenBucket {
    fn can_process(&self) -> bool {
        self.refill();
        self.remaining.load(Ordering::Acquire) > 0
    }

    fn try_acquire(&self, permits: usize) -> ControlFlow<Reason> {
        self.refill();
        let taken = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |val| {
                val.checked_sub(permits)
            });

        match taken {
            Ok(_) => ControlFlow::Continue(()),
            Err(remaining) => ControlFlow::Break(Reason::Overloaded {
                retry_after: self.wait_for(permits, remaining),
            }),
        }
    }

    fn retry_after(&self) -> Duration {
        self.refill();
        self.wait_for(1, self.remaining.load(Ordering::Acquire))
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn period(&self) -> Duration {
        let nanos = self.interval_ns as u128 * self.capacity as u128 / self.increment as u128;
        Duration::from_nanos(nanos as u64)
    }

    fn name(&self) -> &'static str {
        "token_bucket"
    }
}

impl TokenBucket {
    pub fn new(capacity: NonZeroUsize, increment: NonZeroUsize, interval: Duration) -> Self {
        Self::with_clock(capacity, increment, interval, Clock::new())
    }

    pub fn with_clock(
        capacity: NonZeroUsize,
        increment: NonZeroUsize,
        interval: Duration,
        clock: Clock,
    ) -> Self {
        let anchor = clock.now();
        Self {
            capacity: capacity.get(),
            remaining: AtomicUsize::new(capacity.get()),
            interval_ns: (interval.as_nanos() as u64).max(1),
            last: AtomicU64::new(0),
            increment: increment.get(),
            clock,
            anchor,
        }
    }

    fn elapsed_ns(&self) -> u64 {
        self.clock
            .now()
            .saturating_duration_since(self.anchor)
            .as_nanos() as u64
    }

    fn refill(&self) {
        let now = self.elapsed_ns();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let intervals_passed = now.saturating_sub(last) / self.interval_ns;
            if intervals_passed == 0 {
                return;
            }
            // Advance the clock by the exact intervals consumed, keeping the remainder.
            let next = last + intervals_passed * self.interval_ns;
            match self
                .last
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => {
                    let added = (intervals_passed as usize).saturating_mul(self.increment);
                    let _ = self
                        .remaining
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |val| {
                            Some(val.saturating_add(added).min(self.capacity))
                        });
                    return;
                }
                // Somebody else refilled; re-evaluate against their boundary.
                Err(actual) => last = actual,
            }
        }
    }

    fn wait_for(&self, permits: usize, remaining: usize) -> Duration {
        if permits <= remaining {
            return Duration::ZERO;
        }
        if permits > self.capacity {
            return self.period();
        }
        let missing = (permits - remaining) as u64;
        let refills = missing.div_ceil(self.increment as u64);
        let into_interval = self
            .elapsed_ns()
            .saturating_sub(self.last.load(Ordering::Acquire));
        let until_next = self.interval_ns.saturating_sub(into_interval);
        Duration::from_nanos(until_next + (refills - 1) * self.interval_ns)
    }
}
