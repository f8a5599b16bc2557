use std::cmp::Ordering;
use std::time::Duration;

use quanta::Instant;
use serde::Deserialize;

use crate::item::PooledEntry;

/// Order in which pending entries are offered for admission.
///
/// In configuration this is a table tagged by `kind`: `{ kind = "fifo" }` or
/// `{ kind = "priority", aging = "60s" }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulePolicy {
    /// Oldest first; ties broken by id.
    Fifo,
    /// Highest priority first, then oldest.
    ///
    /// With `aging`, an entry gains one priority level for every `aging` it has waited,
    /// which bounds how long sustained high-priority load can starve it.
    Priority {
        #[serde(default, deserialize_with = "crate::config::human_duration::option")]
        aging: Option<Duration>,
    },
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self::Priority {
            aging: Some(Duration::from_secs(60)),
        }
    }
}

impl SchedulePolicy {
    /// The priority used for ordering once aging is applied.
    pub fn effective_priority(&self, priority: i32, age: Duration) -> i64 {
        match self {
            Self::Fifo => 0,
            Self::Priority { aging: None } => priority as i64,
            Self::Priority { aging: Some(step) } => {
                let boost = age.as_nanos() / step.as_nanos().max(1);
                (priority as i64).saturating_add(i64::try_from(boost).unwrap_or(i64::MAX))
            }
        }
    }

    /// `Less` means `a` is offered for admission before `b`.
    pub fn compare<Req, T>(
        &self,
        a: &PooledEntry<Req, T>,
        b: &PooledEntry<Req, T>,
        now: Instant,
    ) -> Ordering {
        let by_age = || {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        };
        match self {
            Self::Fifo => by_age(),
            Self::Priority { .. } => {
                let a_priority = self.effective_priority(a.priority(), a.age(now));
                let b_priority = self.effective_priority(b.priority(), b.age(now));
                b_priority.cmp(&a_priority).then_with(by_age)
            }
        }
    }

    /// Advisory wait for an entry with `ahead` entries in front of it.
    ///
    /// `next_slot` is the limiter's time until its next free slot and `interval` its
    /// average admission interval. Under [`SchedulePolicy::Priority`] the estimate is
    /// discounted by [`SchedulePolicy::priority_multiplier`].
    pub fn estimate_wait(
        &self,
        next_slot: Duration,
        ahead: usize,
        interval: Duration,
        priority: i32,
    ) -> Duration {
        let queued = interval.saturating_mul(u32::try_from(ahead).unwrap_or(u32::MAX));
        let base = next_slot.saturating_add(queued);
        match self {
            Self::Fifo => base,
            Self::Priority { .. } => base.mul_f64(Self::priority_multiplier(priority)),
        }
    }

    /// `max(0.1, 1 - priority × 0.1)` with priority clamped to `[0, 10]`.
    pub fn priority_multiplier(priority: i32) -> f64 {
        let priority = priority.clamp(0, 10) as f64;
        (1.0 - priority * 0.1).max(0.1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quanta::Clock;
    use quanta::Mock;

    use super::*;
    use crate::item::EntryId;
    use crate::item::WorkItem;

    fn entry(clock: &Clock, id: &str, priority: i32) -> PooledEntry<(), ()> {
        PooledEntry::new(
            EntryId::from(id),
            WorkItem::new(()).with_priority(priority),
            clock.now(),
        )
    }

    fn clock() -> (Clock, Arc<Mock>) {
        Clock::mock()
    }

    #[test]
    fn fifo_orders_by_creation_then_id() {
        let (clock, mock) = clock();
        let first = entry(&clock, "b", 0);
        let tied = entry(&clock, "a", 9);
        mock.increment(Duration::from_secs(1));
        let later = entry(&clock, "0", 10);

        let policy = SchedulePolicy::Fifo;
        let now = clock.now();
        assert_eq!(policy.compare(&first, &later, now), Ordering::Less);
        assert_eq!(policy.compare(&tied, &first, now), Ordering::Less);
        assert_eq!(policy.compare(&later, &tied, now), Ordering::Greater);
    }

    #[test]
    fn priority_beats_age_without_aging() {
        let (clock, mock) = clock();
        let low = entry(&clock, "low", 0);
        mock.increment(Duration::from_secs(3600));
        let high = entry(&clock, "high", 1);

        let policy = SchedulePolicy::Priority { aging: None };
        assert_eq!(policy.compare(&high, &low, clock.now()), Ordering::Less);
    }

    #[test]
    fn aging_lifts_starved_entries() {
        let (clock, mock) = clock();
        let low = entry(&clock, "low", 0);
        mock.increment(Duration::from_secs(150));
        let high = entry(&clock, "high", 2);

        let policy = SchedulePolicy::Priority {
            aging: Some(Duration::from_secs(60)),
        };
        let now = clock.now();
        // 150s of waiting is worth two levels, tying with `high`; age breaks the tie.
        assert_eq!(policy.effective_priority(0, low.age(now)), 2);
        assert_eq!(policy.compare(&low, &high, now), Ordering::Less);
    }

    #[test]
    fn priority_multiplier_is_clamped() {
        assert_eq!(SchedulePolicy::priority_multiplier(0), 1.0);
        assert!((SchedulePolicy::priority_multiplier(5) - 0.5).abs() < 1e-9);
        assert!((SchedulePolicy::priority_multiplier(10) - 0.1).abs() < 1e-9);
        assert!((SchedulePolicy::priority_multiplier(42) - 0.1).abs() < 1e-9);
        assert_eq!(SchedulePolicy::priority_multiplier(-3), 1.0);
    }

    #[test]
    fn estimates_scale_with_queue_depth() {
        let interval = Duration::from_secs(30);
        let next_slot = Duration::from_secs(10);

        let fifo = SchedulePolicy::Fifo;
        assert_eq!(fifo.estimate_wait(next_slot, 0, interval, 7), next_slot);
        assert_eq!(
            fifo.estimate_wait(next_slot, 2, interval, 7),
            Duration::from_secs(70)
        );

        let priority = SchedulePolicy::Priority { aging: None };
        assert_eq!(
            priority.estimate_wait(next_slot, 2, interval, 5),
            Duration::from_secs(35)
        );
        assert_eq!(
            priority.estimate_wait(next_slot, 2, interval, 0),
            Duration::from_secs(70)
        );
    }
}
