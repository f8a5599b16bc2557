use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use quanta::Clock;
use tokio::sync::Notify;

use crate::AdmitError;
use crate::item::EntryId;
use crate::item::EntryStatus;
use crate::item::PooledEntry;
use crate::item::WorkItem;
use crate::scheduler::SchedulePolicy;

/// Bounded, concurrent store of deferred work.
///
/// Entries are keyed by [`EntryId`] in a `DashMap`, so adds, removals and lookups from
/// many callers only contend per shard. Every resident entry, terminal or not, holds one
/// of `capacity` slots.
#[derive(Debug)]
pub struct RequestPool<Req, T> {
    entries: DashMap<EntryId, Arc<PooledEntry<Req, T>>>,
    capacity: usize,
    /// Slots taken, including adds that are still inserting
    reserved: AtomicUsize,
    policy: SchedulePolicy,
    clock: Clock,
    changed: Notify,
    arrived: Notify,
}

impl<Req, T> RequestPool<Req, T> {
    pub fn new(capacity: usize, policy: SchedulePolicy) -> Self {
        Self::with_clock(capacity, policy, Clock::new())
    }

    pub fn with_clock(capacity: usize, policy: SchedulePolicy, clock: Clock) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            capacity,
            reserved: AtomicUsize::new(0),
            policy,
            clock,
            changed: Notify::new(),
            arrived: Notify::new(),
        }
    }

    /// Store `item` as a new `Pending` entry.
    ///
    /// # Errors
    ///
    /// Returns [`AdmitError::PoolFull`] if every slot is taken.
    pub fn add(&self, item: WorkItem<Req>) -> Result<Arc<PooledEntry<Req, T>>, AdmitError> {
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |taken| {
                (taken < self.capacity).then_some(taken + 1)
            })
            .map_err(|_| AdmitError::PoolFull)?;

        let now = self.clock.now();
        let entry = loop {
            let id = EntryId::generate();
            if let Entry::Vacant(slot) = self.entries.entry(id.clone()) {
                let entry = Arc::new(PooledEntry::new(id, item, now));
                slot.insert(Arc::clone(&entry));
                break entry;
            }
        };

        self.arrived.notify_one();
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PooledEntry<Req, T>>> {
        self.entries.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove an entry. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) -> Option<Arc<PooledEntry<Req, T>>> {
        let (_, entry) = self.entries.remove(id)?;
        self.reserved.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
        Some(entry)
    }

    /// The pending entry the scheduling policy would admit next.
    pub fn next_pending(&self) -> Option<Arc<PooledEntry<Req, T>>> {
        let now = self.clock.now();
        self.pending()
            .into_iter()
            .min_by(|a, b| self.policy.compare(a, b, now))
    }

    /// 1-based position of `entry` among pending entries, or `None` if it is not pending.
    pub fn position(&self, entry: &PooledEntry<Req, T>) -> Option<usize> {
        if entry.status() != EntryStatus::Pending {
            return None;
        }
        let now = self.clock.now();
        let ahead = self
            .pending()
            .iter()
            .filter(|other| other.id() != entry.id())
            .filter(|other| self.policy.compare(other, entry, now).is_lt())
            .count();
        Some(ahead + 1)
    }

    /// Copies of every resident entry.
    pub fn snapshot(&self) -> Vec<Arc<PooledEntry<Req, T>>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn pending(&self) -> Vec<Arc<PooledEntry<Req, T>>> {
        let mut pending = self.snapshot();
        pending.retain(|entry| entry.status() == EntryStatus::Pending);
        pending
    }

    /// Resident entries, including terminal ones not yet collected.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_full(&self) -> bool {
        self.reserved.load(Ordering::SeqCst) >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Signalled when an entry reaches a terminal state or leaves the pool.
    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Signalled when a new entry is added.
    pub(crate) fn arrived(&self) -> &Notify {
        &self.arrived
    }
}
