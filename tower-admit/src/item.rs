use std::borrow::Borrow;
use std::fmt;
use std::fmt::Display;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::RwLock;
use parking_lot::RwLockWriteGuard;
use quanta::Instant;
use serde::Serialize;
use uuid::Uuid;

/// A unit of work submitted for admission.
#[derive(Debug, Clone)]
pub struct WorkItem<Req> {
    payload: Req,
    priority: i32,
    cost: usize,
    client: Option<String>,
}

impl<Req> WorkItem<Req> {
    pub fn new(payload: Req) -> Self {
        Self {
            payload,
            priority: 0,
            cost: 1,
            client: None,
        }
    }

    /// Higher values are more urgent.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Number of admissions this work consumes. Zero is treated as one.
    pub fn with_cost(mut self, cost: usize) -> Self {
        self.cost = cost.max(1);
        self
    }

    /// Identify the caller, so retry hints can back off per client.
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    pub fn payload(&self) -> &Req {
        &self.payload
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn cost(&self) -> usize {
        self.cost
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    pub fn into_payload(self) -> Req {
        self.payload
    }
}

/// Opaque, process-unique identifier of a deferred entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for EntryId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle status of a pooled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
    Expired,
}

impl EntryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }

    /// Whether `next` is a legal forward step from `self`.
    pub fn can_advance_to(self, next: EntryStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Canceled | Self::Expired)
                | (Self::Processing, Self::Completed | Self::Failed)
        )
    }
}

impl Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
            Self::Expired => "Expired",
        };
        f.write_str(name)
    }
}

/// An entry's status together with its outcome.
///
/// The result lives inside the terminal variant, so a status and its result are always
/// updated together.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryState<T> {
    Pending,
    Processing,
    Completed(T),
    Failed(String),
    Canceled,
    Expired,
}

impl<T> EntryState<T> {
    pub fn status(&self) -> EntryStatus {
        match self {
            Self::Pending => EntryStatus::Pending,
            Self::Processing => EntryStatus::Processing,
            Self::Completed(_) => EntryStatus::Completed,
            Self::Failed(_) => EntryStatus::Failed,
            Self::Canceled => EntryStatus::Canceled,
            Self::Expired => EntryStatus::Expired,
        }
    }
}

/// A deferred [`WorkItem`] held by the [`RequestPool`](crate::RequestPool).
#[derive(Debug)]
pub struct PooledEntry<Req, T> {
    id: EntryId,
    created_at: Instant,
    priority: i32,
    cost: usize,
    client: Option<String>,
    payload: Mutex<Option<Req>>,
    state: RwLock<EntryState<T>>,
    finished_at: OnceLock<Instant>,
    delivered: AtomicBool,
}

impl<Req, T> PooledEntry<Req, T> {
    pub(crate) fn new(id: EntryId, item: WorkItem<Req>, created_at: Instant) -> Self {
        Self {
            id,
            created_at,
            priority: item.priority,
            cost: item.cost,
            client: item.client,
            payload: Mutex::new(Some(item.payload)),
            state: RwLock::new(EntryState::Pending),
            finished_at: OnceLock::new(),
            delivered: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn cost(&self) -> usize {
        self.cost
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn status(&self) -> EntryStatus {
        self.state.read().status()
    }

    /// A consistent copy of the entry's status and outcome.
    pub fn state(&self) -> EntryState<T>
    where
        T: Clone,
    {
        self.state.read().clone()
    }

    /// Read the payload, if it has not been handed to the processor yet.
    pub fn with_payload<R>(&self, f: impl FnOnce(&Req) -> R) -> Option<R> {
        self.payload.lock().as_ref().map(f)
    }

    pub(crate) fn take_payload(&self) -> Option<Req> {
        self.payload.lock().take()
    }

    /// When the entry reached a terminal state.
    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at.get().copied()
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    pub(crate) fn mark_delivered(&self) {
        self.delivered.store(true, Ordering::Release);
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, EntryState<T>> {
        self.state.write()
    }

    /// Move to `next`, failing with the current status if that is not a forward step.
    pub(crate) fn transition(&self, next: EntryState<T>, now: Instant) -> Result<(), EntryStatus> {
        let mut state = self.state.write();
        self.advance(&mut state, next, now)
    }

    /// As [`PooledEntry::transition`], for callers already holding the state lock.
    pub(crate) fn advance(
        &self,
        state: &mut EntryState<T>,
        next: EntryState<T>,
        now: Instant,
    ) -> Result<(), EntryStatus> {
        let current = state.status();
        if !current.can_advance_to(next.status()) {
            return Err(current);
        }
        if next.status().is_terminal() {
            let _ = self.finished_at.set(now);
        }
        *state = next;
        Ok(())
    }
}
