use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use quanta::Clock;
use tower::BoxError;
use tower::Service;
use tower::ServiceExt;

use admit_limit::Reason;
use admit_limit::Strategy;

use crate::AdmitError;
use crate::backoff::AdaptiveBackoff;
use crate::config::AdmissionConfig;
use crate::config::PromotionMode;
use crate::item::EntryId;
use crate::item::EntryState;
use crate::item::EntryStatus;
use crate::item::PooledEntry;
use crate::item::WorkItem;
use crate::pool::RequestPool;
use crate::protocol::DeferredHandle;
use crate::protocol::RetryOutcome;
use crate::protocol::StatusSnapshot;
use crate::protocol::Submission;
use crate::protocol::ceil_secs;

#[derive(Clone, Debug)]
struct CoordinatorMetrics {
    admitted: Counter<u64>,
    deferred: Counter<u64>,
    rejected: Counter<u64>,
    promoted: Counter<u64>,
    expired: Counter<u64>,
    canceled: Counter<u64>,
    processing_failed: Counter<u64>,
}

impl CoordinatorMetrics {
    fn new() -> Self {
        let meter = global::meter("admission_coordinator");
        Self {
            admitted: meter.u64_counter("admitted").build(),
            deferred: meter.u64_counter("deferred").build(),
            rejected: meter.u64_counter("rejected").build(),
            promoted: meter.u64_counter("promoted").build(),
            expired: meter.u64_counter("expired").build(),
            canceled: meter.u64_counter("canceled").build(),
            processing_failed: meter.u64_counter("processing_failed").build(),
        }
    }
}

/// What one pass of [`AdmissionCoordinator::sweep_expired`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending entries that outlived `max_residency`.
    pub expired: usize,
    /// Terminal entries removed after their retention.
    pub collected: usize,
    /// Idle clients dropped from the adaptive backoff.
    pub evicted_clients: usize,
}

/// What the push promoter did on one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PromoteStep {
    /// Nothing is pending.
    Idle,
    /// The limiter has no room for the next entry yet.
    Throttled(Duration),
    /// An entry was processed, expired, or lost a race. Look again straight away.
    Progressed,
}

enum Admission<Req, T> {
    Settled(EntryState<T>),
    Waiting(EntryStatus, Duration),
    Expired,
    Admitted(Option<Req>),
}

/// Marks an entry `Failed` if its processing future is dropped before it finishes.
struct InFlight<'a, Req, T> {
    entry: &'a PooledEntry<Req, T>,
    pool: &'a RequestPool<Req, T>,
    done: bool,
}

impl<Req, T> Drop for InFlight<'_, Req, T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let abandoned = EntryState::Failed("processing was abandoned".to_string());
        if self
            .entry
            .transition(abandoned, self.pool.clock().now())
            .is_ok()
        {
            tracing::warn!(id = %self.entry.id(), "processing abandoned before completion");
            self.pool.changed().notify_waiters();
        }
    }
}

/// Admits work within a rate limit, defers the rest, and lets callers collect it later.
///
/// Work passed to [`submit`](Self::submit) runs immediately when `L` has room; otherwise it
/// is parked in a bounded [`RequestPool`] and the caller gets a [`DeferredHandle`]. The
/// caller then polls [`retry`](Self::retry), which admits and runs the work as soon as the
/// limiter allows. With [`PromotionMode::Push`] a background promoter
/// ([`spawn_promoter`](crate::spawn_promoter)) admits pending work in scheduling order
/// instead, and callers collect results with `retry`, [`status`](Self::status) or
/// [`wait_for`](Self::wait_for).
///
/// `S` does the actual work. It is cloned and called with `oneshot` for each admitted item,
/// on the task that admitted it.
#[derive(Debug)]
pub struct AdmissionCoordinator<L, S, Req, T>
where
    L: ?Sized,
{
    limiter: Arc<L>,
    processor: S,
    pool: RequestPool<Req, T>,
    config: AdmissionConfig,
    backoff: Option<AdaptiveBackoff>,
    clock: Clock,
    instruments: CoordinatorMetrics,
    labels: [KeyValue; 1],
}

impl<L, S, Req, T> AdmissionCoordinator<L, S, Req, T>
where
    L: Strategy + ?Sized,
{
    pub fn new(limiter: Arc<L>, processor: S, config: AdmissionConfig) -> Self {
        Self::with_clock(limiter, processor, config, Clock::new())
    }

    /// Use `clock` for residency and backoff timing.
    ///
    /// Give the limiter the same clock, or the two will disagree about time.
    pub fn with_clock(
        limiter: Arc<L>,
        processor: S,
        config: AdmissionConfig,
        clock: Clock,
    ) -> Self {
        let pool = RequestPool::with_clock(config.pool_capacity, config.policy, clock.clone());
        let backoff = config
            .backoff
            .clone()
            .map(|backoff| AdaptiveBackoff::with_clock(backoff, clock.clone()));
        let labels = [KeyValue::new("strategy", limiter.name())];

        Self {
            limiter,
            processor,
            pool,
            config,
            backoff,
            clock,
            instruments: CoordinatorMetrics::new(),
            labels,
        }
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }

    pub fn pool(&self) -> &RequestPool<Req, T> {
        &self.pool
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Resident entries, including terminal ones waiting to be collected.
    pub fn queue_length(&self) -> usize {
        self.pool.len()
    }

    pub fn is_full(&self) -> bool {
        self.pool.is_full()
    }

    /// Whole seconds until the limiter frees a slot; zero when it has room.
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.limiter.retry_after())
    }

    /// Pool occupancy in `[0, 1]`.
    pub fn current_load(&self) -> f64 {
        let capacity = self.pool.capacity().max(1) as f64;
        (self.pool.len() as f64 / capacity).min(1.0)
    }

    /// Expire overdue pending entries and collect terminal ones past their retention.
    ///
    /// Terminal entries a caller has observed are kept for `delivered_retention` after
    /// they finished; unobserved ones for `max_residency`.
    pub fn sweep_expired(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for entry in self.pool.snapshot() {
            match entry.status() {
                EntryStatus::Pending if entry.age(now) >= self.config.max_residency => {
                    if entry.transition(EntryState::Expired, now).is_ok() {
                        self.pool.remove(entry.id().as_str());
                        report.expired += 1;
                    }
                }
                status if status.is_terminal() => {
                    let retention = if entry.is_delivered() {
                        self.config.delivered_retention
                    } else {
                        self.config.max_residency
                    };
                    let finished = entry.finished_at().unwrap_or(entry.created_at());
                    if now.saturating_duration_since(finished) >= retention {
                        self.pool.remove(entry.id().as_str());
                        report.collected += 1;
                    }
                }
                _ => {}
            }
        }

        if let Some(backoff) = &self.backoff {
            report.evicted_clients = backoff.evict_idle();
        }

        if report.expired > 0 {
            self.instruments
                .expired
                .add(report.expired as u64, &self.labels);
        }
        if report != SweepReport::default() {
            tracing::info!(
                expired = report.expired,
                collected = report.collected,
                evicted_clients = report.evicted_clients,
                remaining = self.pool.len(),
                "swept deferral pool"
            );
        }
        report
    }

    /// Cancel pending work. Only `Pending` entries can be canceled.
    pub fn cancel(&self, id: &str) -> Result<(), AdmitError> {
        let entry = self.pool.get(id).ok_or_else(|| not_found(id))?;
        entry
            .transition(EntryState::Canceled, self.clock.now())
            .map_err(|current| AdmitError::InvalidState {
                id: entry.id().clone(),
                current,
            })?;

        self.pool.remove(id);
        self.instruments.canceled.add(1, &self.labels);
        tracing::info!(%id, "canceled deferred request");
        Ok(())
    }

    fn check_cost(&self, cost: usize) -> Result<(), AdmitError> {
        let capacity = self.limiter.capacity();
        if cost > capacity {
            return Err(AdmitError::CostExceedsCapacity { cost, capacity });
        }
        Ok(())
    }

    fn estimate(
        &self,
        entry: &PooledEntry<Req, T>,
        position: usize,
        next_slot: Duration,
    ) -> Duration {
        self.config.policy.estimate_wait(
            next_slot,
            position.saturating_sub(1),
            self.limiter.admission_interval(),
            entry.priority(),
        )
    }

    fn still_pending(
        &self,
        entry: &PooledEntry<Req, T>,
        status: EntryStatus,
        retry_after: Duration,
    ) -> RetryOutcome<T> {
        RetryOutcome::StillPending {
            status,
            retry_after,
            queue_position: self.pool.position(entry),
        }
    }

    /// Under the entry's lock: settle, expire, or try to admit it.
    fn admit_pending(&self, entry: &PooledEntry<Req, T>) -> Admission<Req, T>
    where
        T: Clone,
    {
        let now = self.clock.now();
        let mut state = entry.write_state();
        match &*state {
            EntryState::Pending => {}
            EntryState::Processing => {
                return Admission::Waiting(EntryStatus::Processing, Duration::ZERO);
            }
            settled => return Admission::Settled(settled.clone()),
        }

        if entry.age(now) >= self.config.max_residency {
            return match entry.advance(&mut state, EntryState::Expired, now) {
                Ok(()) => Admission::Expired,
                Err(current) => Admission::Waiting(current, Duration::ZERO),
            };
        }

        match self.limiter.try_acquire(entry.cost()) {
            ControlFlow::Continue(()) => {
                match entry.advance(&mut state, EntryState::Processing, now) {
                    Ok(()) => Admission::Admitted(entry.take_payload()),
                    Err(current) => Admission::Waiting(current, Duration::ZERO),
                }
            }
            ControlFlow::Break(Reason::Overloaded { retry_after }) => {
                Admission::Waiting(EntryStatus::Pending, retry_after)
            }
        }
    }

    fn expire(&self, entry: &PooledEntry<Req, T>) {
        self.pool.remove(entry.id().as_str());
        self.instruments.expired.add(1, &self.labels);
        tracing::info!(id = %entry.id(), "deferred request expired");
    }

    fn reset_backoff(&self, client: Option<&str>) {
        if let (Some(backoff), Some(client)) = (&self.backoff, client) {
            backoff.reset(client);
        }
    }
}

impl<L, S, Req, T> AdmissionCoordinator<L, S, Req, T>
where
    L: Strategy + ?Sized + Send + Sync,
    S: Service<Req, Response = T, Error = BoxError> + Clone + Send + Sync,
    S::Future: Send,
    Req: Send,
    T: Clone + Send + Sync,
{
    /// Run `item` now if the limiter has room, otherwise park it.
    ///
    /// # Errors
    ///
    /// - [`AdmitError::Processing`] if the work ran and failed. Nothing is pooled.
    /// - [`AdmitError::PoolFull`] if the work could not run and the pool has no room.
    /// - [`AdmitError::CostExceedsCapacity`] if the work can never fit the limiter.
    pub async fn submit(&self, item: WorkItem<Req>) -> Result<Submission<T>, AdmitError> {
        self.check_cost(item.cost())?;

        // Pending work goes first when the promoter owns the order.
        let queue_jumping =
            self.config.promotion == PromotionMode::Push && self.pool.pending_len() > 0;

        let retry_after = if queue_jumping {
            self.limiter.retry_after()
        } else {
            match self.limiter.try_acquire(item.cost()) {
                ControlFlow::Continue(()) => {
                    self.instruments.admitted.add(1, &self.labels);
                    tracing::debug!(priority = item.priority(), "admitted immediately");
                    self.reset_backoff(item.client());

                    let result = self.execute(item.into_payload()).await.map_err(|err| {
                        self.instruments.processing_failed.add(1, &self.labels);
                        tracing::warn!(error = %err, "processing failed");
                        AdmitError::Processing(err.to_string())
                    })?;
                    return Ok(Submission::Immediate(result));
                }
                ControlFlow::Break(Reason::Overloaded { retry_after }) => retry_after,
            }
        };

        self.defer(item, retry_after).map(Submission::Deferred)
    }

    fn defer(
        &self,
        item: WorkItem<Req>,
        retry_after: Duration,
    ) -> Result<DeferredHandle, AdmitError> {
        let client = item.client().map(str::to_string);
        let entry = self.pool.add(item).inspect_err(|_| {
            self.instruments.rejected.add(1, &self.labels);
            tracing::warn!(
                capacity = self.pool.capacity(),
                "deferral pool full, rejecting request"
            );
        })?;

        let queue_position = self.pool.position(&entry).unwrap_or(1);
        let estimated_wait = self.estimate(&entry, queue_position, retry_after);
        let retry_after = match (&self.backoff, client.as_deref()) {
            (Some(backoff), Some(client)) => {
                retry_after.max(backoff.next_delay(client, self.current_load()))
            }
            _ => retry_after,
        };

        self.instruments.deferred.add(1, &self.labels);
        tracing::debug!(
            id = %entry.id(),
            priority = entry.priority(),
            queue_position,
            retry_after_ms = retry_after.as_millis() as u64,
            "deferred request"
        );

        Ok(DeferredHandle {
            id: entry.id().clone(),
            retry_after,
            queue_position,
            estimated_wait,
        })
    }

    /// Collect deferred work, admitting and running it if the limiter now has room.
    ///
    /// Work admitted by this call is removed from the pool once it finishes, and its result
    /// is returned here. Work finished by the push promoter is returned by every call until
    /// the sweeper collects it.
    ///
    /// # Errors
    ///
    /// [`AdmitError::NotFound`] if `id` is unknown, canceled, expired, or already delivered.
    pub async fn retry(&self, id: &str) -> Result<RetryOutcome<T>, AdmitError> {
        let entry = self.pool.get(id).ok_or_else(|| not_found(id))?;

        if self.config.promotion == PromotionMode::Push {
            return self.deliver(&entry, entry.state());
        }

        match self.admit_pending(&entry) {
            Admission::Settled(state) => self.deliver(&entry, state),
            Admission::Waiting(status, retry_after) => {
                Ok(self.still_pending(&entry, status, retry_after))
            }
            Admission::Expired => {
                self.expire(&entry);
                Err(not_found(id))
            }
            Admission::Admitted(payload) => {
                self.instruments.promoted.add(1, &self.labels);
                tracing::info!(%id, "promoted deferred request on retry");
                let state = self.run(&entry, payload).await;
                self.pool.remove(id);
                self.reset_backoff(entry.client());
                self.deliver(&entry, state)
            }
        }
    }

    fn deliver(
        &self,
        entry: &PooledEntry<Req, T>,
        state: EntryState<T>,
    ) -> Result<RetryOutcome<T>, AdmitError> {
        match state {
            EntryState::Completed(result) => {
                entry.mark_delivered();
                Ok(RetryOutcome::Completed(result))
            }
            EntryState::Failed(message) => {
                entry.mark_delivered();
                Ok(RetryOutcome::Failed(message))
            }
            EntryState::Processing => Ok(self.still_pending(
                entry,
                EntryStatus::Processing,
                Duration::ZERO,
            )),
            EntryState::Pending => Ok(self.still_pending(
                entry,
                EntryStatus::Pending,
                self.limiter.retry_after(),
            )),
            EntryState::Canceled | EntryState::Expired => Err(not_found(entry.id().as_str())),
        }
    }

    /// A read-only view of `id`. Never admits or expires anything.
    ///
    /// A terminal result returned here counts as observed, which starts its retention.
    pub fn status(&self, id: &str) -> StatusSnapshot<T> {
        let Some(entry) = self.pool.get(id) else {
            return StatusSnapshot::NotFound;
        };

        match entry.state() {
            EntryState::Pending => {
                let queue_position = self.pool.position(&entry).unwrap_or(1);
                StatusSnapshot::Pending {
                    queue_position,
                    estimated_wait: self.estimate(
                        &entry,
                        queue_position,
                        self.limiter.retry_after(),
                    ),
                }
            }
            EntryState::Processing => StatusSnapshot::Processing,
            EntryState::Completed(result) => {
                entry.mark_delivered();
                StatusSnapshot::Completed(result)
            }
            EntryState::Failed(message) => {
                entry.mark_delivered();
                StatusSnapshot::Failed(message)
            }
            EntryState::Canceled | EntryState::Expired => StatusSnapshot::NotFound,
        }
    }

    /// Wait until `id` settles or leaves the pool, for at most `timeout`.
    ///
    /// Returns the snapshot at that point, which is still in flight if the wait timed out.
    pub async fn wait_for(&self, id: &str, timeout: Duration) -> StatusSnapshot<T> {
        let settled = async {
            loop {
                let changed = self.pool.changed().notified();
                tokio::pin!(changed);
                // Register before looking, so a change in between still wakes us.
                changed.as_mut().enable();

                let snapshot = self.status(id);
                if !snapshot.is_in_flight() {
                    return snapshot;
                }
                changed.await;
            }
        };

        match tokio::time::timeout(timeout, settled).await {
            Ok(snapshot) => snapshot,
            Err(_) => self.status(id),
        }
    }

    /// Admit and run the pending entry the scheduling policy ranks first.
    pub(crate) async fn promote_next(&self) -> PromoteStep {
        let Some(entry) = self.pool.next_pending() else {
            return PromoteStep::Idle;
        };

        match self.admit_pending(&entry) {
            Admission::Waiting(EntryStatus::Pending, retry_after) => {
                PromoteStep::Throttled(retry_after)
            }
            Admission::Waiting(..) | Admission::Settled(_) => PromoteStep::Progressed,
            Admission::Expired => {
                self.expire(&entry);
                PromoteStep::Progressed
            }
            Admission::Admitted(payload) => {
                self.instruments.promoted.add(1, &self.labels);
                tracing::info!(
                    id = %entry.id(),
                    priority = entry.priority(),
                    "promoted deferred request"
                );
                self.run(&entry, payload).await;
                self.reset_backoff(entry.client());
                PromoteStep::Progressed
            }
        }
    }

    /// Run an admitted entry and record its outcome.
    async fn run(&self, entry: &PooledEntry<Req, T>, payload: Option<Req>) -> EntryState<T> {
        let mut in_flight = InFlight {
            entry,
            pool: &self.pool,
            done: false,
        };

        let outcome = match payload {
            Some(payload) => self.execute(payload).await,
            None => Err(BoxError::from("payload already taken")),
        };

        let state = match outcome {
            Ok(result) => EntryState::Completed(result),
            Err(err) => {
                self.instruments.processing_failed.add(1, &self.labels);
                tracing::warn!(id = %entry.id(), error = %err, "processing failed");
                EntryState::Failed(err.to_string())
            }
        };

        in_flight.done = true;
        if let Err(current) = entry.transition(state.clone(), self.clock.now()) {
            tracing::warn!(id = %entry.id(), %current, "entry settled while processing");
        }
        self.pool.changed().notify_waiters();
        state
    }

    async fn execute(&self, payload: Req) -> Result<T, BoxError> {
        self.processor.clone().oneshot(payload).await
    }
}

fn not_found(id: &str) -> AdmitError {
    AdmitError::NotFound {
        id: EntryId::from(id),
    }
}
