//! Task scheduler implementation.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::dispatch::{DeliveryOutcome, DispatchSink};
use crate::store::TaskStore;
use crate::types::IdSequence;
use crate::{
    SchedulerConfig, SchedulerError, SchedulerEvent, Settlement, Task, TaskHandle, TaskId,
    TaskOutcome, TaskSpec, TaskState, TickReport,
};

/// Failure reason recorded for deliveries cut short by a restart.
const INTERRUPTED_REASON: &str = "delivery interrupted by restart";

/// In-memory mirror of the durable store.
#[derive(Debug, Default)]
struct Timeline {
    tasks: HashMap<TaskId, Task>,
    /// Pending tasks keyed by `(next_fire_at, id)`.
    queue: BTreeSet<(DateTime<Utc>, TaskId)>,
    /// Firing tasks whose delivery outcome is not yet durable.
    unsettled: HashMap<TaskId, DeliveryOutcome>,
}

impl Timeline {
    fn queue_key(task: &Task) -> Option<(DateTime<Utc>, TaskId)> {
        match (task.state, task.next_fire_at) {
            (TaskState::Pending, Some(at)) => Some((at, task.id.clone())),
            _ => None,
        }
    }

    fn insert(&mut self, task: Task) {
        if let Some(key) = self.tasks.get(&task.id).and_then(Self::queue_key) {
            self.queue.remove(&key);
        }
        if let Some(key) = Self::queue_key(&task) {
            self.queue.insert(key);
        }
        self.tasks.insert(task.id.clone(), task);
    }

    fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        if let Some(key) = Self::queue_key(&task) {
            self.queue.remove(&key);
        }
        Some(task)
    }

    fn due(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        self.queue
            .iter()
            .take_while(|(at, _)| *at <= now)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn peek_next(&self) -> Option<DateTime<Utc>> {
        self.queue.first().map(|(at, _)| *at)
    }
}

/// The task scheduler.
///
/// Every timeline mutation goes through one FIFO-fair lock, so concurrent
/// callers are served in arrival order. Deliveries run outside that lock.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DispatchSink>,
    config: SchedulerConfig,
    timeline: Mutex<Timeline>,
    /// Only one tick runs at a time.
    tick_gate: Mutex<()>,
    ids: IdSequence,
    events: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler {
    /// Open a scheduler over `store`, rebuilding the timeline from it.
    ///
    /// Tasks left `Firing` by a previous process are charged one failed
    /// attempt.
    #[tracing::instrument(skip_all)]
    pub async fn open(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn DispatchSink>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let scheduler = Self {
            store,
            clock,
            sink,
            config,
            timeline: Mutex::new(Timeline::default()),
            tick_gate: Mutex::new(()),
            ids: IdSequence::default(),
            events,
        };
        scheduler.reconcile().await?;
        Ok(scheduler)
    }

    /// Rebuild the timeline from the store.
    async fn reconcile(&self) -> Result<(), SchedulerError> {
        let records = self.store.list_all().await?;
        let now = self.clock.now();
        let mut timeline = self.timeline.lock().await;
        let mut inconsistent = Vec::new();

        for task in records {
            self.ids.observe(&task.id);
            if !task.is_consistent() {
                inconsistent.push(task.id.clone());
            }
            if task.state == TaskState::Firing {
                warn!(id = %task.id, name = %task.name, "task was firing at shutdown, counting a failed attempt");
                timeline
                    .unsettled
                    .insert(task.id.clone(), DeliveryOutcome::failure(INTERRUPTED_REASON));
                self.emit(SchedulerEvent::Interrupted {
                    id: task.id.clone(),
                });
            }
            timeline.insert(task);
        }

        for id in inconsistent {
            warn!(id = %id, "repairing record whose next_fire_at disagrees with its state");
            if let Err(e) = self.commit(&mut timeline, &id, now, |t| repair(t, now)).await {
                error!(id = %id, error = %e, "failed to repair task record");
            }
        }

        let interrupted = timeline.unsettled.len();
        let mut report = TickReport::default();
        self.settle_unsettled(&mut timeline, now, &mut report).await;

        info!(
            count = timeline.tasks.len(),
            pending = timeline.queue.len(),
            interrupted,
            "reconciled tasks from store"
        );
        Ok(())
    }

    /// Register a task.
    ///
    /// Nothing is kept in memory unless the durable write succeeds.
    #[tracing::instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn register(&self, spec: TaskSpec) -> Result<TaskHandle, SchedulerError> {
        let now = self.clock.now();
        let policy = spec
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.config.default_retry_policy.clone());

        let mut timeline = self.timeline.lock().await;
        let id = self.ids.next(now);
        let mut task = Task::from_spec(id.clone(), spec, policy, now)?;
        task.version = 1;
        let next_fire_at = task.next_fire_at.unwrap_or(now);

        self.store.put(&task).await?;
        info!(id = %id, name = %task.name, next_fire_at = %next_fire_at, "registered task");
        timeline.insert(task);
        self.emit(SchedulerEvent::Registered {
            id: id.clone(),
            next_fire_at,
        });

        Ok(TaskHandle { id, next_fire_at })
    }

    /// Cancel a task.
    ///
    /// Returns `false` if it was already cancelled or exhausted. A delivery
    /// already in flight is not interrupted; its outcome is discarded.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: &TaskId) -> Result<bool, SchedulerError> {
        let now = self.clock.now();
        let mut timeline = self.timeline.lock().await;
        let changed = self
            .commit(&mut timeline, id, now, |t| t.cancel().then_some(()))
            .await?
            .is_some();

        if changed {
            info!(id = %id, "cancelled task");
            self.emit(SchedulerEvent::Cancelled { id: id.clone() });
        } else {
            debug!(id = %id, "task already finished, cancel is a no-op");
        }
        Ok(changed)
    }

    /// Take a pending task out of the timeline, keeping its schedule.
    ///
    /// Returns `false` unless the task was pending.
    #[tracing::instrument(skip(self))]
    pub async fn suspend(&self, id: &TaskId) -> Result<bool, SchedulerError> {
        let now = self.clock.now();
        let mut timeline = self.timeline.lock().await;
        let changed = self
            .commit(&mut timeline, id, now, |t| t.suspend().then_some(()))
            .await?
            .is_some();

        if changed {
            info!(id = %id, "suspended task");
            self.emit(SchedulerEvent::Suspended { id: id.clone() });
        }
        Ok(changed)
    }

    /// Put a suspended task back, due no earlier than now.
    ///
    /// Returns `false` unless the task was suspended.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, id: &TaskId) -> Result<bool, SchedulerError> {
        let now = self.clock.now();
        let mut timeline = self.timeline.lock().await;
        let resumed = self
            .commit(&mut timeline, id, now, |t| {
                t.resume(now).then(|| t.next_fire_at.unwrap_or(now))
            })
            .await?;

        match resumed {
            Some(next_fire_at) => {
                info!(id = %id, next_fire_at = %next_fire_at, "resumed task");
                self.emit(SchedulerEvent::Resumed {
                    id: id.clone(),
                    next_fire_at,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete a task's durable record, cancelling it first if still live.
    #[tracing::instrument(skip(self))]
    pub async fn purge(&self, id: &TaskId) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        let mut timeline = self.timeline.lock().await;

        let live = timeline
            .tasks
            .get(id)
            .is_some_and(|t| !t.state.is_terminal());
        if live
            && self
                .commit(&mut timeline, id, now, |t| t.cancel().then_some(()))
                .await?
                .is_some()
        {
            self.emit(SchedulerEvent::Cancelled { id: id.clone() });
        }

        self.store.delete(id).await?;
        timeline.remove(id);
        timeline.unsettled.remove(id);
        info!(id = %id, "purged task");
        self.emit(SchedulerEvent::Purged { id: id.clone() });
        Ok(())
    }

    /// Delete cancelled/exhausted records older than the configured
    /// retention. Returns how many were removed.
    ///
    /// Failures are logged per record and do not stop the sweep.
    #[tracing::instrument(skip(self))]
    pub async fn collect_garbage(&self) -> usize {
        let Some(retention) = self.config.retention else {
            return 0;
        };
        let now = self.clock.now();
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| now.checked_sub_signed(r))
        else {
            return 0;
        };

        let mut timeline = self.timeline.lock().await;
        let mut expired: Vec<TaskId> = timeline
            .tasks
            .values()
            .filter(|t| t.state.is_terminal() && t.updated_at <= cutoff)
            .map(|t| t.id.clone())
            .collect();
        expired.sort();

        let mut removed = 0;
        for id in expired {
            match self.store.delete(&id).await {
                Ok(()) => {
                    timeline.remove(&id);
                    removed += 1;
                    self.emit(SchedulerEvent::Purged { id });
                }
                Err(e) => warn!(id = %id, error = %e, "failed to collect expired task"),
            }
        }

        if removed > 0 {
            info!(removed, "collected expired task records");
        }
        removed
    }

    /// Fire every task due at `now`.
    ///
    /// Due tasks are taken in `(next_fire_at, id)` order, marked `Firing`
    /// durably, then delivered concurrently. Each result is persisted as
    /// soon as it arrives. A storage failure affects only its own task.
    #[tracing::instrument(skip(self, now), fields(now = %now))]
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let _gate = self.tick_gate.lock().await;
        let mut report = TickReport::default();

        let firing = {
            let mut timeline = self.timeline.lock().await;
            self.settle_unsettled(&mut timeline, now, &mut report).await;

            let mut firing = Vec::new();
            for id in timeline.due(now) {
                let marked = self
                    .commit(&mut timeline, &id, now, |t| {
                        t.is_due(now).then(|| t.begin_firing())
                    })
                    .await;
                match marked {
                    Ok(Some(())) => {
                        if let Some(task) = timeline.tasks.get(&id) {
                            firing.push(task.clone());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(id = %id, error = %e, "failed to mark task firing, leaving it due");
                        report.outcomes.push(TaskOutcome::StorageFailed {
                            id,
                            error: e.to_string(),
                        });
                    }
                }
            }
            firing
        };

        if firing.is_empty() {
            return report;
        }
        debug!(count = firing.len(), "dispatching due tasks");

        let mut in_flight = FuturesUnordered::new();
        for task in firing {
            report.dispatched.push(task.id.clone());
            in_flight.push(self.deliver(task));
        }

        while let Some((id, outcome)) = in_flight.next().await {
            let mut timeline = self.timeline.lock().await;
            let result = self.settle(&mut timeline, &id, outcome, now).await;
            report.outcomes.push(result);
        }

        report
    }

    /// Earliest pending fire time, without changing anything.
    pub async fn peek_next(&self) -> Option<DateTime<Utc>> {
        self.timeline.lock().await.peek_next()
    }

    /// How long a driver may sleep before the next tick.
    pub async fn sleep_duration(&self) -> Duration {
        let timeline = self.timeline.lock().await;
        let (min, max) = (self.config.min_sleep, self.config.max_sleep);
        if !timeline.unsettled.is_empty() {
            return min;
        }

        match timeline.peek_next() {
            Some(next) => (next - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(min)
                .min(max),
            None => max,
        }
    }

    /// Snapshot of one task.
    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        self.timeline.lock().await.tasks.get(id).cloned()
    }

    /// Snapshot of every known task, ordered by id.
    pub async fn list(&self) -> Vec<Task> {
        let timeline = self.timeline.lock().await;
        let mut tasks: Vec<Task> = timeline.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// The clock this scheduler trusts.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Hand one task to the sink, applying the delivery budget.
    ///
    /// A sink that panics is charged a failed delivery like any other.
    async fn deliver(&self, task: Task) -> (TaskId, DeliveryOutcome) {
        let delivery = AssertUnwindSafe(self.sink.deliver(&task)).catch_unwind();
        let result = match self.config.delivery_timeout {
            Some(budget) => match tokio::time::timeout(budget, delivery).await {
                Ok(result) => result,
                Err(_) => Ok(DeliveryOutcome::failure(format!(
                    "delivery timed out after {}ms",
                    budget.as_millis()
                ))),
            },
            None => delivery.await,
        };

        let outcome = result.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!(id = %task.id, panic = %message, "dispatch sink panicked");
            DeliveryOutcome::failure(format!("delivery panicked: {}", message))
        });
        (task.id, outcome)
    }

    /// Retry persisting outcomes that previously failed to commit.
    async fn settle_unsettled(
        &self,
        timeline: &mut Timeline,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let mut pending: Vec<(TaskId, DeliveryOutcome)> = timeline.unsettled.drain().collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, outcome) in pending {
            let result = self.settle(timeline, &id, outcome, now).await;
            report.outcomes.push(result);
        }
    }

    /// Apply a delivery outcome to a firing task and persist it.
    async fn settle(
        &self,
        timeline: &mut Timeline,
        id: &TaskId,
        outcome: DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> TaskOutcome {
        let still_firing = timeline
            .tasks
            .get(id)
            .is_some_and(|t| t.state == TaskState::Firing);
        if !still_firing {
            return self.discard(id);
        }

        let result = self
            .commit(timeline, id, now, |t| {
                if t.state != TaskState::Firing {
                    return None;
                }
                Some(match &outcome {
                    DeliveryOutcome::Success => t.record_success(now),
                    DeliveryOutcome::Failure(reason) => t.record_failure(now, reason),
                })
            })
            .await;

        match result {
            Ok(Some(settlement)) => {
                self.announce(id, &outcome, &settlement);
                TaskOutcome::Settled {
                    id: id.clone(),
                    settlement,
                }
            }
            Ok(None) => self.discard(id),
            Err(SchedulerError::NotFound(_)) => self.discard(id),
            Err(e) => {
                error!(id = %id, error = %e, "failed to persist delivery outcome, will retry");
                timeline.unsettled.insert(id.clone(), outcome);
                TaskOutcome::StorageFailed {
                    id: id.clone(),
                    error: e.to_string(),
                }
            }
        }
    }

    fn discard(&self, id: &TaskId) -> TaskOutcome {
        debug!(id = %id, "task no longer firing, discarding delivery outcome");
        self.emit(SchedulerEvent::DeliveryDiscarded { id: id.clone() });
        TaskOutcome::Discarded { id: id.clone() }
    }

    /// Log and broadcast a settled outcome.
    fn announce(&self, id: &TaskId, outcome: &DeliveryOutcome, settlement: &Settlement) {
        let reason = match outcome {
            DeliveryOutcome::Success => {
                self.emit(SchedulerEvent::Fired { id: id.clone() });
                None
            }
            DeliveryOutcome::Failure(reason) => Some(reason.clone()),
        };

        match (settlement, reason) {
            (Settlement::Rescheduled { next_fire_at }, reason) => {
                match &reason {
                    Some(reason) => warn!(
                        id = %id,
                        error = %reason,
                        next_fire_at = %next_fire_at,
                        "retries exhausted for this occurrence, skipping to the next"
                    ),
                    None => debug!(id = %id, next_fire_at = %next_fire_at, "rescheduled task"),
                }
                self.emit(SchedulerEvent::Rescheduled {
                    id: id.clone(),
                    next_fire_at: *next_fire_at,
                });
            }
            (
                Settlement::RetryScheduled {
                    attempt,
                    next_fire_at,
                },
                reason,
            ) => {
                let reason = reason.unwrap_or_default();
                warn!(
                    id = %id,
                    attempt,
                    next_fire_at = %next_fire_at,
                    error = %reason,
                    "delivery failed, scheduled retry"
                );
                self.emit(SchedulerEvent::RetryScheduled {
                    id: id.clone(),
                    attempt: *attempt,
                    next_fire_at: *next_fire_at,
                    reason,
                });
            }
            (Settlement::Exhausted, reason) => {
                match &reason {
                    Some(reason) => error!(id = %id, error = %reason, "task exhausted its retries"),
                    None => info!(id = %id, "task completed"),
                }
                self.emit(SchedulerEvent::Exhausted {
                    id: id.clone(),
                    reason,
                });
            }
        }
    }

    /// Mutate a task and persist it; memory changes only after the store
    /// acknowledges the write.
    ///
    /// `mutate` returns `None` when there is nothing to do. On a version
    /// conflict the record is reloaded and the mutation applied once more
    /// before the conflict is surfaced.
    async fn commit<R>(
        &self,
        timeline: &mut Timeline,
        id: &TaskId,
        now: DateTime<Utc>,
        mut mutate: impl FnMut(&mut Task) -> Option<R>,
    ) -> Result<Option<R>, SchedulerError> {
        let current = timeline
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;

        let mut next = current.clone();
        let Some(result) = mutate(&mut next) else {
            return Ok(None);
        };
        next.version = current.version + 1;
        next.updated_at = now;

        match self.store.put(&next).await {
            Ok(()) => {
                timeline.insert(next);
                Ok(Some(result))
            }
            Err(e) if e.is_conflict() => {
                warn!(id = %id, error = %e, "stale task record, reloading");
                let Some(fresh) = self.store.get(id).await? else {
                    timeline.remove(id);
                    return Err(SchedulerError::NotFound(id.clone()));
                };

                let mut next = fresh.clone();
                let Some(result) = mutate(&mut next) else {
                    timeline.insert(fresh);
                    return Ok(None);
                };
                next.version = fresh.version + 1;
                next.updated_at = now;

                self.store.put(&next).await?;
                timeline.insert(next);
                Ok(Some(result))
            }
            Err(e) => Err(e),
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Bring `next_fire_at` back in line with `state`.
fn repair(task: &mut Task, now: DateTime<Utc>) -> Option<()> {
    match (task.state.is_terminal(), task.next_fire_at) {
        (true, Some(_)) => task.next_fire_at = None,
        (false, None) => task.next_fire_at = Some(now),
        _ => return None,
    }
    Some(())
}
