//! Observable scheduler events and tick reports.

use chrono::{DateTime, Utc};

use crate::{Settlement, TaskId};

/// Something that happened to a task.
///
/// Broadcast to every [`crate::Scheduler::subscribe`] receiver. Exhaustion
/// is reported here rather than as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Registered {
        id: TaskId,
        next_fire_at: DateTime<Utc>,
    },
    /// The dispatch sink accepted an occurrence.
    Fired { id: TaskId },
    Rescheduled {
        id: TaskId,
        next_fire_at: DateTime<Utc>,
    },
    RetryScheduled {
        id: TaskId,
        attempt: u32,
        next_fire_at: DateTime<Utc>,
        reason: String,
    },
    /// The task will never fire again. `reason` is set when the last
    /// delivery failed.
    Exhausted { id: TaskId, reason: Option<String> },
    Cancelled { id: TaskId },
    Suspended { id: TaskId },
    Resumed {
        id: TaskId,
        next_fire_at: DateTime<Utc>,
    },
    Purged { id: TaskId },
    /// A delivery finished after its task was cancelled or purged; its
    /// outcome was ignored.
    DeliveryDiscarded { id: TaskId },
    /// A delivery was in flight when the previous process stopped.
    Interrupted { id: TaskId },
}

/// What happened to one task during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Settled { id: TaskId, settlement: Settlement },
    /// Outcome ignored because the task was cancelled mid-delivery.
    Discarded { id: TaskId },
    /// The durable write failed; the task is retried on a later tick.
    StorageFailed { id: TaskId, error: String },
}

impl TaskOutcome {
    pub fn id(&self) -> &TaskId {
        match self {
            Self::Settled { id, .. } | Self::Discarded { id } | Self::StorageFailed { id, .. } => id,
        }
    }
}

/// Summary of a single [`crate::Scheduler::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks handed to the sink, in dispatch order.
    pub dispatched: Vec<TaskId>,
    /// Per-task results, in completion order.
    pub outcomes: Vec<TaskOutcome>,
}

impl TickReport {
    /// Whether the tick did nothing.
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty() && self.outcomes.is_empty()
    }

    /// Outcome recorded for `id`, if any.
    pub fn outcome_for(&self, id: &TaskId) -> Option<&TaskOutcome> {
        self.outcomes.iter().rev().find(|o| o.id() == id)
    }
}
