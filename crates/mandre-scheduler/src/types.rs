//! Scheduler types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;
use crate::calendar::CalendarExpression;

/// Base32-sortable alphabet used for task ids.
const ID_CHARSET: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

/// Length of an encoded task id.
const ID_LEN: usize = 13;

/// Largest raw value the id allocator hands out.
const MAX_RAW_ID: u64 = i64::MAX as u64;

/// Opaque, sortable task identifier.
///
/// Encodes a 63-bit value: microseconds of the registration clock reading in
/// the upper 53 bits, a sequence in the lower 10. Lexical order equals
/// numeric order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Encode a raw 63-bit value.
    pub fn from_raw(val: u64) -> Self {
        let mut id = String::with_capacity(ID_LEN);
        let mut v = val;
        for _ in 0..ID_LEN {
            id.push(ID_CHARSET[(v & 0x1f) as usize] as char);
            v >>= 5;
        }
        Self(id.chars().rev().collect())
    }

    /// Decode the raw value, if this id was produced by [`TaskId::from_raw`].
    pub fn to_raw(&self) -> Option<u64> {
        if self.0.len() != ID_LEN {
            return None;
        }
        self.0.bytes().try_fold(0u64, |acc, b| {
            let digit = ID_CHARSET.iter().position(|&c| c == b)? as u64;
            acc.checked_mul(32)?.checked_add(digit)
        })
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Allocates strictly increasing task ids.
///
/// Seeded from every id seen in the store so ids are never reused within a
/// store's lifetime, even when the clock reading repeats.
#[derive(Debug, Default)]
pub(crate) struct IdSequence {
    last: AtomicU64,
}

impl IdSequence {
    /// Record an existing id so later allocations sort after it.
    ///
    /// Ids outside the 63-bit range were not allocated here and are ignored.
    pub(crate) fn observe(&self, id: &TaskId) {
        if let Some(raw) = id.to_raw().filter(|raw| *raw <= MAX_RAW_ID) {
            self.last.fetch_max(raw, Ordering::SeqCst);
        }
    }

    /// Allocate the next id for a registration at `now`.
    pub(crate) fn next(&self, now: DateTime<Utc>) -> TaskId {
        let micros = now.timestamp_micros().max(0) as u64;
        let candidate = (micros << 10) & MAX_RAW_ID;
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let raw = candidate.max(prev.saturating_add(1)).min(MAX_RAW_ID);
            match self
                .last
                .compare_exchange(prev, raw, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return TaskId::from_raw(raw),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// How a task recurs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Fire once at a specific time.
    Once { at: DateTime<Utc> },
    /// Fire every N seconds, measured from the previous fire.
    Interval { seconds: u64 },
    /// Fire on every match of a cron-like calendar expression.
    Calendar { expression: String },
}

impl TaskKind {
    /// Whether this kind fires more than once.
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once { .. })
    }

    /// Reject recurrence parameters that can never produce a fire.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        match self {
            Self::Once { .. } => Ok(()),
            Self::Interval { seconds: 0 } => Err(SchedulerError::InvalidSchedule(
                "interval must be positive".to_string(),
            )),
            Self::Interval { .. } => Ok(()),
            Self::Calendar { expression } => CalendarExpression::parse(expression).map(|_| ()),
        }
    }

    /// First due time for a task registered at `now`.
    pub fn first_fire_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        self.validate()?;
        match self {
            Self::Once { at } => Ok(*at),
            _ => self.next_after(now).ok_or_else(|| {
                SchedulerError::InvalidSchedule("schedule has no future occurrences".to_string())
            }),
        }
    }

    /// The next recurrence strictly after `now`, or `None` for one-shot
    /// tasks and calendars that have run out of matches.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once { .. } => None,
            Self::Interval { seconds } => Some(add_duration(now, Duration::from_secs(*seconds))),
            Self::Calendar { expression } => match CalendarExpression::parse(expression) {
                Ok(expr) => expr.next_after(now),
                Err(e) => {
                    tracing::warn!(expression = %expression, error = %e, "stored calendar expression no longer parses");
                    None
                }
            },
        }
    }
}

/// Current state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the timeline.
    #[default]
    Pending,
    /// Handed to the dispatch sink, outcome not yet recorded.
    Firing,
    /// Held out of the timeline until resumed.
    Suspended,
    /// Cancelled by the registrant.
    Cancelled,
    /// Will never fire again.
    Exhausted,
}

impl TaskState {
    /// Whether no further transitions (other than purge) are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Exhausted)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Firing => "firing",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
            Self::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// Retry behaviour applied when delivery fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed deliveries allowed per occurrence before giving up on it.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy.
    pub fn new(max_attempts: u32, base: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            multiplier,
            cap,
        }
    }

    /// A policy that gives up after the first failed delivery.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based):
    /// `min(base * multiplier^(attempt - 1), cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= self.cap.as_nanos() as f64 {
            return self.cap;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    /// Reject policies that cannot be applied.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_attempts == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "backoff multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if self.cap < self.base {
            return Err(SchedulerError::InvalidSchedule(
                "backoff cap must not be below the base delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a plugin asks the scheduler to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Human-readable name.
    pub name: String,
    /// Recurrence.
    pub kind: TaskKind,
    /// Opaque data passed through to the dispatch sink.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Overrides the scheduler's default retry policy.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl TaskSpec {
    /// A task that fires once at `at`.
    pub fn once(name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(name, TaskKind::Once { at })
    }

    /// A task that fires every `seconds`.
    pub fn interval(name: impl Into<String>, seconds: u64) -> Self {
        Self::new(name, TaskKind::Interval { seconds })
    }

    /// A task that fires on a calendar expression.
    pub fn calendar(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(
            name,
            TaskKind::Calendar {
                expression: expression.into(),
            },
        )
    }

    fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            payload: serde_json::Value::Null,
            retry_policy: None,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Use a specific retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Handle returned from registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    /// Id of the registered task.
    pub id: TaskId,
    /// When it first fires.
    pub next_fire_at: DateTime<Utc>,
}

impl TaskHandle {
    /// The task id, for cancel/suspend/resume.
    pub fn id(&self) -> &TaskId {
        &self.id
    }
}

/// A scheduled task as held in memory and in the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    /// Next due time. `None` exactly when the task is cancelled or exhausted.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub retry_policy: RetryPolicy,
    /// Failed deliveries for the current occurrence.
    pub attempt_count: u32,
    /// Bumped on every persisted mutation.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// How a delivery outcome was applied to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Recurring task moved to its next occurrence.
    Rescheduled { next_fire_at: DateTime<Utc> },
    /// Failed delivery will be retried.
    RetryScheduled {
        attempt: u32,
        next_fire_at: DateTime<Utc>,
    },
    /// Task will never fire again.
    Exhausted,
}

impl Task {
    /// Build a pending task from a validated spec.
    pub fn from_spec(
        id: TaskId,
        spec: TaskSpec,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, SchedulerError> {
        retry_policy.validate()?;
        let next_fire_at = spec.kind.first_fire_at(now)?;
        Ok(Self {
            id,
            name: spec.name,
            kind: spec.kind,
            next_fire_at: Some(next_fire_at),
            payload: spec.payload,
            state: TaskState::Pending,
            retry_policy,
            attempt_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            last_fired_at: None,
            last_error: None,
        })
    }

    /// Whether this task is pending and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending && self.next_fire_at.is_some_and(|at| at <= now)
    }

    /// Whether `next_fire_at` agrees with `state`.
    pub fn is_consistent(&self) -> bool {
        self.next_fire_at.is_none() == self.state.is_terminal()
    }

    /// Mark as handed to the dispatch sink.
    pub fn begin_firing(&mut self) {
        self.state = TaskState::Firing;
    }

    /// Apply a successful delivery at `now`.
    pub fn record_success(&mut self, now: DateTime<Utc>) -> Settlement {
        self.attempt_count = 0;
        self.last_fired_at = Some(now);
        self.last_error = None;
        self.advance_occurrence(now)
    }

    /// Apply a failed delivery at `now`.
    pub fn record_failure(&mut self, now: DateTime<Utc>, reason: &str) -> Settlement {
        self.attempt_count = self
            .attempt_count
            .saturating_add(1)
            .min(self.retry_policy.max_attempts);
        self.last_error = Some(reason.to_string());

        if self.attempt_count < self.retry_policy.max_attempts {
            let next_fire_at = add_duration(now, self.retry_policy.backoff(self.attempt_count));
            self.state = TaskState::Pending;
            self.next_fire_at = Some(next_fire_at);
            return Settlement::RetryScheduled {
                attempt: self.attempt_count,
                next_fire_at,
            };
        }

        if self.kind.is_recurring() {
            self.attempt_count = 0;
        }
        self.advance_occurrence(now)
    }

    /// Move to the next occurrence after `now`, or exhaust.
    fn advance_occurrence(&mut self, now: DateTime<Utc>) -> Settlement {
        match self.kind.next_after(now) {
            Some(next_fire_at) => {
                self.state = TaskState::Pending;
                self.next_fire_at = Some(next_fire_at);
                Settlement::Rescheduled { next_fire_at }
            }
            None => {
                self.state = TaskState::Exhausted;
                self.next_fire_at = None;
                Settlement::Exhausted
            }
        }
    }

    /// Move to Cancelled. Returns false if already terminal.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TaskState::Cancelled;
        self.next_fire_at = None;
        true
    }

    /// Hold out of the timeline. Returns false unless pending.
    pub fn suspend(&mut self) -> bool {
        if self.state != TaskState::Pending {
            return false;
        }
        self.state = TaskState::Suspended;
        true
    }

    /// Return to the timeline no earlier than `now`. Returns false unless
    /// suspended.
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != TaskState::Suspended {
            return false;
        }
        self.state = TaskState::Pending;
        self.next_fire_at = Some(self.next_fire_at.map_or(now, |at| at.max(now)));
        true
    }
}

/// `ts + d`, saturating at the largest representable instant.
pub(crate) fn add_duration(ts: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| ts.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
