//! Shared fixtures for scheduler integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mandre_scheduler::{
    DeliveryOutcome, DispatchSink, ManualClock, MemoryStore, Scheduler, SchedulerConfig, Task,
    TaskId,
};

/// Timestamp `secs` seconds after the epoch.
pub fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

/// Sink that replays scripted outcomes (default: success) and records
/// every delivery.
#[derive(Default)]
pub struct ScriptedSink {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    delivered: Mutex<Vec<TaskId>>,
}

impl ScriptedSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue outcomes for the next deliveries, in order.
    pub fn push(&self, outcomes: impl IntoIterator<Item = DeliveryOutcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub fn fail_next(&self, n: usize) {
        self.push((0..n).map(|i| DeliveryOutcome::failure(format!("scripted failure {}", i + 1))));
    }

    pub fn delivered(&self) -> Vec<TaskId> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivery_count(&self, id: &TaskId) -> usize {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|d| *d == id)
            .count()
    }
}

#[async_trait]
impl DispatchSink for ScriptedSink {
    async fn deliver(&self, task: &Task) -> DeliveryOutcome {
        self.delivered.lock().unwrap().push(task.id.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DeliveryOutcome::Success)
    }
}

/// A scheduler over a memory store and manual clock starting at `start`.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<ScriptedSink>,
    pub scheduler: Arc<Scheduler>,
}

impl Harness {
    pub async fn new(start: i64) -> Self {
        Self::with_config(start, SchedulerConfig::default()).await
    }

    pub async fn with_config(start: i64, config: SchedulerConfig) -> Self {
        let clock = Arc::new(ManualClock::new(t(start)));
        let store = Arc::new(MemoryStore::new());
        let sink = ScriptedSink::new();
        let scheduler = Arc::new(
            Scheduler::open(store.clone(), clock.clone(), sink.clone(), config)
                .await
                .unwrap(),
        );
        Self {
            clock,
            store,
            sink,
            scheduler,
        }
    }

    /// Open a second scheduler over the same store, as after a restart.
    pub async fn restart(&self, config: SchedulerConfig) -> Arc<Scheduler> {
        Arc::new(
            Scheduler::open(
                self.store.clone(),
                self.clock.clone(),
                self.sink.clone(),
                config,
            )
            .await
            .unwrap(),
        )
    }

    /// Set the clock to `secs` and tick at that instant.
    pub async fn tick_at(&self, secs: i64) -> mandre_scheduler::TickReport {
        self.clock.set(t(secs));
        self.scheduler.tick(t(secs)).await
    }
}
