//! Dispatch boundary between the scheduler and host-observable effects.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tracing::info;

use crate::Task;

/// Result of handing a due task to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The host accepted the occurrence.
    Success,
    /// The host could not act on it.
    Failure(String),
}

impl DeliveryOutcome {
    /// Failed delivery with a reason.
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure(reason.into())
    }

    /// Whether delivery succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for DeliveryOutcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => Self::Failure(e.to_string()),
        }
    }
}

/// Invokes a task's callback when it becomes due.
///
/// Called once per due occurrence (plus once per retry). The scheduler only
/// looks at the outcome; what delivery means is up to the host.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    /// Deliver one occurrence of `task`.
    async fn deliver(&self, task: &Task) -> DeliveryOutcome;
}

/// Boxed async delivery function.
pub type DeliveryFn =
    Box<dyn Fn(Task) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

/// Sink backed by a closure.
pub struct FnSink {
    deliver: DeliveryFn,
}

impl FnSink {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            deliver: Box::new(move |task| Box::pin(f(task))),
        }
    }
}

impl std::fmt::Debug for FnSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl DispatchSink for FnSink {
    async fn deliver(&self, task: &Task) -> DeliveryOutcome {
        (self.deliver)(task.clone()).await.into()
    }
}

/// Sink that records each occurrence in the log and always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl DispatchSink for LogSink {
    async fn deliver(&self, task: &Task) -> DeliveryOutcome {
        info!(
            id = %task.id,
            name = %task.name,
            payload = %task.payload,
            "task fired"
        );
        DeliveryOutcome::Success
    }
}
