//! Handler contract

use crate::task::Task;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Outcome classification returned by a failing handler.
///
/// The processor honours the classification as given: `Retry` reschedules
/// while the retry budget lasts, `SkipRetry` fails the task at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure, try again later
    #[error("{0}")]
    Retry(String),

    /// Unrecoverable failure, never redeliver
    #[error("{0}")]
    SkipRetry(String),

    /// Execution was cancelled through the context
    #[error("task execution cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Retryable failure wrapping `err`
    pub fn retry(err: impl Display) -> Self {
        HandlerError::Retry(err.to_string())
    }

    /// Terminal failure wrapping `err`
    pub fn skip_retry(err: impl Display) -> Self {
        HandlerError::SkipRetry(err.to_string())
    }
}

/// Per-delivery execution context handed to handlers
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Id of the task being executed
    pub task_id: String,

    /// Type of the task being executed
    pub task_type: String,

    /// 1-based delivery attempt
    pub attempt: u32,

    cancellation: CancellationToken,
}

impl TaskContext {
    /// Build a context for one delivery of `task`
    pub fn new(task: &Task, cancellation: CancellationToken) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            attempt: task.retry_count + 1,
            cancellation,
        }
    }

    /// Whether the processor asked in-flight work to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// Executes tasks of one type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task and classify any failure
    async fn handle(&self, ctx: &TaskContext, task: &Task) -> Result<(), HandlerError>;
}

/// Decode a task payload; a malformed payload can never succeed, so it skips retry
pub fn decode_or_skip<P: DeserializeOwned>(task: &Task) -> Result<P, HandlerError> {
    task.decode()
        .map_err(|e| HandlerError::skip_retry(format!("failed to decode task payload: {e}")))
}

/// Handler backed by an async closure
pub struct HandlerFn<F> {
    func: F,
}

/// Adapt an async closure into a [`TaskHandler`]
pub fn handler_fn<F, Fut>(func: F) -> HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { func }
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &TaskContext, task: &Task) -> Result<(), HandlerError> {
        (self.func)(ctx.clone(), task.clone()).await
    }
}
