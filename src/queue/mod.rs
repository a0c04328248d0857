//! Broker abstraction and implementations

/// In-memory broker
pub mod memory;
/// Weighted queue selection
pub mod weighted;

use crate::task::Task;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use weighted::QueueWeights;

/// Queue used when a submission names none
pub const DEFAULT_QUEUE: &str = "default";

/// Queue for latency-sensitive work such as signup mail
pub const CRITICAL_QUEUE: &str = "critical";

/// Snapshot of broker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    /// Tasks eligible for claim now
    pub pending: usize,
    /// Tasks waiting for their `process_at`
    pub scheduled: usize,
    /// Tasks claimed and not yet reported
    pub in_flight: usize,
    /// Completed tasks still held in history
    pub completed: usize,
    /// Dead-lettered tasks
    pub dead: usize,
}

/// Durable queue store with atomic claim and scheduled delivery.
///
/// A claim hands a task to exactly one caller until the caller reports an
/// outcome (`ack`, `retry`, `dead_letter`, `release`) or the claim's
/// visibility timeout lapses, after which the task can be claimed again.
/// Every claim stamps a fresh `lease_id` on the task it returns; a report
/// carrying any other token fails with `TaskQueueError::TaskNotFound`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a task at the tail of its queue
    async fn enqueue(&self, task: Task) -> crate::Result<()>;

    /// Claim the next eligible task, choosing among queues by weight.
    ///
    /// Returns `TaskQueueError::QueueEmpty` when no queue has an eligible task.
    async fn claim(&self, weights: &QueueWeights) -> crate::Result<Task>;

    /// Report success; the task leaves the queue for good
    async fn ack(&self, task: &Task) -> crate::Result<()>;

    /// Report a retryable failure; the task is rescheduled after `delay`
    /// with its retry count incremented. Returns the rescheduled task.
    async fn retry(&self, task: &Task, delay: Duration, error: &str) -> crate::Result<Task>;

    /// Report a terminal failure; the task moves to the dead-letter set
    async fn dead_letter(&self, task: &Task, error: &str) -> crate::Result<Task>;

    /// Give a claim back without counting an attempt
    async fn release(&self, task: &Task) -> crate::Result<()>;

    /// Number of tasks waiting in `queue`, scheduled ones included
    async fn size(&self, queue: &str) -> usize;

    /// Counters across all queues
    async fn stats(&self) -> BrokerStats;

    /// Look a task up by id wherever the broker holds it
    async fn get(&self, task_id: &str) -> crate::Result<Task>;

    /// Recently completed tasks, oldest first
    async fn completed(&self) -> Vec<Task>;

    /// Dead-lettered tasks, oldest first
    async fn dead_letters(&self) -> Vec<Task>;

    /// How long a claim stays exclusive before the task can be claimed again
    fn visibility_timeout(&self) -> Duration;
}
