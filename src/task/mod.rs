/// Handler contract and execution context
pub mod handler;
/// Immutable task-type to handler registry
pub mod registry;
/// Backoff policy for retried tasks
pub mod retry;

use crate::queue::DEFAULT_QUEUE;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A payload type bound to a task type name.
///
/// The name is what the envelope carries on the wire and what the registry
/// resolves, so it must stay stable across deployments.
pub trait TaskKind: Serialize + DeserializeOwned + Send + Sync {
    /// Task type identifier, e.g. `task:send_verification_email`
    const TYPE: &'static str;
}

/// Lifecycle state of a task envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Queued, eligible once `process_at` has passed
    Pending,

    /// Claimed by a worker
    Running,

    /// Handler succeeded
    Completed,

    /// Handler failed and the task is being rescheduled
    Retrying,

    /// Terminal failure, moved to the dead-letter set
    Failed,
}

/// One unit of work as stored by the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique task identifier
    pub id: String,

    /// Handler selector
    pub task_type: String,

    /// Serialized payload, schema owned by the handler
    pub payload: Vec<u8>,

    /// Logical queue name
    pub queue: String,

    /// Reschedules allowed before the task fails permanently
    pub max_retry: u32,

    /// Reschedules performed so far
    pub retry_count: u32,

    /// Earliest time the task may be claimed
    pub process_at: Option<DateTime<Utc>>,

    /// Current lifecycle state
    pub state: TaskState,

    /// Error of the most recent failed attempt
    pub last_error: Option<String>,

    /// Claim token set by the broker on claim. Reports carrying a token
    /// other than the live claim's are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<u64>,

    /// Task creation timestamp
    pub created_at: DateTime<Utc>,

    /// Task last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Submission options for a task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOptions {
    /// Target queue, `default` when unset
    pub queue: Option<String>,

    /// Retry budget, configuration default when unset
    pub max_retry: Option<u32>,

    /// Earliest delivery time
    pub process_at: Option<DateTime<Utc>>,
}

impl TaskOptions {
    /// Options with every field left to its default
    pub fn new() -> Self {
        Self::default()
    }

    /// Route the task to a named queue
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Override the retry budget
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Deliver no earlier than `at`
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }

    /// Deliver no earlier than `delay` from now
    pub fn process_in(self, delay: Duration) -> Self {
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.process_at(at)
    }
}

impl Task {
    /// Create a pending task on the default queue
    pub fn new(task_type: impl Into<String>, payload: Vec<u8>, max_retry: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            queue: DEFAULT_QUEUE.to_string(),
            max_retry,
            retry_count: 0,
            process_at: None,
            state: TaskState::Pending,
            last_error: None,
            lease_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a task with submission options applied
    pub fn with_options(
        task_type: impl Into<String>,
        payload: Vec<u8>,
        options: TaskOptions,
        default_max_retry: u32,
    ) -> Self {
        let mut task = Self::new(
            task_type,
            payload,
            options.max_retry.unwrap_or(default_max_retry),
        );
        if let Some(queue) = options.queue {
            task.queue = queue;
        }
        task.process_at = options.process_at;
        task
    }

    /// Encode a typed payload into a new task
    pub fn from_kind<P: TaskKind>(payload: &P, max_retry: u32) -> crate::Result<Self> {
        Ok(Self::new(P::TYPE, encode_payload(payload)?, max_retry))
    }

    /// Decode the payload into its typed form
    pub fn decode<P: DeserializeOwned>(&self) -> crate::Result<P> {
        decode_payload(&self.payload)
    }

    /// Whether the task may be claimed at `now`
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.process_at.map_or(true, |at| at <= now)
    }

    /// Whether the task may be claimed now
    pub fn is_ready(&self) -> bool {
        self.is_ready_at(Utc::now())
    }

    /// Whether another failure would still be rescheduled
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retry
    }

    /// Time ordering key used by the broker: scheduled time or creation time
    pub fn eligible_at(&self) -> DateTime<Utc> {
        self.process_at.unwrap_or(self.created_at)
    }

    /// Mark task as claimed by a worker
    pub fn mark_running(&mut self) {
        self.state = TaskState::Running;
        self.updated_at = Utc::now();
    }

    /// Mark task as completed
    pub fn mark_completed(&mut self) {
        self.state = TaskState::Completed;
        self.updated_at = Utc::now();
    }

    /// Record a retryable failure and schedule the next attempt
    pub fn mark_retrying(&mut self, error: String, next_attempt: DateTime<Utc>) {
        self.retry_count += 1;
        self.state = TaskState::Retrying;
        self.last_error = Some(error);
        self.process_at = Some(next_attempt);
        self.updated_at = Utc::now();
    }

    /// Record a terminal failure
    pub fn mark_failed(&mut self, error: String) {
        self.state = TaskState::Failed;
        self.last_error = Some(error);
        self.updated_at = Utc::now();
    }

    /// Put the task back in the pending state
    pub fn mark_pending(&mut self) {
        self.state = TaskState::Pending;
        self.lease_id = None;
        self.updated_at = Utc::now();
    }

    /// Payload rendered for logs, lossy for non UTF-8 bytes
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Serialize a payload into envelope bytes
pub fn encode_payload<P: Serialize + ?Sized>(payload: &P) -> crate::Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Deserialize envelope bytes into a payload
pub fn decode_payload<P: DeserializeOwned>(bytes: &[u8]) -> crate::Result<P> {
    Ok(serde_json::from_slice(bytes)?)
}
