//! Task Relay - broker-backed task distribution and processing
//!
//! A producer side ([`BrokerDistributor`]) serializes typed payloads into task
//! envelopes and submits them to a [`queue::Broker`]. A consumer side
//! ([`WorkerPool`]) claims envelopes from weighted queues, dispatches them to
//! the handler registered for their type, and acknowledges, reschedules with
//! backoff, or dead-letters them depending on the outcome.

/// Account signup flow that distributes verification tasks
pub mod accounts;
/// Configuration management
pub mod config;
/// Producer-side task submission
pub mod distributor;
/// Business task handlers
pub mod handlers;
/// Mail transport collaborator
pub mod mail;
/// Broker trait and in-memory broker
pub mod queue;
/// Persistence collaborator
pub mod storage;
/// Task envelope, handler contract, registry and retry policy
pub mod task;
/// Worker loop and worker pool
pub mod worker;

pub use config::Config;
pub use distributor::{BrokerDistributor, EnqueueInfo, TaskDistributor};
pub use queue::memory::MemoryBroker;
pub use task::handler::{HandlerError, TaskContext, TaskHandler};
pub use task::registry::{HandlerRegistry, RegistryBuilder};
pub use task::{Task, TaskKind, TaskOptions, TaskState};
pub use worker::pool::WorkerPool;

use thiserror::Error;

/// Result type for task relay operations
pub type Result<T> = std::result::Result<T, TaskQueueError>;

/// Error types for the task relay
#[derive(Error, Debug)]
pub enum TaskQueueError {
    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker refused or could not accept a submission
    #[error("Enqueue error: {0}")]
    Enqueue(String),

    /// No handler is registered for the task type
    #[error("No handler registered for task type: {0}")]
    UnregisteredType(String),

    /// Handler flagged the failure as unrecoverable
    #[error("Task failed without retry: {0}")]
    SkipRetry(String),

    /// Task kept failing until its retry budget was spent
    #[error("Task failed after {retries} retries: {reason}")]
    RetriesExhausted {
        /// Number of retries performed
        retries: u32,
        /// Error of the last attempt
        reason: String,
    },

    /// Two handlers registered under one task type
    #[error("Handler already registered for task type: {0}")]
    DuplicateHandler(String),

    /// No queue had an eligible task
    #[error("Queue is empty")]
    QueueEmpty,

    /// Task with the specified ID is not held by the broker
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Worker pool encountered an error
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TaskQueueError {
    /// Whether this error ends a task's life in the dead-letter set
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskQueueError::UnregisteredType(_)
                | TaskQueueError::SkipRetry(_)
                | TaskQueueError::RetriesExhausted { .. }
        )
    }
}
