//! Producer-side task submission
//!
//! Submitting returns once the broker has accepted the envelope. Nothing here
//! waits for, or reports on, the task's execution.

use crate::handlers::verify_email::PayloadSendVerifyEmail;
use crate::queue::Broker;
use crate::task::{encode_payload, Task, TaskKind, TaskOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Acknowledgment that a task reached the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueInfo {
    /// Id assigned to the envelope
    pub id: String,
    /// Queue the envelope was stored on
    pub queue: String,
    /// Effective retry budget
    pub max_retry: u32,
    /// Earliest delivery time, if deferred
    pub process_at: Option<DateTime<Utc>>,
}

/// Task submission port used by request-handling code
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskDistributor: Send + Sync {
    /// Queue a verification email for a freshly created account
    async fn distribute_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        options: TaskOptions,
    ) -> crate::Result<EnqueueInfo>;
}

/// Distributor that writes envelopes straight to a [`Broker`]
pub struct BrokerDistributor<B: Broker> {
    broker: Arc<B>,
    default_max_retry: u32,
}

impl<B: Broker> BrokerDistributor<B> {
    /// Create a distributor; tasks without an explicit budget get `default_max_retry`
    pub fn new(broker: Arc<B>, default_max_retry: u32) -> Self {
        Self {
            broker,
            default_max_retry,
        }
    }

    /// Submit a typed payload under its own task type
    pub async fn distribute<P: TaskKind>(
        &self,
        payload: &P,
        options: TaskOptions,
    ) -> crate::Result<EnqueueInfo> {
        self.submit(P::TYPE, payload, options).await
    }

    /// Serialize `payload` and submit it as a `task_type` envelope
    pub async fn submit<P: Serialize + ?Sized>(
        &self,
        task_type: &str,
        payload: &P,
        options: TaskOptions,
    ) -> crate::Result<EnqueueInfo> {
        if task_type.trim().is_empty() {
            return Err(crate::TaskQueueError::Enqueue(
                "task type must not be empty".to_string(),
            ));
        }
        if matches!(&options.queue, Some(queue) if queue.trim().is_empty()) {
            return Err(crate::TaskQueueError::Enqueue(
                "queue name must not be empty".to_string(),
            ));
        }

        let bytes = encode_payload(payload)?;
        let task = Task::with_options(task_type, bytes, options, self.default_max_retry);
        self.submit_task(task).await
    }

    /// Submit a prepared envelope
    pub async fn submit_task(&self, task: Task) -> crate::Result<EnqueueInfo> {
        let info = EnqueueInfo {
            id: task.id.clone(),
            queue: task.queue.clone(),
            max_retry: task.max_retry,
            process_at: task.process_at,
        };
        let task_type = task.task_type.clone();
        let payload = task.payload_str();

        match self.broker.enqueue(task).await {
            Ok(()) => {
                info!(
                    task_type = %task_type,
                    payload = %payload,
                    queue = %info.queue,
                    max_retry = info.max_retry,
                    "enqueued task"
                );
                Ok(info)
            }
            Err(e) => {
                error!(task_type = %task_type, queue = %info.queue, "failed to enqueue task: {}", e);
                Err(match e {
                    e @ crate::TaskQueueError::Enqueue(_) => e,
                    other => crate::TaskQueueError::Enqueue(other.to_string()),
                })
            }
        }
    }
}

#[async_trait]
impl<B: Broker + 'static> TaskDistributor for BrokerDistributor<B> {
    async fn distribute_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        options: TaskOptions,
    ) -> crate::Result<EnqueueInfo> {
        self.distribute(payload, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryBroker;
    use crate::queue::CRITICAL_QUEUE;
    use crate::TaskQueueError;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn applies_defaults_and_options() {
        let broker = Arc::new(MemoryBroker::new());
        let distributor = BrokerDistributor::new(Arc::clone(&broker), 7);
        let payload = PayloadSendVerifyEmail {
            username: "alice".into(),
        };

        let plain = distributor
            .distribute(&payload, TaskOptions::new())
            .await
            .unwrap();
        assert_eq!(plain.queue, "default");
        assert_eq!(plain.max_retry, 7);

        let critical = distributor
            .distribute(&payload, TaskOptions::new().queue(CRITICAL_QUEUE).max_retry(10))
            .await
            .unwrap();
        assert_eq!(critical.queue, CRITICAL_QUEUE);
        assert_eq!(critical.max_retry, 10);

        let stored = broker.get(&critical.id).await.unwrap();
        assert_eq!(stored.task_type, PayloadSendVerifyEmail::TYPE);
    }

    #[tokio::test]
    async fn non_string_map_keys_fail_serialization() {
        let distributor = BrokerDistributor::new(Arc::new(MemoryBroker::new()), 3);
        let mut payload = BTreeMap::new();
        payload.insert(vec![1u8], "bad key");

        let err = distributor
            .submit("task:bad", &payload, TaskOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskQueueError::Serialization(_)));
    }

    #[tokio::test]
    async fn rejects_blank_names() {
        let distributor = BrokerDistributor::new(Arc::new(MemoryBroker::new()), 3);
        assert!(matches!(
            distributor.submit(" ", &(), TaskOptions::new()).await,
            Err(TaskQueueError::Enqueue(_))
        ));
        assert!(matches!(
            distributor
                .submit("task:x", &(), TaskOptions::new().queue(""))
                .await,
            Err(TaskQueueError::Enqueue(_))
        ));
    }

    #[tokio::test]
    async fn broker_rejection_surfaces_as_enqueue_error() {
        let broker = Arc::new(MemoryBroker::new().with_max_queue_size(1));
        let distributor = BrokerDistributor::new(broker, 3);
        distributor
            .submit("task:x", &(), TaskOptions::new())
            .await
            .unwrap();
        assert!(matches!(
            distributor.submit("task:x", &(), TaskOptions::new()).await,
            Err(TaskQueueError::Enqueue(_))
        ));
    }
}
