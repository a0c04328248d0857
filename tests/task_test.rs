use serde::{Deserialize, Serialize};
use std::sync::Arc;
use task_relay::handlers::verify_email::PayloadSendVerifyEmail;
use task_relay::queue::memory::MemoryBroker;
use task_relay::queue::weighted::QueueWeights;
use task_relay::queue::{Broker, CRITICAL_QUEUE, DEFAULT_QUEUE};
use task_relay::{BrokerDistributor, Task, TaskKind, TaskOptions, TaskQueueError, TaskState};
use tokio::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Report {
    account: String,
    months: Vec<u8>,
    note: Option<String>,
}

impl TaskKind for Report {
    const TYPE: &'static str = "task:monthly_report";
}

#[test]
fn test_task_creation() {
    let task = Task::new("test", b"{}".to_vec(), 3);

    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.queue, DEFAULT_QUEUE);
    assert_eq!(task.retry_count, 0);
    assert!(task.process_at.is_none());
    assert!(task.is_ready());
}

#[test]
fn test_task_options() {
    let options = TaskOptions::new()
        .queue(CRITICAL_QUEUE)
        .max_retry(10)
        .process_in(Duration::from_secs(10));
    let task = Task::with_options("test", Vec::new(), options, 25);

    assert_eq!(task.queue, CRITICAL_QUEUE);
    assert_eq!(task.max_retry, 10);
    assert!(!task.is_ready());

    let task = Task::with_options("test", Vec::new(), TaskOptions::new(), 25);
    assert_eq!(task.queue, DEFAULT_QUEUE);
    assert_eq!(task.max_retry, 25);
}

#[test]
fn test_task_retry_budget() {
    let mut task = Task::new("retry_test", Vec::new(), 2);
    assert!(task.can_retry());

    task.mark_retrying("Error 1".to_string(), chrono::Utc::now());
    assert_eq!(task.state, TaskState::Retrying);
    assert!(task.can_retry());

    task.mark_retrying("Error 2".to_string(), chrono::Utc::now());
    assert_eq!(task.retry_count, 2);
    assert!(!task.can_retry());
    assert_eq!(task.last_error.as_deref(), Some("Error 2"));
}

#[test]
fn test_zero_retry_budget() {
    let task = Task::new("once", Vec::new(), 0);
    assert!(!task.can_retry());
}

#[tokio::test]
async fn test_payload_survives_distribution() {
    let broker = Arc::new(MemoryBroker::new());
    let distributor = BrokerDistributor::new(Arc::clone(&broker), 25);
    let report = Report {
        account: "ünïcode åccount".into(),
        months: vec![1, 2, 12],
        note: None,
    };

    let info = distributor
        .distribute(&report, TaskOptions::new())
        .await
        .unwrap();
    assert_eq!(info.queue, DEFAULT_QUEUE);
    assert_eq!(info.max_retry, 25);

    let claimed = broker
        .claim(&QueueWeights::single(DEFAULT_QUEUE))
        .await
        .unwrap();
    assert_eq!(claimed.id, info.id);
    assert_eq!(claimed.task_type, Report::TYPE);
    assert_eq!(claimed.decode::<Report>().unwrap(), report);
}

#[tokio::test]
async fn test_verify_email_payload_wire_format() {
    let broker = Arc::new(MemoryBroker::new());
    let distributor = BrokerDistributor::new(Arc::clone(&broker), 25);
    let payload = PayloadSendVerifyEmail {
        username: "alice".into(),
    };

    distributor
        .distribute(&payload, TaskOptions::new().queue(CRITICAL_QUEUE))
        .await
        .unwrap();

    let claimed = broker
        .claim(&QueueWeights::single(CRITICAL_QUEUE))
        .await
        .unwrap();
    assert_eq!(claimed.task_type, "task:send_verification_email");
    assert_eq!(claimed.payload_str(), r#"{"username":"alice"}"#);
}

#[tokio::test]
async fn test_submit_rejects_blank_names() {
    let distributor = BrokerDistributor::new(Arc::new(MemoryBroker::new()), 3);

    let err = distributor
        .submit(" ", &serde_json::json!({}), TaskOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskQueueError::Enqueue(_)));

    let err = distributor
        .submit("task:x", &serde_json::json!({}), TaskOptions::new().queue(""))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskQueueError::Enqueue(_)));
}

#[tokio::test]
async fn test_full_broker_reports_enqueue_error() {
    let broker = Arc::new(MemoryBroker::new().with_max_queue_size(1));
    let distributor = BrokerDistributor::new(broker, 3);

    distributor
        .submit("task:x", &serde_json::json!({}), TaskOptions::new())
        .await
        .unwrap();
    let err = distributor
        .submit("task:x", &serde_json::json!({}), TaskOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskQueueError::Enqueue(_)));
}
