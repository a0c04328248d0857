/// Worker pool implementation
pub mod pool;

use crate::handlers::KnownTask;
use crate::queue::weighted::QueueWeights;
use crate::queue::Broker;
use crate::task::handler::{HandlerError, TaskContext};
use crate::task::registry::HandlerRegistry;
use crate::task::retry::RetryPolicy;
use crate::task::{Task, TaskState};
use crate::TaskQueueError;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observer for terminal failures.
///
/// Runs once per dead-lettered task. It cannot change the outcome, and a
/// panic inside it is caught and logged.
pub type ErrorHook = Arc<dyn Fn(&Task, &TaskQueueError) + Send + Sync>;

/// Hook that logs the failed task's type and payload
pub fn log_error_hook() -> ErrorHook {
    Arc::new(|task: &Task, err: &TaskQueueError| {
        error!(
            task_id = %task.id,
            task_type = %task.task_type,
            payload = %task.payload_str(),
            error = %err,
            "process task failed"
        );
    })
}

/// A task state transition observed by the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskEvent {
    /// Task id
    pub task_id: String,
    /// Task type
    pub task_type: String,
    /// Queue the task was claimed from
    pub queue: String,
    /// State entered
    pub state: TaskState,
    /// Retry count after the transition
    pub retry_count: u32,
    /// Error that caused the transition, if any
    pub error: Option<String>,
}

impl TaskEvent {
    fn new(task: &Task, state: TaskState) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            queue: task.queue.clone(),
            state,
            retry_count: task.retry_count,
            error: task.last_error.clone(),
        }
    }
}

/// What a worker did with one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Retrying { delay: Duration },
    Failed,
    /// Claim handed back untouched after cancellation
    Released,
    /// The claim lapsed before the outcome could be recorded
    ClaimLost,
}

/// State shared by every worker of a pool
pub(crate) struct WorkerShared<B: Broker> {
    pub(crate) broker: Arc<B>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) weights: QueueWeights,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) task_timeout: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) error_hook: ErrorHook,
    pub(crate) events: broadcast::Sender<TaskEvent>,
}

/// A worker that claims and executes tasks one at a time
pub(crate) struct Worker<B: Broker> {
    id: usize,
    shared: Arc<WorkerShared<B>>,
    cancellation: CancellationToken,
}

impl<B: Broker + 'static> Worker<B> {
    /// Create a worker; `cancellation` interrupts in-flight handlers
    pub(crate) fn new(
        id: usize,
        shared: Arc<WorkerShared<B>>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            id,
            shared,
            cancellation,
        }
    }

    /// Claim and process tasks until a shutdown signal arrives
    pub(crate) async fn run_with_shutdown(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Worker {} started", self.id);

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }

            match self.shared.broker.claim(&self.shared.weights).await {
                Ok(task) => {
                    debug!("Worker {} claimed task {}", self.id, task.id);
                    self.process(task).await;
                }
                Err(e) => {
                    if !matches!(e, TaskQueueError::QueueEmpty) {
                        error!("Worker {} failed to claim: {}", self.id, e);
                    }
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = sleep(self.shared.poll_interval) => {}
                    }
                }
            }
        }

        info!("Worker {} stopped", self.id);
    }

    /// Execute one claimed task and report its outcome to the broker
    pub(crate) async fn process(&self, task: Task) -> Outcome {
        self.emit(TaskEvent::new(&task, TaskState::Running));

        let Some(handler) = self.shared.registry.resolve(&task.task_type) else {
            let reason = if KnownTask::from_type_name(&task.task_type).is_some() {
                "known task type has no handler in this deployment"
            } else {
                "unknown task type"
            };
            warn!(
                "Worker {} cannot dispatch task {} of type {}: {}",
                self.id, task.id, task.task_type, reason
            );
            let err = TaskQueueError::UnregisteredType(task.task_type.clone());
            return self.fail(&task, err).await;
        };

        let ctx = TaskContext::new(&task, self.cancellation.child_token());
        let mut execution = tokio::spawn({
            let task = task.clone();
            async move { handler.handle(&ctx, &task).await }
        });

        let result = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => {
                execution.abort();
                Err(HandlerError::Cancelled)
            }
            joined = timeout(self.shared.task_timeout, &mut execution) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(HandlerError::retry(format!("handler panicked: {join_err}"))),
                Err(_) => {
                    execution.abort();
                    Err(HandlerError::retry(format!(
                        "task timed out after {:?}",
                        self.shared.task_timeout
                    )))
                }
            },
        };

        match result {
            Ok(()) => self.complete(&task).await,
            Err(HandlerError::Cancelled) => self.release(&task).await,
            Err(HandlerError::SkipRetry(msg)) => {
                self.fail(&task, TaskQueueError::SkipRetry(msg)).await
            }
            Err(HandlerError::Retry(msg)) if task.can_retry() => self.reschedule(&task, &msg).await,
            Err(HandlerError::Retry(msg)) => {
                let err = TaskQueueError::RetriesExhausted {
                    retries: task.retry_count,
                    reason: msg,
                };
                self.fail(&task, err).await
            }
        }
    }

    async fn complete(&self, task: &Task) -> Outcome {
        match self.shared.broker.ack(task).await {
            Ok(()) => {
                info!("Worker {} completed task {}", self.id, task.id);
                let mut done = task.clone();
                done.mark_completed();
                self.emit(TaskEvent::new(&done, TaskState::Completed));
                Outcome::Completed
            }
            Err(e) => self.claim_lost(task, &e),
        }
    }

    async fn reschedule(&self, task: &Task, error: &str) -> Outcome {
        let delay = self.shared.retry_policy.backoff(task.retry_count);
        match self.shared.broker.retry(task, delay, error).await {
            Ok(retrying) => {
                warn!(
                    "Worker {} retrying task {} ({}/{}) in {:?}: {}",
                    self.id, task.id, retrying.retry_count, retrying.max_retry, delay, error
                );
                self.emit(TaskEvent::new(&retrying, TaskState::Retrying));
                Outcome::Retrying { delay }
            }
            Err(e) => self.claim_lost(task, &e),
        }
    }

    async fn fail(&self, task: &Task, err: TaskQueueError) -> Outcome {
        match self.shared.broker.dead_letter(task, &err.to_string()).await {
            Ok(failed) => {
                error!("Worker {} dead-lettered task {}: {}", self.id, task.id, err);
                self.emit(TaskEvent::new(&failed, TaskState::Failed));
                self.notify(&failed, &err);
                Outcome::Failed
            }
            Err(e) => self.claim_lost(task, &e),
        }
    }

    async fn release(&self, task: &Task) -> Outcome {
        match self.shared.broker.release(task).await {
            Ok(()) => {
                info!("Worker {} released task {} after cancellation", self.id, task.id);
                let mut pending = task.clone();
                pending.mark_pending();
                self.emit(TaskEvent::new(&pending, TaskState::Pending));
                Outcome::Released
            }
            Err(e) => self.claim_lost(task, &e),
        }
    }

    fn claim_lost(&self, task: &Task, err: &TaskQueueError) -> Outcome {
        warn!(
            "Worker {} lost its claim on task {} before reporting: {}",
            self.id, task.id, err
        );
        Outcome::ClaimLost
    }

    fn notify(&self, task: &Task, err: &TaskQueueError) {
        let hook = &self.shared.error_hook;
        if std::panic::catch_unwind(AssertUnwindSafe(|| hook(task, err))).is_err() {
            error!("Error hook panicked while reporting task {}", task.id);
        }
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryBroker;
    use crate::queue::DEFAULT_QUEUE;
    use crate::task::handler::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker(registry: HandlerRegistry, hook: ErrorHook) -> (Arc<MemoryBroker>, Worker<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        let (events, _) = broadcast::channel(16);
        let shared = Arc::new(WorkerShared {
            broker: Arc::clone(&broker),
            registry: Arc::new(registry),
            weights: QueueWeights::single(DEFAULT_QUEUE),
            retry_policy: RetryPolicy::fixed_curve(Duration::ZERO, Duration::ZERO),
            task_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
            error_hook: hook,
            events,
        });
        (broker, Worker::new(0, shared, CancellationToken::new()))
    }

    async fn claim(broker: &MemoryBroker) -> Task {
        broker
            .claim(&QueueWeights::single(DEFAULT_QUEUE))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn panicking_hook_does_not_change_outcome() {
        let registry = HandlerRegistry::builder()
            .register(
                "task:poison",
                handler_fn(|_, _| async { Err(HandlerError::skip_retry("poison")) }),
            )
            .unwrap()
            .build();
        let (broker, worker) = worker(
            registry,
            Arc::new(|_: &Task, _: &TaskQueueError| panic!("hook exploded")),
        );

        broker
            .enqueue(Task::new("task:poison", b"{}".to_vec(), 3))
            .await
            .unwrap();
        let outcome = worker.process(claim(&broker).await).await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(broker.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn timeout_counts_as_retryable() {
        let registry = HandlerRegistry::builder()
            .register(
                "task:slow",
                handler_fn(|_, _| async {
                    sleep(Duration::from_secs(5)).await;
                    Ok(())
                }),
            )
            .unwrap()
            .build();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&hook_calls);
        let (broker, worker) = worker(
            registry,
            Arc::new(move |_: &Task, _: &TaskQueueError| {
                calls.fetch_add(1, Ordering::SeqCst);
            }),
        );

        broker
            .enqueue(Task::new("task:slow", b"{}".to_vec(), 1))
            .await
            .unwrap();
        let outcome = worker.process(claim(&broker).await).await;
        assert_eq!(
            outcome,
            Outcome::Retrying {
                delay: Duration::ZERO
            }
        );

        let outcome = worker.process(claim(&broker).await).await;
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

        let dead = broker.dead_letters().await;
        assert_eq!(dead[0].retry_count, 1);
        assert!(dead[0].last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn handler_panic_is_retryable() {
        let registry = HandlerRegistry::builder()
            .register(
                "task:panic",
                handler_fn(|ctx: TaskContext, _| async move {
                    if ctx.attempt > 0 {
                        panic!("handler bug");
                    }
                    Ok(())
                }),
            )
            .unwrap()
            .build();
        let (broker, worker) = worker(registry, log_error_hook());

        broker
            .enqueue(Task::new("task:panic", b"{}".to_vec(), 2))
            .await
            .unwrap();
        let outcome = worker.process(claim(&broker).await).await;
        assert!(matches!(outcome, Outcome::Retrying { .. }));
    }

    #[tokio::test]
    async fn cancellation_releases_claim_without_attempt() {
        let registry = HandlerRegistry::builder()
            .register(
                "task:slow",
                handler_fn(|ctx: TaskContext, _| async move {
                    ctx.cancelled().await;
                    Err(HandlerError::Cancelled)
                }),
            )
            .unwrap()
            .build();
        let (broker, worker) = worker(registry, log_error_hook());
        broker
            .enqueue(Task::new("task:slow", b"{}".to_vec(), 2))
            .await
            .unwrap();

        let cancel = worker.cancellation.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let outcome = worker.process(claim(&broker).await).await;
        assert_eq!(outcome, Outcome::Released);
        assert_eq!(broker.size(DEFAULT_QUEUE).await, 1);
        assert_eq!(claim(&broker).await.retry_count, 0);
    }
}
