use crate::config::Config;
use crate::queue::Broker;
use crate::task::registry::HandlerRegistry;
use crate::task::Task;
use crate::worker::{log_error_hook, ErrorHook, TaskEvent, Worker, WorkerShared};
use crate::TaskQueueError;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long cancelled workers get to hand their claims back before being aborted
const CANCEL_GRACE: Duration = Duration::from_millis(250);

/// Capacity of the task event channel; slow subscribers lag rather than block workers
const EVENT_CAPACITY: usize = 1024;

/// A pool of workers that claim and process tasks concurrently
pub struct WorkerPool<B: Broker + 'static> {
    worker_count: usize,
    shared: Arc<WorkerShared<B>>,
    cancellation: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl<B: Broker + 'static> WorkerPool<B> {
    /// Create a pool draining `broker` with the handlers in `registry`.
    ///
    /// Fails when `config` is invalid or when a handler could outlive the
    /// broker's claim on its task.
    pub fn new(
        config: &Config,
        broker: Arc<B>,
        registry: HandlerRegistry,
    ) -> crate::Result<Self> {
        config.validate()?;
        let task_timeout = config.task_timeout();
        let visibility_timeout = broker.visibility_timeout();
        if task_timeout >= visibility_timeout {
            return Err(TaskQueueError::Config(format!(
                "Task timeout {:?} must be shorter than the broker visibility timeout {:?}",
                task_timeout, visibility_timeout
            )));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            worker_count: config.worker_count,
            shared: Arc::new(WorkerShared {
                broker,
                registry: Arc::new(registry),
                weights: config.queue_weights(),
                retry_policy: config.retry_policy(),
                task_timeout,
                poll_interval: config.poll_interval(),
                error_hook: log_error_hook(),
                events,
            }),
            cancellation: CancellationToken::new(),
            handles: Vec::new(),
            shutdown_tx: None,
        })
    }

    /// Replace the terminal-failure hook.
    ///
    /// Must be called before [`start`](Self::start).
    pub fn with_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Task, &TaskQueueError) + Send + Sync + 'static,
    {
        let hook: ErrorHook = Arc::new(hook);
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.error_hook = hook,
            None => warn!("Error hook ignored: worker pool already started"),
        }
        self
    }

    /// Receive every task state transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }

    /// Start the worker pool
    pub async fn start(&mut self) -> crate::Result<()> {
        if self.is_running() {
            return Err(TaskQueueError::WorkerPool(
                "Worker pool already running".to_string(),
            ));
        }
        if self.shared.registry.is_empty() {
            warn!("Starting worker pool without any registered handlers");
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.cancellation = CancellationToken::new();

        info!(
            "Starting worker pool with {} workers on queues {:?}",
            self.worker_count,
            self.shared.weights.names().collect::<Vec<_>>()
        );

        for i in 0..self.worker_count {
            let worker = Worker::new(i, Arc::clone(&self.shared), self.cancellation.clone());
            let shutdown_rx = shutdown_tx.subscribe();

            let handle = tokio::spawn(async move {
                worker.run_with_shutdown(shutdown_rx).await;
            });

            self.handles.push(handle);
        }

        Ok(())
    }

    /// Stop claiming, let in-flight tasks finish within `grace`, then cancel the rest.
    ///
    /// Tasks cancelled this way are released back to their queue without
    /// spending an attempt. Returns an error when the grace period ran out.
    pub async fn shutdown(&mut self, grace: Duration) -> crate::Result<()> {
        info!("Initiating graceful shutdown...");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        info!(
            "Waiting for {} workers to complete (timeout: {:?})...",
            self.handles.len(),
            grace
        );

        let deadline = Instant::now() + grace;
        let mut handles = std::mem::take(&mut self.handles).into_iter().enumerate();
        let mut remaining = Vec::new();
        while let Some((idx, mut handle)) = handles.next() {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!("Worker {} stopped gracefully", idx),
                Ok(Err(e)) => warn!("Worker {} panicked: {}", idx, e),
                Err(_) => {
                    remaining.push((idx, handle));
                    remaining.extend(handles.by_ref());
                    break;
                }
            }
        }

        if remaining.is_empty() {
            info!("All workers stopped successfully");
            return Ok(());
        }

        warn!(
            "Shutdown timeout exceeded, cancelling {} busy workers",
            remaining.len()
        );
        self.cancellation.cancel();

        let deadline = Instant::now() + CANCEL_GRACE;
        for (idx, mut handle) in remaining {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Worker {} did not stop after cancellation, aborting", idx);
                handle.abort();
            }
        }

        Err(TaskQueueError::WorkerPool(
            "Shutdown timeout exceeded".to_string(),
        ))
    }

    /// Get the number of workers in the pool
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Check if the pool is running
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Handlers this pool dispatches to
    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }
}
