//! Memory

use crate::config::Config;
use crate::queue::weighted::QueueWeights;
use crate::queue::{Broker, BrokerStats};
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Wrapper ordering tasks by eligibility time, then by enqueue sequence
struct ScheduledTask {
    task: Task,
    eligible_at: DateTime<Utc>,
    /// Sequence number for FIFO ordering within the same eligibility time
    sequence: u64,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.eligible_at == other.eligible_at && self.sequence == other.sequence
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed because BinaryHeap is a max-heap: earliest first
        other
            .eligible_at
            .cmp(&self.eligible_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A claimed task and the moment its claim lapses
struct Lease {
    task: Task,
    lease_id: u64,
    expires_at: DateTime<Utc>,
}

struct Inner {
    queues: HashMap<String, BinaryHeap<ScheduledTask>>,
    /// Pending task id to queue name
    index: HashMap<String, String>,
    in_flight: HashMap<String, Lease>,
    completed: VecDeque<Task>,
    dead: VecDeque<Task>,
    sequence: u64,
    next_lease: u64,
    rng: StdRng,
}

impl Inner {
    fn push(&mut self, task: Task, eligible_at: DateTime<Utc>) {
        let sequence = self.sequence;
        self.sequence += 1;
        self.index.insert(task.id.clone(), task.queue.clone());
        self.queues
            .entry(task.queue.clone())
            .or_default()
            .push(ScheduledTask {
                task,
                eligible_at,
                sequence,
            });
    }

    /// End the live claim `task` was handed, rejecting reports from an older claim
    fn take_lease(&mut self, task: &Task) -> crate::Result<Task> {
        let live = match self.in_flight.get(&task.id) {
            Some(lease) if task.lease_id == Some(lease.lease_id) => true,
            Some(_) => {
                warn!(
                    "Rejected report on task {} from a claim that has been superseded",
                    task.id
                );
                false
            }
            None => false,
        };
        if !live {
            return Err(crate::TaskQueueError::TaskNotFound(task.id.clone()));
        }
        self.in_flight
            .remove(&task.id)
            .map(|lease| lease.task)
            .ok_or_else(|| crate::TaskQueueError::TaskNotFound(task.id.clone()))
    }

    /// Return claims whose visibility timeout lapsed to their queues
    fn recover_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(lease) = self.in_flight.remove(&id) {
                warn!(
                    "Claim on task {} ({}) expired, returning it to queue {}",
                    id, lease.task.task_type, lease.task.queue
                );
                let mut task = lease.task;
                task.mark_pending();
                self.push(task, now);
            }
        }
    }
}

fn is_eligible(
    queues: &HashMap<String, BinaryHeap<ScheduledTask>>,
    queue: &str,
    now: DateTime<Utc>,
) -> bool {
    queues
        .get(queue)
        .and_then(BinaryHeap::peek)
        .map_or(false, |head| head.eligible_at <= now)
}

/// In-process broker.
///
/// All state sits behind one mutex, which makes every claim atomic: a task
/// is handed to a single caller at a time.
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    max_queue_size: usize,
    visibility_timeout: Duration,
    completed_history: usize,
    dead_letter_history: usize,
}

impl MemoryBroker {
    /// Create a broker with default limits
    pub fn new() -> Self {
        Self::from_config(&Config::default())
    }

    /// Create a broker using the limits in `config`
    pub fn from_config(config: &Config) -> Self {
        Self::build(config, StdRng::from_entropy())
    }

    /// Create a broker whose queue choices are reproducible
    pub fn with_seed(seed: u64) -> Self {
        Self::build(&Config::default(), StdRng::seed_from_u64(seed))
    }

    /// Override the claim visibility timeout
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Override the per-queue capacity
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Override how many dead-lettered tasks are kept
    pub fn with_dead_letter_history(mut self, dead_letter_history: usize) -> Self {
        self.dead_letter_history = dead_letter_history;
        self
    }

    fn build(config: &Config, rng: StdRng) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                index: HashMap::new(),
                in_flight: HashMap::new(),
                completed: VecDeque::new(),
                dead: VecDeque::new(),
                sequence: 0,
                next_lease: 0,
                rng,
            }),
            max_queue_size: config.max_queue_size,
            visibility_timeout: config.visibility_timeout(),
            completed_history: config.completed_history,
            dead_letter_history: config.dead_letter_history,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, mut task: Task) -> crate::Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.index.contains_key(&task.id) || inner.in_flight.contains_key(&task.id) {
            return Err(crate::TaskQueueError::Enqueue(format!(
                "task {} is already queued",
                task.id
            )));
        }

        let queued = inner.queues.get(&task.queue).map_or(0, BinaryHeap::len);
        if queued >= self.max_queue_size {
            return Err(crate::TaskQueueError::Enqueue(format!(
                "queue {} is full ({} tasks)",
                task.queue, queued
            )));
        }

        task.mark_pending();
        let eligible_at = task.eligible_at();
        debug!(
            "Task {} enqueued on {} (eligible at {})",
            task.id, task.queue, eligible_at
        );
        inner.push(task, eligible_at);
        Ok(())
    }

    async fn claim(&self, weights: &QueueWeights) -> crate::Result<Task> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.recover_expired(now);

        let picked = {
            let Inner { queues, rng, .. } = &mut *inner;
            weights
                .pick(|queue| is_eligible(queues, queue, now), rng)
                .map(str::to_string)
        };

        let queue = picked.ok_or(crate::TaskQueueError::QueueEmpty)?;
        let scheduled = inner
            .queues
            .get_mut(&queue)
            .and_then(BinaryHeap::pop)
            .ok_or(crate::TaskQueueError::QueueEmpty)?;

        let mut task = scheduled.task;
        inner.index.remove(&task.id);
        inner.next_lease += 1;
        let lease_id = inner.next_lease;
        task.mark_running();
        task.lease_id = Some(lease_id);
        inner.in_flight.insert(
            task.id.clone(),
            Lease {
                task: task.clone(),
                lease_id,
                expires_at: after(now, self.visibility_timeout),
            },
        );

        debug!("Task {} claimed from {}", task.id, queue);
        Ok(task)
    }

    async fn ack(&self, task: &Task) -> crate::Result<()> {
        let mut inner = self.inner.lock().await;
        let mut done = inner.take_lease(task)?;
        done.mark_completed();

        inner.completed.push_back(done);
        while inner.completed.len() > self.completed_history {
            inner.completed.pop_front();
        }
        debug!("Task {} acknowledged", task.id);
        Ok(())
    }

    async fn retry(&self, task: &Task, delay: Duration, error: &str) -> crate::Result<Task> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut retrying = inner.take_lease(task)?;
        let next_attempt = after(now, delay);
        retrying.mark_retrying(error.to_string(), next_attempt);

        let mut requeued = retrying.clone();
        requeued.mark_pending();
        inner.push(requeued, next_attempt);

        debug!(
            "Task {} rescheduled (retry {}/{}) at {}",
            task.id, retrying.retry_count, retrying.max_retry, next_attempt
        );
        Ok(retrying)
    }

    async fn dead_letter(&self, task: &Task, error: &str) -> crate::Result<Task> {
        let mut inner = self.inner.lock().await;
        let mut failed = inner.take_lease(task)?;
        failed.mark_failed(error.to_string());
        inner.dead.push_back(failed.clone());
        while inner.dead.len() > self.dead_letter_history {
            if let Some(dropped) = inner.dead.pop_front() {
                debug!("Dead letter {} dropped from history", dropped.id);
            }
        }
        debug!("Task {} dead-lettered", task.id);
        Ok(failed)
    }

    async fn release(&self, task: &Task) -> crate::Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut released = inner.take_lease(task)?;
        released.mark_pending();
        inner.push(released, now);
        debug!("Task {} released", task.id);
        Ok(())
    }

    async fn size(&self, queue: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.queues.get(queue).map_or(0, BinaryHeap::len)
    }

    async fn stats(&self) -> BrokerStats {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let (pending, scheduled) = inner
            .queues
            .values()
            .flat_map(BinaryHeap::iter)
            .fold((0, 0), |(pending, scheduled), entry| {
                if entry.eligible_at <= now {
                    (pending + 1, scheduled)
                } else {
                    (pending, scheduled + 1)
                }
            });

        BrokerStats {
            pending,
            scheduled,
            in_flight: inner.in_flight.len(),
            completed: inner.completed.len(),
            dead: inner.dead.len(),
        }
    }

    async fn get(&self, task_id: &str) -> crate::Result<Task> {
        let inner = self.inner.lock().await;

        if let Some(lease) = inner.in_flight.get(task_id) {
            return Ok(lease.task.clone());
        }

        let queued = inner
            .index
            .get(task_id)
            .and_then(|queue| inner.queues.get(queue))
            .and_then(|heap| heap.iter().find(|entry| entry.task.id == task_id))
            .map(|entry| entry.task.clone());

        queued
            .or_else(|| inner.dead.iter().find(|t| t.id == task_id).cloned())
            .or_else(|| inner.completed.iter().find(|t| t.id == task_id).cloned())
            .ok_or_else(|| crate::TaskQueueError::TaskNotFound(task_id.to_string()))
    }

    async fn completed(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        inner.completed.iter().cloned().collect()
    }

    async fn dead_letters(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        inner.dead.iter().cloned().collect()
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}
