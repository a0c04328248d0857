//! Configuration

use crate::queue::weighted::QueueWeights;
use crate::queue::{CRITICAL_QUEUE, DEFAULT_QUEUE};
use crate::task::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "TASK_RELAY_";

/// Where [`Config::load_with_source`] found the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A YAML or TOML file
    File(String),
    /// `TASK_RELAY_*` environment variables
    Env,
    /// Nothing found, built-in defaults
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "file {}", path),
            ConfigSource::Env => f.write_str("environment variables"),
            ConfigSource::Defaults => f.write_str("built-in defaults"),
        }
    }
}

/// Configuration for the task relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of concurrent workers in the pool
    pub worker_count: usize,

    /// Queue name to weight; weights set each queue's share of claims
    pub queues: BTreeMap<String, u32>,

    /// Maximum number of pending tasks per queue
    pub max_queue_size: usize,

    /// Handler execution timeout in seconds
    pub task_timeout_secs: u64,

    /// Retry budget for tasks submitted without an explicit one
    pub default_max_retry: u32,

    /// Backoff delay before the first retry, in milliseconds
    pub retry_base_delay_ms: u64,

    /// Upper bound on any backoff delay, in milliseconds
    pub retry_max_delay_ms: u64,

    /// Random jitter added to backoff, as a fraction of the delay (0.0 - 1.0)
    pub retry_jitter: f64,

    /// How long a claim stays exclusive before the task can be claimed again
    pub visibility_timeout_secs: u64,

    /// Wait between claim attempts when every queue is empty
    pub poll_interval_ms: u64,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,

    /// Number of completed tasks the in-memory broker keeps for inspection
    pub completed_history: usize,

    /// Number of dead-lettered tasks the in-memory broker keeps
    pub dead_letter_history: usize,

    /// Base URL used in verification links
    pub verify_email_base_url: String,

    /// Default log filter when RUST_LOG is unset
    pub log_level: String,

    /// Emit logs as JSON lines
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        let mut queues = BTreeMap::new();
        queues.insert(CRITICAL_QUEUE.to_string(), 10);
        queues.insert(DEFAULT_QUEUE.to_string(), 5);

        Self {
            worker_count: num_cpus(),
            queues,
            max_queue_size: 10000,
            task_timeout_secs: 60,
            default_max_retry: 25,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 10 * 60 * 1000,
            retry_jitter: 0.2,
            visibility_timeout_secs: 300,
            poll_interval_ms: 200,
            shutdown_timeout_secs: 30,
            completed_history: 1000,
            dead_letter_history: 10000,
            verify_email_base_url: "http://localhost:8080".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Create a new configuration with a custom worker count
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }

    /// Load configuration from file, environment variables, or defaults
    pub fn load() -> crate::Result<Self> {
        Self::load_with_source().map(|(config, _)| config)
    }

    /// Like [`load`](Self::load), also reporting where the configuration came from.
    ///
    /// Nothing is logged here: the caller usually installs its subscriber from
    /// the loaded config and reports the source afterwards.
    pub fn load_with_source() -> crate::Result<(Self, ConfigSource)> {
        if let Ok(config_path) = env::var("TASK_RELAY_CONFIG") {
            let config = Self::from_file(&config_path)?;
            return Ok((config, ConfigSource::File(config_path)));
        }

        let default_paths = [
            "task-relay.yaml",
            "task-relay.toml",
            "config/task-relay.yaml",
            "config/task-relay.toml",
        ];

        for path in default_paths {
            if Path::new(path).exists() {
                let config = Self::from_file(path)?;
                return Ok((config, ConfigSource::File(path.to_string())));
            }
        }

        match Self::from_env()? {
            Some(config) => Ok((config, ConfigSource::Env)),
            None => Ok((Self::default(), ConfigSource::Defaults)),
        }
    }

    /// Load configuration from a file (YAML or TOML)
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(|e| {
                crate::TaskQueueError::Config(format!("Failed to load config file: {}", e))
            })?;

        let config: Config = settings.try_deserialize().map_err(|e| {
            crate::TaskQueueError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `TASK_RELAY_*` environment variables.
    ///
    /// Returns `Ok(None)` when none of the variables is set.
    pub fn from_env() -> crate::Result<Option<Self>> {
        let mut config = Self::default();
        let mut found_any = false;

        macro_rules! env_field {
            ($field:ident, $key:literal) => {
                if let Some(val) = parse_env(concat!("TASK_RELAY_", $key))? {
                    config.$field = val;
                    found_any = true;
                }
            };
        }

        env_field!(worker_count, "WORKER_COUNT");
        env_field!(max_queue_size, "MAX_QUEUE_SIZE");
        env_field!(task_timeout_secs, "TASK_TIMEOUT_SECS");
        env_field!(default_max_retry, "DEFAULT_MAX_RETRY");
        env_field!(retry_base_delay_ms, "RETRY_BASE_DELAY_MS");
        env_field!(retry_max_delay_ms, "RETRY_MAX_DELAY_MS");
        env_field!(retry_jitter, "RETRY_JITTER");
        env_field!(visibility_timeout_secs, "VISIBILITY_TIMEOUT_SECS");
        env_field!(poll_interval_ms, "POLL_INTERVAL_MS");
        env_field!(shutdown_timeout_secs, "SHUTDOWN_TIMEOUT_SECS");
        env_field!(completed_history, "COMPLETED_HISTORY");
        env_field!(dead_letter_history, "DEAD_LETTER_HISTORY");
        env_field!(verify_email_base_url, "VERIFY_EMAIL_BASE_URL");
        env_field!(log_level, "LOG_LEVEL");
        env_field!(log_json, "LOG_JSON");

        if let Ok(val) = env::var(format!("{ENV_PREFIX}QUEUES")) {
            config.queues = parse_queues(&val)?;
            found_any = true;
        }

        if !found_any {
            return Ok(None);
        }

        config.validate()?;
        Ok(Some(config))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.worker_count == 0 {
            return Err(crate::TaskQueueError::Config(
                "Worker count must be greater than 0".to_string(),
            ));
        }

        if self.queues.is_empty() {
            return Err(crate::TaskQueueError::Config(
                "At least one queue must be configured".to_string(),
            ));
        }

        if let Some((name, _)) = self.queues.iter().find(|(_, weight)| **weight == 0) {
            return Err(crate::TaskQueueError::Config(format!(
                "Queue '{}' must have a weight greater than 0",
                name
            )));
        }

        if self.max_queue_size == 0 {
            return Err(crate::TaskQueueError::Config(
                "Max queue size must be greater than 0".to_string(),
            ));
        }

        if self.task_timeout_secs == 0 {
            return Err(crate::TaskQueueError::Config(
                "Task timeout must be greater than 0".to_string(),
            ));
        }

        if self.task_timeout_secs >= self.visibility_timeout_secs {
            return Err(crate::TaskQueueError::Config(
                "Task timeout must be shorter than the visibility timeout".to_string(),
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(crate::TaskQueueError::Config(
                "Poll interval must be greater than 0".to_string(),
            ));
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(crate::TaskQueueError::Config(
                "Retry base delay must not exceed the max delay".to_string(),
            ));
        }

        if self.dead_letter_history == 0 {
            return Err(crate::TaskQueueError::Config(
                "Dead letter history must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(crate::TaskQueueError::Config(
                "Retry jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Queue weights served by the worker pool
    pub fn queue_weights(&self) -> QueueWeights {
        QueueWeights::new(self.queues.iter().map(|(name, weight)| (name.clone(), *weight)))
    }

    /// Backoff policy derived from the retry settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
            self.retry_jitter,
        )
    }

    /// Handler execution timeout
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Claim visibility timeout
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Idle wait between claims
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Graceful shutdown window
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn parse_env<T>(key: &str) -> crate::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.parse().map(Some).map_err(|e| {
            crate::TaskQueueError::Config(format!(
                "Invalid {}: {}",
                key.trim_start_matches(ENV_PREFIX),
                e
            ))
        }),
        Err(_) => Ok(None),
    }
}

/// Parse `name=weight` pairs separated by commas, e.g. `critical=10,default=5`
fn parse_queues(raw: &str) -> crate::Result<BTreeMap<String, u32>> {
    let mut queues = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, weight) = entry.split_once('=').ok_or_else(|| {
            crate::TaskQueueError::Config(format!("Invalid QUEUES entry: {}", entry))
        })?;
        let weight = weight.trim().parse::<u32>().map_err(|e| {
            crate::TaskQueueError::Config(format!("Invalid weight for queue {}: {}", name, e))
        })?;
        queues.insert(name.trim().to_string(), weight);
    }
    Ok(queues)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
