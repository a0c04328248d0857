//! Task Relay binary entry point

use std::sync::Arc;
use task_relay::accounts::AccountService;
use task_relay::config::ConfigSource;
use task_relay::handlers::{build_registry, HandlerDeps};
use task_relay::mail::memory::MemoryMailer;
use task_relay::queue::Broker;
use task_relay::storage::backend::MemoryStore;
use task_relay::storage::CreateUserParams;
use task_relay::{BrokerDistributor, Config, MemoryBroker, WorkerPool};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (config, source) = Config::load_with_source()?;
    init_tracing(&config)?;

    info!("Starting Task Relay");
    match source {
        ConfigSource::Defaults => warn!("No config file or environment found, using defaults"),
        source => info!("Loaded config from {}", source),
    }
    info!(
        "Initialized with {} workers, queues: {:?}, max queue size: {}",
        config.worker_count, config.queues, config.max_queue_size
    );

    let broker = Arc::new(MemoryBroker::from_config(&config));
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(MemoryMailer::new("Task Relay", "noreply@task-relay.local"));

    let registry = build_registry(HandlerDeps {
        store: store.clone(),
        mailer: mailer.clone(),
        verify_email_base_url: config.verify_email_base_url.clone(),
    })?;

    let mut worker_pool = WorkerPool::new(&config, Arc::clone(&broker), registry)?;
    worker_pool.start().await?;

    let distributor = Arc::new(BrokerDistributor::new(
        Arc::clone(&broker),
        config.default_max_retry,
    ));
    let accounts = AccountService::new(store, distributor);
    let user = accounts
        .create_user(CreateUserParams {
            username: "demo".to_string(),
            full_name: "Demo User".to_string(),
            email: "demo@task-relay.local".to_string(),
        })
        .await?;
    info!("Signed up {}, waiting for Ctrl-C", user.username);

    tokio::signal::ctrl_c().await?;

    if let Err(e) = worker_pool.shutdown(config.shutdown_timeout()).await {
        warn!("{}", e);
    }
    info!(
        "Stopped with {:?}, {} emails sent",
        broker.stats().await,
        mailer.sent().await.len()
    );

    Ok(())
}
