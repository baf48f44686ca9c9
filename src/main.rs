//! checkwarden daemon.
//!
//! Opens the store, wires the usecases and runs the scheduler until Ctrl-C.

use checkwarden::checker::CheckerRegistry;
use checkwarden::config::ServerConfig;
use checkwarden::db::Store;
use checkwarden::scheduler::{CheckScheduler, DisabledScheduler, Scheduler, SchedulerConfig};
use checkwarden::storage::CheckerStorage;
use checkwarden::usecase::{ResultUsecase, ScheduleUsecase};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("checkwarden=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting checkwarden with {} workers...", cfg.test_workers);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");
    let storage: Arc<dyn CheckerStorage> = Arc::new(store);

    let registry = Arc::new(CheckerRegistry::with_builtin());
    tracing::info!("Registered {} checkers", registry.len());

    let schedules = Arc::new(ScheduleUsecase::new(storage.clone(), registry.clone()));
    let results = Arc::new(ResultUsecase::new(
        storage.clone(),
        cfg.max_results_per_check,
        cfg.result_retention_days,
    ));

    let scheduler: Arc<dyn CheckScheduler> = if cfg.disable_scheduler {
        tracing::warn!("Scheduler disabled in configuration");
        Arc::new(DisabledScheduler)
    } else {
        let scheduler = Scheduler::new(SchedulerConfig::from(&cfg), storage, registry, schedules, results);
        scheduler.start().await?;
        Arc::new(scheduler)
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    scheduler.close().await;

    Ok(())
}
