use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use log::{info, warn};

use crate::config::{Config, ConfigHandle, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use crate::http::AppState;
use crate::notify::Dispatcher;
use crate::pipeline::Pipeline;
use crate::repository::{records, settings, users};
use crate::runlock::RunLocks;
use crate::service::mssql::MssqlService;
use crate::storage::StorageHandle;

mod auth;
mod config;
mod database;
mod error;
mod http;
mod monitoring;
mod notify;
mod pipeline;
mod repository;
mod retry;
mod runlock;
mod schedule;
mod scheduler;
mod service;
mod storage;
#[cfg(test)]
mod testing;
mod utils;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = PathBuf::from(
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let mut config = Config::load(&config_path)
        .await
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    // RUST_LOG, when set, wins over the configured level
    let log_env = env_logger::Env::default().default_filter_or(config.server.log_level.as_str());
    env_logger::Builder::from_env(log_env).init();

    let pool = database::connect(&config.database)
        .await
        .with_context(|| format!("opening state database {}", config.database.url))?;
    database::migrate(&pool).await.context("applying migrations")?;

    let overlay = settings::load_system(&pool).await.context("loading system settings")?;
    config.apply_overlay(&overlay);
    config.validate().context("validating stored system settings")?;

    if users::count(&pool).await? == 0 {
        info!("No accounts yet; the first registered user becomes superuser");
    }
    let interrupted = records::fail_interrupted(&pool, Utc::now()).await?;
    if interrupted > 0 {
        warn!("Marked {} backups interrupted by the previous shutdown as failed", interrupted);
    }

    let backend = storage::build(&config.storage).await.context("configuring remote storage")?;
    let notifier = notify::build(&config.smtp);
    let engine = match &config.backup.sqlcmd_path {
        Some(path) => MssqlService::with_sqlcmd(path.clone()),
        None => MssqlService::new(),
    };
    info!("Using {} storage and {} notifications", backend.name(), notifier.channel());

    let bind_address = config.server.bind_address.clone();
    let scheduler_enabled = config.scheduler.enabled;
    let tick = config.scheduler.tick.clone();

    let pipeline = Pipeline::new(
        pool.clone(),
        ConfigHandle::new(Some(config_path), config),
        Arc::new(engine),
        StorageHandle::new(backend),
        Dispatcher::new(pool, notifier),
        RunLocks::new(),
    );

    let mut sched = if scheduler_enabled {
        Some(scheduler::start(pipeline.clone(), &tick).await?)
    } else {
        info!("Scheduler disabled; backups only run on demand");
        None
    };

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {}", bind_address))?;
    info!("Listening on {}", bind_address);
    axum::serve(listener, http::router(AppState::new(pipeline)))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for shutdown signal: {}", e);
            }
        })
        .await?;

    if let Some(sched) = sched.as_mut() {
        sched.shutdown().await?;
    }
    info!("Shut down");
    Ok(())
}
