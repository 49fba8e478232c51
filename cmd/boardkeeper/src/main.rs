//! # Boardkeeper Binary
//!
//! Loads settings, connects the store and runs the upkeep scheduler until
//! Ctrl-C.

mod parser;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use configs::{LoggingSettings, Settings};
use domains::{Clock, Store, SystemClock};
use services::{Executor, Janitor, Scheduler, SchedulerIntervals};
use storage_adapters::media::LocalMediaStorage;

use crate::parser::HashCommandParser;

fn init_tracing(logging: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(feature = "db-postgres")]
async fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn Store>> {
    use secrecy::ExposeSecret;
    use storage_adapters::postgres::PgStore;

    let db = &settings.database;
    let store = PgStore::connect(db.url.expose_secret(), db.max_connections, db.acquire_timeout())
        .await
        .context("connecting to PostgreSQL")?;
    store.migrate().await.context("running migrations")?;
    tracing::info!(max_connections = db.max_connections, "Connected to PostgreSQL");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "db-postgres"))]
async fn open_store(_settings: &Settings) -> anyhow::Result<Arc<dyn Store>> {
    use storage_adapters::memory::MemoryStore;

    tracing::warn!("Built without db-postgres; running against an empty in-memory store");
    Ok(Arc::new(MemoryStore::default()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;
    init_tracing(&settings.logging);

    let store = open_store(&settings).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let janitor = Janitor::new(
        Executor::new(store),
        Arc::new(HashCommandParser),
        Arc::new(LocalMediaStorage::new(settings.media.root.clone())),
        Arc::new(Arc::new(settings.maintenance.clone())),
        clock,
    );
    tracing::info!(
        imager_mode = ?settings.maintenance.imager_mode,
        media_root = %settings.media.root.display(),
        "Starting boardkeeper"
    );

    let (shutdown, signal) = watch::channel(false);
    let scheduler = tokio::spawn(Scheduler::new(Arc::new(janitor), SchedulerIntervals::default()).run(signal));

    tokio::signal::ctrl_c().await.context("listening for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    // The scheduler may already be gone, in which case there is nobody to tell.
    let _ = shutdown.send(true);
    scheduler.await.context("scheduler task ended abnormally")?;
    Ok(())
}
