use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use echo_sync::config::{AppConfig, APP_ID, APP_NAME};
use echo_sync::remote::HttpRemote;
use echo_sync::services::{
    Database, LocalStore, SettingsService, StreamingGuard, SyncReconciler,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!(
        "{} sync ({}) starting, database at {}",
        APP_NAME,
        APP_ID,
        config.db_path.display()
    );

    let db = Database::open(&config.db_path)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;
    let settings = SettingsService::load(&db).await;
    let store = LocalStore::new(db);

    let remote = HttpRemote::new(&config.api_base_url, config.api_token.clone())?;
    let reconciler = SyncReconciler::new(store, StreamingGuard::new(), Arc::new(remote), settings);

    let cancel_token = CancellationToken::new();
    let handle = reconciler.spawn_periodic(config.sync_interval, cancel_token.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    cancel_token.cancel();
    handle.await?;

    Ok(())
}
