use crate::error::FeedError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_DB_PATH: &str = "pump-feed.db";

pub fn resolve_db_path() -> Result<PathBuf, FeedError> {
    let path = std::env::var("PUMP_FEED_DB_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), FeedError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, FeedError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;
    info!(path = %path.display(), "store ready");

    Ok(pool)
}

pub async fn initialize_pool() -> Result<SqlitePool, FeedError> {
    let db_path = resolve_db_path()?;
    initialize_pool_from_path(&db_path).await
}
