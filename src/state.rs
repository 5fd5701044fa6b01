use crate::market::connection::ConnectionManager;
use crate::market::ranking::RankingJobHandle;
use crate::market::snapshot::SnapshotBook;
use crate::market::trending::TrendingEngine;
use crate::market::types::SessionConfig;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Everything the application operations share, built once at startup.
pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub session: ConnectionManager,
    pub engine: Arc<TrendingEngine>,
    pub book: Arc<parking_lot::Mutex<SnapshotBook>>,
    pub ranking_job: Mutex<Option<RankingJobHandle>>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, config: SessionConfig) -> Self {
        Self {
            started_at: Instant::now(),
            db_pool,
            session: ConnectionManager::new(config),
            engine: Arc::new(TrendingEngine::new()),
            book: Arc::new(parking_lot::Mutex::new(SnapshotBook::new())),
            ranking_job: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        self.session.config()
    }
}
