use crate::error::FeedError;
use crate::market::connection::ConnectionManager;
use crate::market::types::ConnectionState;
use crate::state::AppState;
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub connection: ConnectionState,
    pub latency_ms: Option<i64>,
    pub subscriptions: usize,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: &SqlitePool,
    session: &ConnectionManager,
) -> HealthResponse {
    let db_status = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };
    let connection = session.state();
    let status = if db_status == "ok" && connection == ConnectionState::Connected {
        "ok"
    } else {
        "degraded"
    };

    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        db: db_status,
        connection,
        latency_ms: session.latency_ms(),
        subscriptions: session.subscriptions().len(),
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, FeedError> {
    Ok(build_health_response(state.started_at, &state.db_pool, &state.session).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::test_support::{test_config, ServerBehavior, TestServer};

    #[tokio::test]
    async fn health_reports_db_and_idle_session() {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should initialize");
        let session = ConnectionManager::new(test_config("ws://127.0.0.1:9/ws"));

        let response = build_health_response(Instant::now(), &pool, &session).await;

        assert_eq!(response.status, "degraded");
        assert_eq!(response.db, "ok");
        assert_eq!(response.connection, ConnectionState::Disconnected);
        assert_eq!(response.latency_ms, None);
        assert!(response.uptime_ms <= 1_000);
    }

    #[tokio::test]
    async fn health_is_ok_once_connected() {
        let server = TestServer::start(ServerBehavior::default()).await;
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should initialize");
        let session = ConnectionManager::new(test_config(&server.url));
        session.connect().await.expect("connect should succeed");

        let response = build_health_response(Instant::now(), &pool, &session).await;
        assert_eq!(response.status, "ok");
        assert_eq!(response.connection, ConnectionState::Connected);
        assert_eq!(response.subscriptions, 0);

        session.destroy().await;
    }
}
