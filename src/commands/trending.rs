use crate::error::FeedError;
use crate::market::ranking::{build_snapshot, spawn_ranking_job, TrendingSnapshot};
use crate::market::trending::{RankedMarket, WeightConfig};
use crate::state::AppState;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingJobSession {
    pub interval_ms: u64,
    pub pump_threshold: f64,
    pub replaced: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingJobStopResult {
    pub stopped: bool,
}

/// Starts the periodic ranking job, replacing one that is already running.
pub async fn start_ranking_job(state: &AppState) -> Result<RankingJobSession, FeedError> {
    let config = state.config();
    let interval_ms = config.ranking_interval_ms;
    let pump_threshold = config.pump_threshold;

    let mut job_slot = state.ranking_job.lock().await;
    let replaced = match job_slot.take() {
        Some(handle) => {
            handle.stop().await;
            true
        }
        None => false,
    };

    *job_slot = Some(spawn_ranking_job(
        &state.session.bus(),
        Arc::clone(&state.engine),
        Arc::clone(&state.book),
        Duration::from_millis(interval_ms),
        pump_threshold,
    ));
    info!(interval_ms, replaced, "ranking job scheduled");

    Ok(RankingJobSession {
        interval_ms,
        pump_threshold,
        replaced,
    })
}

pub async fn stop_ranking_job(state: &AppState) -> Result<RankingJobStopResult, FeedError> {
    let existing_handle = state.ranking_job.lock().await.take();
    let stopped = match existing_handle {
        Some(handle) => {
            handle.stop().await;
            true
        }
        None => false,
    };

    Ok(RankingJobStopResult { stopped })
}

/// Latest published snapshot, or a fresh one when no job is running.
pub async fn latest_trending(state: &AppState) -> Result<TrendingSnapshot, FeedError> {
    if let Some(handle) = state.ranking_job.lock().await.as_ref() {
        return Ok(handle.latest());
    }

    Ok(build_snapshot(
        &state.engine,
        &state.book,
        state.config().pump_threshold,
    ))
}

pub async fn top_trending(state: &AppState, limit: usize) -> Result<Vec<RankedMarket>, FeedError> {
    if limit == 0 {
        return Err(FeedError::InvalidArgument(
            "limit must be greater than zero".to_string(),
        ));
    }

    let markets = state.book.lock().markets();
    Ok(state.engine.top_trending(&markets, limit))
}

pub async fn trending_configuration(state: &AppState) -> Result<WeightConfig, FeedError> {
    Ok(state.engine.get_configuration())
}

pub async fn update_trending_weights(
    state: &AppState,
    weights: WeightConfig,
) -> Result<WeightConfig, FeedError> {
    let applied = state.engine.update_weights(
        weights.volume,
        weights.volatility,
        weights.momentum,
        weights.social,
    )?;
    info!(
        volume = applied.volume,
        volatility = applied.volatility,
        momentum = applied.momentum,
        social = applied.social,
        "trending weights updated"
    );
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::test_support::test_config;
    use crate::market::types::{MarketData, MarketPrice};
    use sqlx::SqlitePool;

    async fn test_state() -> AppState {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should initialize");
        AppState::new(pool, test_config("ws://127.0.0.1:9/ws"))
    }

    fn market(market_id: &str, total_volume: f64, volatility: f64) -> MarketData {
        MarketData {
            prices: vec![MarketPrice {
                market_id: market_id.to_string(),
                outcome_index: 0,
                price: 0.5,
                volume_24h: total_volume,
                price_change_24h: volatility,
                timestamp: 1,
            }],
            total_volume,
            trader_count: 10,
            volatility,
            last_updated: 1,
            ..MarketData::empty(market_id)
        }
    }

    #[tokio::test]
    async fn start_replaces_and_stop_reports_running_job() {
        let state = test_state().await;

        let first = start_ranking_job(&state).await.expect("job should start");
        assert!(!first.replaced);
        let second = start_ranking_job(&state).await.expect("job should restart");
        assert!(second.replaced);
        assert_eq!(
            state.session.bus().listener_count(),
            4,
            "only one job should route frames into the book"
        );

        let stopped = stop_ranking_job(&state).await.expect("stop should succeed");
        assert!(stopped.stopped);
        let again = stop_ranking_job(&state).await.expect("stop should succeed");
        assert!(!again.stopped);
        assert_eq!(state.session.bus().listener_count(), 0);
    }

    #[tokio::test]
    async fn reads_rankings_from_the_book_without_a_job() {
        let state = test_state().await;
        {
            let mut book = state.book.lock();
            book.upsert(market("quiet", 10.0, 0.01));
            book.upsert(market("busy", 9_000.0, 0.4));
        }

        let snapshot = latest_trending(&state).await.expect("snapshot should build");
        assert_eq!(snapshot.market_count, 2);
        assert_eq!(snapshot.ranked[0].market.market_id, "busy");

        let top = top_trending(&state, 1).await.expect("top should rank");
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].market.market_id, "busy");
        assert!(top_trending(&state, 0).await.is_err());
    }

    #[tokio::test]
    async fn updates_and_reports_normalized_weights() {
        let state = test_state().await;
        assert_eq!(
            trending_configuration(&state).await.expect("config"),
            WeightConfig::default()
        );

        let applied = update_trending_weights(
            &state,
            WeightConfig {
                volume: 2.0,
                volatility: 1.0,
                momentum: 1.0,
                social: 0.0,
            },
        )
        .await
        .expect("weights should apply");
        assert!((applied.volume - 0.5).abs() < 1e-12);
        assert!((applied.sum() - 1.0).abs() < 1e-12);

        let rejected = update_trending_weights(
            &state,
            WeightConfig {
                volume: -1.0,
                ..WeightConfig::EQUAL
            },
        )
        .await;
        assert!(matches!(rejected, Err(FeedError::InvalidArgument(_))));
        assert_eq!(trending_configuration(&state).await.expect("config"), applied);
    }
}
