pub mod commands;
pub mod db;
pub mod error;
pub mod market;
pub mod state;

use commands::trending::{start_ranking_job, stop_ranking_job};
use db::initialize_pool;
use error::FeedError;
use market::events::LifecycleEvent;
use market::types::{SessionArgs, SubscriptionOptions};
use state::AppState;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

const LOGGED_TOP_MARKETS: usize = 3;

async fn track_configured_markets(state: &AppState) {
    let markets = state.config().markets.clone();
    for market_id in &markets {
        match state
            .session
            .subscribe(market_id, SubscriptionOptions::default())
            .await
        {
            Ok(key) => info!(subscription = %key, "tracking market"),
            Err(error) => {
                warn!(market_id = %market_id, %error, "subscription failed");
                continue;
            }
        }

        match state.session.get_market_data(market_id).await {
            Ok(market) => state.book.lock().upsert(market),
            Err(error) => debug!(market_id = %market_id, %error, "initial snapshot unavailable"),
        }
    }
}

/// Runs the feed until ctrl-c or until the session gives up reconnecting.
pub async fn run() -> Result<(), FeedError> {
    let config = SessionArgs::from_env()?.normalize()?;
    let db_pool = initialize_pool().await?;
    let state = AppState::new(db_pool, config);
    info!(url = %state.config().url, "starting feed session");

    state.session.connect().await?;
    track_configured_markets(&state).await;
    start_ranking_job(&state).await?;

    let mut lifecycle = state.session.lifecycle();
    let mut snapshots = match state.ranking_job.lock().await.as_ref() {
        Some(handle) => handle.snapshots(),
        None => return Err(FeedError::InvalidArgument("ranking job is not running".to_string())),
    };

    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "failed to listen for ctrl-c");
                }
                info!("shutdown requested");
                break Ok(());
            }
            event = lifecycle.recv() => match event {
                Ok(LifecycleEvent::Error { message, fatal: true }) => {
                    error!(%message, "feed session failed");
                    let attempts = state.config().max_reconnect_attempts;
                    break Err(FeedError::ReconnectExhausted { attempts });
                }
                Ok(event) => info!(?event, "session lifecycle"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "lifecycle events dropped"),
                Err(RecvError::Closed) => break Ok(()),
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let snapshot = snapshots.borrow_and_update().clone();
                for ranked in snapshot.ranked.iter().take(LOGGED_TOP_MARKETS) {
                    info!(
                        rank = ranked.rank,
                        market_id = %ranked.market.market_id,
                        score = ranked.metrics.overall_trend_score,
                        "trending"
                    );
                }
                if !snapshot.pumping.is_empty() {
                    info!(count = snapshot.pumping.len(), "markets pumping");
                }
            }
        }
    };

    stop_ranking_job(&state).await?;
    state.session.destroy().await;
    state.db_pool.close().await;
    info!("feed session closed");
    outcome
}
