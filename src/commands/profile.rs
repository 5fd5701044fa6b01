use crate::error::FeedError;
use crate::market::persistence;
use crate::market::types::{
    Position, PositionUpsertArgs, Profile, ProfilePatch, RecordTradeArgs, TradeRecord,
};
use crate::state::AppState;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub profile: Option<Profile>,
    pub positions: Vec<Position>,
    pub recent_trades: Vec<TradeRecord>,
}

pub async fn profile_get(
    state: &AppState,
    wallet_address: &str,
) -> Result<Option<Profile>, FeedError> {
    persistence::get_profile(&state.db_pool, wallet_address).await
}

pub async fn profile_put(
    state: &AppState,
    wallet_address: &str,
    patch: ProfilePatch,
) -> Result<Profile, FeedError> {
    persistence::put_profile(&state.db_pool, wallet_address, patch).await
}

pub async fn positions_list(
    state: &AppState,
    wallet_address: &str,
) -> Result<Vec<Position>, FeedError> {
    persistence::list_positions(&state.db_pool, wallet_address).await
}

pub async fn position_upsert(
    state: &AppState,
    args: PositionUpsertArgs,
) -> Result<Position, FeedError> {
    persistence::upsert_position(&state.db_pool, args).await
}

pub async fn trades_list(
    state: &AppState,
    wallet_address: &str,
    limit: Option<u32>,
) -> Result<Vec<TradeRecord>, FeedError> {
    persistence::list_trades(&state.db_pool, wallet_address, limit).await
}

pub async fn trade_record(
    state: &AppState,
    args: RecordTradeArgs,
) -> Result<TradeRecord, FeedError> {
    persistence::record_trade(&state.db_pool, args).await
}

/// Profile, open positions and the most recent trades for one wallet.
pub async fn portfolio(
    state: &AppState,
    wallet_address: &str,
    trade_limit: Option<u32>,
) -> Result<PortfolioSnapshot, FeedError> {
    Ok(PortfolioSnapshot {
        profile: profile_get(state, wallet_address).await?,
        positions: positions_list(state, wallet_address).await?,
        recent_trades: trades_list(state, wallet_address, trade_limit).await?,
    })
}
