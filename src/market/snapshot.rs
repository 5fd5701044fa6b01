//! In-memory per-market state fed by push frames.
//!
//! `market_data` replaces a whole market, `market_update` moves one outcome
//! price and `trade_event` adds traded volume. Anything older than what the
//! book already holds is reported as [`ApplyOutcome::Stale`] and left out.

use crate::error::FeedError;
use crate::market::types::{MarketData, MarketPrice, MessageType, WireMessage};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Stale,
    Ignored,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceUpdate {
    outcome_index: u32,
    price: f64,
    #[serde(rename = "volume24h", default)]
    volume_24h: Option<f64>,
    #[serde(rename = "priceChange24h", default)]
    price_change_24h: Option<f64>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeUpdate {
    #[serde(default)]
    outcome_index: Option<u32>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    amount: f64,
    #[serde(default)]
    new_trader: bool,
    #[serde(default)]
    timestamp: Option<i64>,
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

fn require_market_id(frame: &WireMessage) -> Result<&str, FeedError> {
    frame
        .market_id
        .as_deref()
        .filter(|market_id| !market_id.is_empty())
        .ok_or_else(|| {
            FeedError::MalformedFrame(format!(
                "{} frame without a market id",
                frame.message_type.as_str()
            ))
        })
}

fn payload(frame: &WireMessage) -> Result<serde_json::Value, FeedError> {
    frame.data.clone().ok_or_else(|| {
        FeedError::MalformedFrame(format!(
            "{} frame without a payload",
            frame.message_type.as_str()
        ))
    })
}

#[derive(Debug, Default)]
pub struct SnapshotBook {
    markets: BTreeMap<String, MarketData>,
}

impl SnapshotBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_frame(&mut self, frame: &WireMessage) -> Result<ApplyOutcome, FeedError> {
        match frame.message_type {
            MessageType::MarketData => self.apply_market_data(frame),
            MessageType::MarketUpdate => self.apply_price_update(frame),
            MessageType::TradeEvent => self.apply_trade(frame),
            _ => Ok(ApplyOutcome::Ignored),
        }
    }

    fn apply_market_data(&mut self, frame: &WireMessage) -> Result<ApplyOutcome, FeedError> {
        let mut market: MarketData = serde_json::from_value(payload(frame)?)?;
        if let Some(market_id) = frame.market_id.as_deref() {
            market.market_id = market_id.to_string();
        }
        if market.market_id.is_empty() {
            return Err(FeedError::MalformedFrame(
                "market_data frame without a market id".to_string(),
            ));
        }
        if let Some(timestamp) = frame.timestamp {
            market.last_updated = market.last_updated.max(timestamp);
        }

        if let Some(existing) = self.markets.get(&market.market_id) {
            if existing.last_updated > market.last_updated {
                return Ok(ApplyOutcome::Stale);
            }
        }

        let market_id = market.market_id.clone();
        for price in &mut market.prices {
            price.market_id = market_id.clone();
        }
        market.prices.sort_by_key(|price| price.outcome_index);
        self.markets.insert(market_id, market);
        Ok(ApplyOutcome::Applied)
    }

    fn apply_price_update(&mut self, frame: &WireMessage) -> Result<ApplyOutcome, FeedError> {
        let market_id = require_market_id(frame)?;
        let update: PriceUpdate = serde_json::from_value(payload(frame)?)?;
        let timestamp = update.timestamp.or(frame.timestamp).unwrap_or_default();

        let market = self
            .markets
            .entry(market_id.to_string())
            .or_insert_with(|| MarketData::empty(market_id));

        match market
            .prices
            .iter_mut()
            .find(|price| price.outcome_index == update.outcome_index)
        {
            Some(price) => {
                if price.timestamp > timestamp {
                    return Ok(ApplyOutcome::Stale);
                }
                price.price = finite_or(update.price, price.price);
                if let Some(volume) = update.volume_24h {
                    price.volume_24h = finite_or(volume, price.volume_24h);
                }
                if let Some(change) = update.price_change_24h {
                    price.price_change_24h = finite_or(change, price.price_change_24h);
                }
                price.timestamp = timestamp;
            }
            None => {
                market.prices.push(MarketPrice {
                    market_id: market_id.to_string(),
                    outcome_index: update.outcome_index,
                    price: finite_or(update.price, 0.0),
                    volume_24h: finite_or(update.volume_24h.unwrap_or_default(), 0.0),
                    price_change_24h: finite_or(update.price_change_24h.unwrap_or_default(), 0.0),
                    timestamp,
                });
                market.prices.sort_by_key(|price| price.outcome_index);
            }
        }

        market.last_updated = market.last_updated.max(timestamp);
        Ok(ApplyOutcome::Applied)
    }

    /// Volume always accumulates; the trade price only moves the outcome
    /// when it is not older than the last quote.
    fn apply_trade(&mut self, frame: &WireMessage) -> Result<ApplyOutcome, FeedError> {
        let market_id = require_market_id(frame)?;
        let trade: TradeUpdate = serde_json::from_value(payload(frame)?)?;
        let timestamp = trade.timestamp.or(frame.timestamp).unwrap_or_default();

        let market = self
            .markets
            .entry(market_id.to_string())
            .or_insert_with(|| MarketData::empty(market_id));

        let amount = finite_or(trade.amount, 0.0).max(0.0);
        market.total_volume += amount;
        if trade.new_trader {
            market.trader_count = market.trader_count.saturating_add(1);
        }

        if let (Some(outcome_index), Some(trade_price)) = (trade.outcome_index, trade.price) {
            if let Some(price) = market
                .prices
                .iter_mut()
                .find(|price| price.outcome_index == outcome_index)
            {
                price.volume_24h += amount;
                if price.timestamp <= timestamp && trade_price.is_finite() {
                    price.price = trade_price;
                    price.timestamp = timestamp;
                }
            }
        }

        market.last_updated = market.last_updated.max(timestamp);
        Ok(ApplyOutcome::Applied)
    }

    pub fn upsert(&mut self, market: MarketData) {
        self.markets.insert(market.market_id.clone(), market);
    }

    pub fn get(&self, market_id: &str) -> Option<&MarketData> {
        self.markets.get(market_id)
    }

    pub fn remove(&mut self, market_id: &str) -> Option<MarketData> {
        self.markets.remove(market_id)
    }

    pub fn markets(&self) -> Vec<MarketData> {
        self.markets.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}
