//! Multi-factor trend scoring, ranking and the pumping filter.
//!
//! Every sub-score goes through a saturating transform `x / (x + k)`, so
//! it is monotonic, stays in `[0, 1)` and flattens out as `x` grows. The
//! half-saturation points below are the values at which a sub-score reaches
//! 0.5. NaN and negative inputs count as zero; `+inf` saturates fully.

use crate::error::FeedError;
use crate::market::types::MarketData;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const VOLUME_HALF_SATURATION: f64 = 1_000.0;
const TRADER_HALF_SATURATION: f64 = 50.0;
const VOLUME_SHARE: f64 = 0.7;
const TRADER_SHARE: f64 = 0.3;
const VOLATILITY_HALF_SATURATION: f64 = 0.15;
const MOMENTUM_HALF_SATURATION: f64 = 0.10;
const SOCIAL_HALF_SATURATION: f64 = 100.0;
const COMMENT_WEIGHT: f64 = 2.0;
pub const NEUTRAL_SOCIAL_SCORE: f64 = 0.5;

/// Maps NaN and negatives to zero. `+inf` is kept.
fn sanitize(value: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        0.0
    }
}

fn saturate(value: f64, half_saturation: f64) -> f64 {
    let value = sanitize(value);
    if value >= f64::MAX / 2.0 {
        return 1.0;
    }
    (value / (value + half_saturation)).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightConfig {
    pub volume: f64,
    pub volatility: f64,
    pub momentum: f64,
    pub social: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            volume: 0.30,
            volatility: 0.20,
            momentum: 0.30,
            social: 0.20,
        }
    }
}

impl WeightConfig {
    pub const EQUAL: Self = Self {
        volume: 0.25,
        volatility: 0.25,
        momentum: 0.25,
        social: 0.25,
    };

    /// Divides each weight by the total. An all-zero input falls back to
    /// equal weights. Weights are scaled by the largest one first so huge
    /// values cannot overflow the total.
    pub fn normalized(
        volume: f64,
        volatility: f64,
        momentum: f64,
        social: f64,
    ) -> Result<Self, FeedError> {
        for (name, weight) in [
            ("volume", volume),
            ("volatility", volatility),
            ("momentum", momentum),
            ("social", social),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(FeedError::InvalidArgument(format!(
                    "{name} weight must be a finite non-negative number"
                )));
            }
        }

        let largest = volume.max(volatility).max(momentum).max(social);
        if largest <= 0.0 {
            return Ok(Self::EQUAL);
        }
        let [volume, volatility, momentum, social] =
            [volume, volatility, momentum, social].map(|weight| weight / largest);
        let total = volume + volatility + momentum + social;

        Ok(Self {
            volume: volume / total,
            volatility: volatility / total,
            momentum: momentum / total,
            social: social / total,
        })
    }

    pub fn sum(&self) -> f64 {
        self.volume + self.volatility + self.momentum + self.social
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendingMetrics {
    pub volume_score: f64,
    pub volatility_score: f64,
    pub momentum_score: f64,
    pub social_score: f64,
    pub overall_trend_score: f64,
}

/// Follow/comment counts supplied by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialSignals {
    pub followers: u64,
    pub comments: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedMarket {
    pub rank: usize,
    pub market: MarketData,
    pub metrics: TrendingMetrics,
}

pub fn volume_score(market: &MarketData) -> f64 {
    VOLUME_SHARE * saturate(market.total_volume, VOLUME_HALF_SATURATION)
        + TRADER_SHARE * saturate(market.trader_count as f64, TRADER_HALF_SATURATION)
}

pub fn volatility_score(market: &MarketData) -> f64 {
    saturate(market.volatility, VOLATILITY_HALF_SATURATION)
}

/// Magnitude of the 24h price move, weighted by each outcome's 24h volume
/// (plain mean when no outcome reports volume).
pub fn momentum_score(market: &MarketData) -> f64 {
    let moves: Vec<(f64, f64)> = market
        .prices
        .iter()
        .map(|price| (sanitize(price.price_change_24h.abs()), sanitize(price.volume_24h)))
        .collect();
    if moves.is_empty() {
        return 0.0;
    }
    if moves.iter().any(|(change, _)| change.is_infinite()) {
        return 1.0;
    }

    let total_volume: f64 = moves.iter().map(|(_, volume)| volume).sum();
    let mean_move = if total_volume > 0.0 && total_volume.is_finite() {
        moves
            .iter()
            .map(|(change, volume)| change * (volume / total_volume))
            .sum::<f64>()
    } else {
        moves.iter().map(|(change, _)| change).sum::<f64>() / moves.len() as f64
    };
    saturate(mean_move, MOMENTUM_HALF_SATURATION)
}

pub fn social_score(signals: Option<SocialSignals>) -> f64 {
    match signals {
        Some(signals) => saturate(
            signals.followers as f64 + COMMENT_WEIGHT * signals.comments as f64,
            SOCIAL_HALF_SATURATION,
        ),
        None => NEUTRAL_SOCIAL_SCORE,
    }
}

/// Largest absolute 24h move across outcomes, or the market volatility when
/// that is larger.
pub fn pump_signal(market: &MarketData) -> f64 {
    market
        .prices
        .iter()
        .map(|price| sanitize(price.price_change_24h.abs()))
        .fold(sanitize(market.volatility), f64::max)
}

fn compare_ranked(left: &RankedMarket, right: &RankedMarket) -> Ordering {
    right
        .metrics
        .overall_trend_score
        .total_cmp(&left.metrics.overall_trend_score)
        .then_with(|| {
            sanitize(right.market.total_volume).total_cmp(&sanitize(left.market.total_volume))
        })
        .then_with(|| left.market.market_id.cmp(&right.market.market_id))
}

#[derive(Debug, Default)]
pub struct TrendingEngine {
    weights: RwLock<WeightConfig>,
}

impl TrendingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_configuration(&self) -> WeightConfig {
        *self.weights.read()
    }

    pub fn update_weights(
        &self,
        volume: f64,
        volatility: f64,
        momentum: f64,
        social: f64,
    ) -> Result<WeightConfig, FeedError> {
        let weights = WeightConfig::normalized(volume, volatility, momentum, social)?;
        *self.weights.write() = weights;
        Ok(weights)
    }

    pub fn calculate_trending_score(&self, market: &MarketData) -> TrendingMetrics {
        self.score_with(&self.get_configuration(), market, None)
    }

    pub fn calculate_trending_score_with_social(
        &self,
        market: &MarketData,
        signals: SocialSignals,
    ) -> TrendingMetrics {
        self.score_with(&self.get_configuration(), market, Some(signals))
    }

    fn score_with(
        &self,
        weights: &WeightConfig,
        market: &MarketData,
        signals: Option<SocialSignals>,
    ) -> TrendingMetrics {
        let volume_score = volume_score(market);
        let volatility_score = volatility_score(market);
        let momentum_score = momentum_score(market);
        let social_score = social_score(signals);

        let overall_trend_score = (weights.volume * volume_score
            + weights.volatility * volatility_score
            + weights.momentum * momentum_score
            + weights.social * social_score)
            .clamp(0.0, 1.0);

        TrendingMetrics {
            volume_score,
            volatility_score,
            momentum_score,
            social_score,
            overall_trend_score,
        }
    }

    /// Sorts by overall score (descending), then total volume (descending),
    /// then market id (ascending). Ranks are 1-based and gap free.
    pub fn rank_markets(&self, markets: &[MarketData]) -> Vec<RankedMarket> {
        let weights = self.get_configuration();
        let mut ranked: Vec<RankedMarket> = markets
            .iter()
            .map(|market| {
                let metrics = self.score_with(&weights, market, None);
                let mut market = market.clone();
                market.trend_score = metrics.overall_trend_score;
                RankedMarket {
                    rank: 0,
                    market,
                    metrics,
                }
            })
            .collect();

        ranked.sort_by(compare_ranked);
        for (index, entry) in ranked.iter_mut().enumerate() {
            entry.rank = index + 1;
        }
        ranked
    }

    pub fn top_trending(&self, markets: &[MarketData], limit: usize) -> Vec<RankedMarket> {
        let mut ranked = self.rank_markets(markets);
        ranked.truncate(limit);
        ranked
    }

    /// Markets whose [`pump_signal`] strictly exceeds `threshold`, in input
    /// order.
    pub fn get_pumping_markets(&self, markets: &[MarketData], threshold: f64) -> Vec<MarketData> {
        markets
            .iter()
            .filter(|market| pump_signal(market) > threshold)
            .cloned()
            .collect()
    }

    /// Same membership as [`Self::get_pumping_markets`], largest move first.
    pub fn get_pumping_markets_ranked(
        &self,
        markets: &[MarketData],
        threshold: f64,
    ) -> Vec<MarketData> {
        let mut pumping = self.get_pumping_markets(markets, threshold);
        pumping.sort_by(|left, right| {
            pump_signal(right)
                .total_cmp(&pump_signal(left))
                .then_with(|| left.market_id.cmp(&right.market_id))
        });
        pumping
    }
}
