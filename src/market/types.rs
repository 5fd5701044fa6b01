use crate::error::FeedError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RANKING_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_PUMP_THRESHOLD: f64 = 0.10;
pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 300_000;
pub const MIN_RECONNECT_BASE_MS: u64 = 100;
pub const MAX_RECONNECT_BASE_MS: u64 = MAX_RECONNECT_DELAY_MS;
pub const MIN_RECONNECT_ATTEMPTS: u32 = 1;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 100;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const MIN_RANKING_INTERVAL_MS: u64 = 250;
pub const MAX_RANKING_INTERVAL_MS: u64 = 3_600_000;

pub const ALL_SELECTOR: &str = "all";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusSnapshot {
    pub state: ConnectionState,
    pub url: String,
    pub client_id: Option<String>,
    pub latency_ms: Option<i64>,
    pub reconnect_attempt: u32,
    pub subscriptions: usize,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    GetMarketData,
    ConnectionEstablished,
    MarketData,
    MarketUpdate,
    TradeEvent,
    SubscriptionConfirmed,
    UnsubscriptionConfirmed,
    SubscriptionsList,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::GetMarketData => "get_market_data",
            Self::ConnectionEstablished => "connection_established",
            Self::MarketData => "market_data",
            Self::MarketUpdate => "market_update",
            Self::TradeEvent => "trade_event",
            Self::SubscriptionConfirmed => "subscription_confirmed",
            Self::UnsubscriptionConfirmed => "unsubscription_confirmed",
            Self::SubscriptionsList => "subscriptions_list",
            Self::Error => "error",
        }
    }

    /// Returns `None` for tags this client does not know about.
    pub fn parse_str(value: &str) -> Option<Self> {
        let parsed = match value {
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "get_market_data" => Self::GetMarketData,
            "connection_established" => Self::ConnectionEstablished,
            "market_data" => Self::MarketData,
            "market_update" => Self::MarketUpdate,
            "trade_event" => Self::TradeEvent,
            "subscription_confirmed" => Self::SubscriptionConfirmed,
            "unsubscription_confirmed" => Self::UnsubscriptionConfirmed,
            "subscriptions_list" => Self::SubscriptionsList,
            "error" => Self::Error,
            _ => return None,
        };
        Some(parsed)
    }
}

/// One frame on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl WireMessage {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            market_id: None,
            data: None,
            timestamp: None,
            client_id: None,
        }
    }

    pub fn with_market(mut self, market_id: impl Into<String>) -> Self {
        self.market_id = Some(market_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.as_ref()?.get(field)?.as_str()
    }

    /// Human readable reason carried by an `error` frame.
    pub fn error_reason(&self) -> String {
        self.data_str("message")
            .or_else(|| self.data_str("error"))
            .or_else(|| self.data.as_ref().and_then(|data| data.as_str()))
            .unwrap_or("server reported an error")
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketPrice {
    #[serde(default)]
    pub market_id: String,
    pub outcome_index: u32,
    pub price: f64,
    #[serde(rename = "volume24h", default)]
    pub volume_24h: f64,
    #[serde(rename = "priceChange24h", default)]
    pub price_change_24h: f64,
    #[serde(default)]
    pub timestamp: i64,
}

/// Aggregate snapshot of one market. `trend_score` is derived and only
/// meaningful after the trending engine has refreshed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketData {
    #[serde(default)]
    pub market_id: String,
    #[serde(default)]
    pub program_account: String,
    #[serde(default)]
    pub prices: Vec<MarketPrice>,
    #[serde(default)]
    pub total_volume: f64,
    #[serde(default)]
    pub trader_count: u64,
    #[serde(default)]
    pub volatility: f64,
    #[serde(default)]
    pub trend_score: f64,
    #[serde(default)]
    pub last_updated: i64,
}

impl MarketData {
    pub fn empty(market_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            program_account: String::new(),
            prices: Vec::new(),
            total_volume: 0.0,
            trader_count: 0,
            volatility: 0.0,
            trend_score: 0.0,
            last_updated: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutcomeSelector {
    All,
    Index(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpdateSelector {
    All,
    Only(String),
}

/// Identity of one live subscription, rendered as
/// `<marketId>:<outcomeIndex|all>:<updateType|all>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub market_id: String,
    pub outcome: OutcomeSelector,
    pub update_type: UpdateSelector,
}

impl SubscriptionKey {
    pub fn new(market_id: impl Into<String>, options: &SubscriptionOptions) -> Self {
        Self {
            market_id: market_id.into(),
            outcome: options
                .outcome_index
                .map(OutcomeSelector::Index)
                .unwrap_or(OutcomeSelector::All),
            update_type: options
                .update_type
                .clone()
                .filter(|value| value != ALL_SELECTOR)
                .map(UpdateSelector::Only)
                .unwrap_or(UpdateSelector::All),
        }
    }

    pub fn options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            outcome_index: match self.outcome {
                OutcomeSelector::All => None,
                OutcomeSelector::Index(index) => Some(index),
            },
            update_type: match &self.update_type {
                UpdateSelector::All => None,
                UpdateSelector::Only(value) => Some(value.clone()),
            },
        }
    }

    /// Recovers the key carried by a (un)subscription confirmation frame.
    /// Prefers the echoed textual key and falls back to the frame's market id
    /// plus the option fields in `data`.
    pub fn from_confirmation(frame: &WireMessage) -> Option<Self> {
        if let Some(Ok(key)) = frame.data_str("subscriptionKey").map(str::parse::<Self>) {
            return Some(key);
        }

        let market_id = frame.market_id.clone()?;
        let data = frame.data.as_ref();
        let outcome_index = data
            .and_then(|value| value.get("outcomeIndex"))
            .and_then(|value| value.as_u64())
            .and_then(|value| u32::try_from(value).ok());
        let update_type = data
            .and_then(|value| value.get("type"))
            .and_then(|value| value.as_str())
            .map(str::to_string);

        Some(Self::new(
            market_id,
            &SubscriptionOptions {
                outcome_index,
                update_type,
            },
        ))
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.market_id)?;
        match &self.outcome {
            OutcomeSelector::All => write!(f, "{ALL_SELECTOR}:")?,
            OutcomeSelector::Index(index) => write!(f, "{index}:")?,
        }
        match &self.update_type {
            UpdateSelector::All => write!(f, "{ALL_SELECTOR}"),
            UpdateSelector::Only(value) => write!(f, "{value}"),
        }
    }
}

impl FromStr for SubscriptionKey {
    type Err = FeedError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // Market ids may contain ':' so split from the right.
        let mut parts = value.rsplitn(3, ':');
        let update_raw = parts.next().unwrap_or_default();
        let outcome_raw = parts.next();
        let market_raw = parts.next();

        let (Some(outcome_raw), Some(market_id)) = (outcome_raw, market_raw) else {
            return Err(FeedError::InvalidArgument(format!(
                "subscription key '{value}' must have three ':'-separated parts"
            )));
        };
        if market_id.is_empty() || update_raw.is_empty() {
            return Err(FeedError::InvalidArgument(format!(
                "subscription key '{value}' has an empty segment"
            )));
        }

        let outcome = if outcome_raw == ALL_SELECTOR {
            OutcomeSelector::All
        } else {
            let index = outcome_raw.parse::<u32>().map_err(|_| {
                FeedError::InvalidArgument(format!(
                    "subscription key '{value}' has a non-numeric outcome index"
                ))
            })?;
            OutcomeSelector::Index(index)
        };
        let update_type = if update_raw == ALL_SELECTOR {
            UpdateSelector::All
        } else {
            UpdateSelector::Only(update_raw.to_string())
        };

        Ok(Self {
            market_id: market_id.to_string(),
            outcome,
            update_type,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOptions {
    pub outcome_index: Option<u32>,
    #[serde(rename = "type")]
    pub update_type: Option<String>,
}

impl SubscriptionOptions {
    pub fn outcome(outcome_index: u32) -> Self {
        Self {
            outcome_index: Some(outcome_index),
            update_type: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionArgs {
    pub url: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
    pub reconnect_base_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub request_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub pong_timeout_ms: Option<u64>,
    pub markets: Option<Vec<String>>,
    pub ranking_interval_ms: Option<u64>,
    pub pump_threshold: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub heartbeat_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub max_reconnect_attempts: u32,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub pong_timeout_ms: Option<u64>,
    pub markets: Vec<String>,
    pub ranking_interval_ms: u64,
    pub pump_threshold: f64,
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: FromStr>(name: &str) -> Result<Option<T>, FeedError> {
    match env_value(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| {
                FeedError::InvalidArgument(format!("{name} has an invalid value '{raw}'"))
            }),
        None => Ok(None),
    }
}

impl SessionArgs {
    pub fn from_env() -> Result<Self, FeedError> {
        let markets = env_value("PUMP_FEED_MARKETS").map(|raw| {
            raw.split(',')
                .map(|market| market.trim().to_string())
                .filter(|market| !market.is_empty())
                .collect::<Vec<_>>()
        });

        Ok(Self {
            url: env_value("PUMP_FEED_URL"),
            heartbeat_interval_ms: env_parsed("PUMP_FEED_HEARTBEAT_MS")?,
            reconnect_base_ms: env_parsed("PUMP_FEED_RECONNECT_BASE_MS")?,
            max_reconnect_attempts: env_parsed("PUMP_FEED_MAX_RECONNECTS")?,
            request_timeout_ms: env_parsed("PUMP_FEED_REQUEST_TIMEOUT_MS")?,
            connect_timeout_ms: env_parsed("PUMP_FEED_CONNECT_TIMEOUT_MS")?,
            pong_timeout_ms: env_parsed("PUMP_FEED_PONG_TIMEOUT_MS")?,
            markets,
            ranking_interval_ms: env_parsed("PUMP_FEED_RANKING_INTERVAL_MS")?,
            pump_threshold: env_parsed("PUMP_FEED_PUMP_THRESHOLD")?,
        })
    }

    pub fn normalize(self) -> Result<SessionConfig, FeedError> {
        let url = self
            .url
            .unwrap_or_else(|| DEFAULT_URL.to_string())
            .trim()
            .to_string();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(FeedError::InvalidArgument(
                "url must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        let heartbeat_interval_ms = self
            .heartbeat_interval_ms
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        if !(MIN_HEARTBEAT_INTERVAL_MS..=MAX_HEARTBEAT_INTERVAL_MS).contains(&heartbeat_interval_ms)
        {
            return Err(FeedError::InvalidArgument(format!(
                "heartbeatIntervalMs must be between {MIN_HEARTBEAT_INTERVAL_MS} and {MAX_HEARTBEAT_INTERVAL_MS}"
            )));
        }

        let reconnect_base_ms = self.reconnect_base_ms.unwrap_or(DEFAULT_RECONNECT_BASE_MS);
        if !(MIN_RECONNECT_BASE_MS..=MAX_RECONNECT_BASE_MS).contains(&reconnect_base_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "reconnectBaseMs must be between {MIN_RECONNECT_BASE_MS} and {MAX_RECONNECT_BASE_MS}"
            )));
        }

        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if !(MIN_RECONNECT_ATTEMPTS..=MAX_RECONNECT_ATTEMPTS).contains(&max_reconnect_attempts) {
            return Err(FeedError::InvalidArgument(format!(
                "maxReconnectAttempts must be between {MIN_RECONNECT_ATTEMPTS} and {MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let request_timeout_ms = self.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&request_timeout_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "requestTimeoutMs must be between {MIN_REQUEST_TIMEOUT_MS} and {MAX_REQUEST_TIMEOUT_MS}"
            )));
        }

        let connect_timeout_ms = self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&connect_timeout_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "connectTimeoutMs must be between {MIN_REQUEST_TIMEOUT_MS} and {MAX_REQUEST_TIMEOUT_MS}"
            )));
        }

        let pong_timeout_ms = self.pong_timeout_ms;
        if let Some(timeout) = pong_timeout_ms {
            if timeout < heartbeat_interval_ms {
                return Err(FeedError::InvalidArgument(
                    "pongTimeoutMs must not be shorter than heartbeatIntervalMs".to_string(),
                ));
            }
        }

        let mut markets = Vec::new();
        for market in self.markets.unwrap_or_default() {
            let market = market.trim().to_string();
            if market.is_empty() || market.contains(':') {
                return Err(FeedError::InvalidArgument(
                    "market ids must be non-empty and must not contain ':'".to_string(),
                ));
            }
            if !markets.contains(&market) {
                markets.push(market);
            }
        }

        let ranking_interval_ms = self
            .ranking_interval_ms
            .unwrap_or(DEFAULT_RANKING_INTERVAL_MS);
        if !(MIN_RANKING_INTERVAL_MS..=MAX_RANKING_INTERVAL_MS).contains(&ranking_interval_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "rankingIntervalMs must be between {MIN_RANKING_INTERVAL_MS} and {MAX_RANKING_INTERVAL_MS}"
            )));
        }

        let pump_threshold = self.pump_threshold.unwrap_or(DEFAULT_PUMP_THRESHOLD);
        if !pump_threshold.is_finite() || pump_threshold < 0.0 {
            return Err(FeedError::InvalidArgument(
                "pumpThreshold must be a finite non-negative number".to_string(),
            ));
        }

        Ok(SessionConfig {
            url,
            heartbeat_interval_ms,
            reconnect_base_ms,
            max_reconnect_attempts,
            request_timeout_ms,
            connect_timeout_ms,
            pong_timeout_ms,
            markets,
            ranking_interval_ms,
            pump_threshold,
        })
    }
}

pub const MAX_DISPLAY_NAME_LEN: usize = 64;
pub const MAX_BIO_LEN: usize = 500;
pub const MAX_AVATAR_URL_LEN: usize = 512;
pub const DEFAULT_TRADE_PAGE_SIZE: u32 = 50;
pub const MAX_TRADE_PAGE_SIZE: u32 = 500;

pub fn normalize_wallet_address(wallet_address: &str) -> Result<String, FeedError> {
    let wallet_address = wallet_address.trim();
    if wallet_address.is_empty() || wallet_address.chars().any(char::is_whitespace) {
        return Err(FeedError::InvalidArgument(
            "walletAddress must be a non-empty token".to_string(),
        ));
    }
    Ok(wallet_address.to_string())
}

fn normalize_market_id(market_id: &str) -> Result<String, FeedError> {
    let market_id = market_id.trim();
    if market_id.is_empty() || market_id.contains(':') {
        return Err(FeedError::InvalidArgument(
            "marketId must be non-empty and must not contain ':'".to_string(),
        ));
    }
    Ok(market_id.to_string())
}

fn normalize_text(
    field: &str,
    value: Option<String>,
    max_len: usize,
) -> Result<Option<String>, FeedError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let value = value.trim().to_string();
    if value.chars().count() > max_len {
        return Err(FeedError::InvalidArgument(format!(
            "{field} must be at most {max_len} characters"
        )));
    }
    Ok(Some(value))
}

fn normalize_opaque(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub wallet_address: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub followers: i64,
    pub following: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Partial profile update. Absent fields keep their stored value; a blank
/// string clears the field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub followers: Option<i64>,
    pub following: Option<i64>,
}

impl ProfilePatch {
    pub fn normalize(self) -> Result<Self, FeedError> {
        for (field, count) in [("followers", self.followers), ("following", self.following)] {
            if count.is_some_and(|count| count < 0) {
                return Err(FeedError::InvalidArgument(format!(
                    "{field} must not be negative"
                )));
            }
        }

        Ok(Self {
            display_name: normalize_text("displayName", self.display_name, MAX_DISPLAY_NAME_LEN)?,
            bio: normalize_text("bio", self.bio, MAX_BIO_LEN)?,
            avatar_url: normalize_text("avatarUrl", self.avatar_url, MAX_AVATAR_URL_LEN)?,
            followers: self.followers,
            following: self.following,
        })
    }

    pub fn apply_to(self, profile: &mut Profile) {
        fn merge(slot: &mut Option<String>, value: Option<String>) {
            if let Some(value) = value {
                *slot = Some(value).filter(|value| !value.is_empty());
            }
        }

        merge(&mut profile.display_name, self.display_name);
        merge(&mut profile.bio, self.bio);
        merge(&mut profile.avatar_url, self.avatar_url);
        if let Some(followers) = self.followers {
            profile.followers = followers;
        }
        if let Some(following) = self.following {
            profile.following = following;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn parse_str(raw: &str) -> Result<Self, FeedError> {
        match raw {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(FeedError::InvalidArgument(format!(
                "unknown trade side '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub wallet_address: String,
    pub market_id: String,
    pub outcome_index: u32,
    pub shares: f64,
    pub average_price: f64,
    pub program_account: Option<String>,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpsertArgs {
    pub wallet_address: String,
    pub market_id: String,
    pub outcome_index: u32,
    pub shares: f64,
    pub average_price: f64,
    pub program_account: Option<String>,
}

impl PositionUpsertArgs {
    pub fn normalize(self) -> Result<Self, FeedError> {
        if !self.shares.is_finite() || self.shares < 0.0 {
            return Err(FeedError::InvalidArgument(
                "shares must be a finite non-negative number".to_string(),
            ));
        }
        if !self.average_price.is_finite() || !(0.0..=1.0).contains(&self.average_price) {
            return Err(FeedError::InvalidArgument(
                "averagePrice must be within [0, 1]".to_string(),
            ));
        }

        Ok(Self {
            wallet_address: normalize_wallet_address(&self.wallet_address)?,
            market_id: normalize_market_id(&self.market_id)?,
            outcome_index: self.outcome_index,
            shares: self.shares,
            average_price: self.average_price,
            program_account: normalize_opaque(self.program_account),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub id: i64,
    pub wallet_address: String,
    pub market_id: String,
    pub outcome_index: u32,
    pub side: TradeSide,
    pub shares: f64,
    pub price: f64,
    pub signature: String,
    pub program_account: Option<String>,
    pub executed_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordTradeArgs {
    pub wallet_address: String,
    pub market_id: String,
    pub outcome_index: u32,
    pub side: TradeSide,
    pub shares: f64,
    pub price: f64,
    pub signature: String,
    pub program_account: Option<String>,
    pub executed_at_ms: Option<i64>,
}

impl RecordTradeArgs {
    pub fn normalize(self) -> Result<Self, FeedError> {
        if !self.shares.is_finite() || self.shares <= 0.0 {
            return Err(FeedError::InvalidArgument(
                "shares must be a finite positive number".to_string(),
            ));
        }
        if !self.price.is_finite() || !(0.0..=1.0).contains(&self.price) {
            return Err(FeedError::InvalidArgument(
                "price must be within [0, 1]".to_string(),
            ));
        }
        let Some(signature) = normalize_opaque(Some(self.signature)) else {
            return Err(FeedError::InvalidArgument(
                "signature must not be empty".to_string(),
            ));
        };

        Ok(Self {
            wallet_address: normalize_wallet_address(&self.wallet_address)?,
            market_id: normalize_market_id(&self.market_id)?,
            outcome_index: self.outcome_index,
            side: self.side,
            shares: self.shares,
            price: self.price,
            signature,
            program_account: normalize_opaque(self.program_account),
            executed_at_ms: self.executed_at_ms,
        })
    }
}

pub fn normalize_trade_limit(limit: Option<u32>) -> Result<u32, FeedError> {
    let limit = limit.unwrap_or(DEFAULT_TRADE_PAGE_SIZE);
    if !(1..=MAX_TRADE_PAGE_SIZE).contains(&limit) {
        return Err(FeedError::InvalidArgument(format!(
            "limit must be between 1 and {MAX_TRADE_PAGE_SIZE}"
        )));
    }
    Ok(limit)
}
