use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("a connect attempt is already in flight")]
    AlreadyConnecting,
    #[error("not connected")]
    NotConnected,
    #[error("session destroyed")]
    Destroyed,
    #[error("transport closed: {0}")]
    TransportClosed(String),
    #[error("subscription to {market_id} timed out")]
    SubscriptionTimeout { market_id: String },
    #[error("subscription to {market_id} rejected: {reason}")]
    SubscriptionRejected { market_id: String, reason: String },
    #[error("request '{request}' timed out")]
    RequestTimeout { request: String },
    #[error("request '{request}' rejected: {reason}")]
    RequestRejected { request: String, reason: String },
    #[error("reconnect abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for FeedError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
