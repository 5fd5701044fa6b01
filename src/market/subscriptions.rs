//! Subscription bookkeeping.
//!
//! A key enters the registry only once the server confirms it and leaves
//! only once the server confirms the unsubscription. The registry survives
//! reconnects and is replayed onto every new socket.

use crate::error::FeedError;
use crate::market::codec::to_transport_message;
use crate::market::connection::{ConnectionManager, SessionInner};
use crate::market::correlator::{self, PendingRequest, RequestKind, RequestSpec};
use crate::market::events::{EventBus, LifecycleEvent};
use crate::market::now_unix_ms;
use crate::market::transport::FeedStream;
use crate::market::types::{MessageType, SubscriptionKey, SubscriptionOptions, WireMessage};
use futures_util::SinkExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<BTreeMap<String, SubscriptionKey>>,
}

impl SubscriptionRegistry {
    /// Returns `false` when the key was already present.
    pub fn insert(&self, key: SubscriptionKey) -> bool {
        self.entries.lock().insert(key.to_string(), key).is_none()
    }

    pub fn remove(&self, key: &SubscriptionKey) -> bool {
        self.entries.lock().remove(&key.to_string()).is_some()
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.lock().contains_key(&key.to_string())
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

fn subscription_frame(message_type: MessageType, key: &SubscriptionKey) -> WireMessage {
    let options = key.options();
    let mut data = Map::new();
    if let Some(outcome_index) = options.outcome_index {
        data.insert("outcomeIndex".to_string(), json!(outcome_index));
    }
    if let Some(update_type) = options.update_type {
        data.insert("type".to_string(), Value::String(update_type));
    }
    data.insert(
        "subscriptionKey".to_string(),
        Value::String(key.to_string()),
    );

    WireMessage::new(message_type)
        .with_market(key.market_id.clone())
        .with_data(Value::Object(data))
        .with_timestamp(now_unix_ms())
}

/// Request frame plus correlation spec for a (un)subscribe of `key`.
fn subscription_request(
    message_type: MessageType,
    key: &SubscriptionKey,
    timeout: Duration,
) -> (WireMessage, RequestSpec) {
    let (kind, response) = match message_type {
        MessageType::Unsubscribe => (
            RequestKind::Unsubscribe {
                market_id: key.market_id.clone(),
            },
            MessageType::UnsubscriptionConfirmed,
        ),
        _ => (
            RequestKind::Subscribe {
                market_id: key.market_id.clone(),
            },
            MessageType::SubscriptionConfirmed,
        ),
    };

    let expected = key.clone();
    let spec = RequestSpec {
        kind,
        response,
        matcher: Box::new(move |frame: &WireMessage| {
            SubscriptionKey::from_confirmation(frame).as_ref() == Some(&expected)
        }),
        error_matcher: RequestSpec::market_error_matcher(&key.market_id),
        timeout,
    };
    (subscription_frame(message_type, key), spec)
}

fn validate_market_id(market_id: &str) -> Result<(), FeedError> {
    if market_id.trim().is_empty() {
        return Err(FeedError::InvalidArgument(
            "market id must not be empty".to_string(),
        ));
    }
    Ok(())
}

impl ConnectionManager {
    /// Subscribes to `market_id` and resolves once the server confirms the
    /// exact key. The key is recorded only on confirmation.
    pub async fn subscribe(
        &self,
        market_id: &str,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionKey, FeedError> {
        validate_market_id(market_id)?;
        let key = SubscriptionKey::new(market_id, &options);
        let (frame, spec) = subscription_request(
            MessageType::Subscribe,
            &key,
            self.inner.request_timeout(),
        );

        self.request(frame, spec).await?;
        if self.inner.registry.insert(key.clone()) {
            info!(subscription = %key, "subscription confirmed");
        }
        Ok(key)
    }

    /// Unsubscribes and removes the key once the server confirms it.
    pub async fn unsubscribe(
        &self,
        market_id: &str,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionKey, FeedError> {
        validate_market_id(market_id)?;
        let key = SubscriptionKey::new(market_id, &options);
        let (frame, spec) = subscription_request(
            MessageType::Unsubscribe,
            &key,
            self.inner.request_timeout(),
        );

        self.request(frame, spec).await?;
        if self.inner.registry.remove(&key) {
            info!(subscription = %key, "unsubscription confirmed");
        }
        Ok(key)
    }

    /// Asks the server which keys it holds for this client.
    pub async fn request_subscriptions_list(&self) -> Result<Vec<SubscriptionKey>, FeedError> {
        let spec = RequestSpec {
            kind: RequestKind::Query {
                request: "subscriptions_list".to_string(),
            },
            response: MessageType::SubscriptionsList,
            matcher: Box::new(|_: &WireMessage| true),
            error_matcher: Box::new(|frame: &WireMessage| frame.market_id.is_none()),
            timeout: self.inner.request_timeout(),
        };
        let frame = WireMessage::new(MessageType::SubscriptionsList).with_timestamp(now_unix_ms());
        let response = self.request(frame, spec).await?;

        let entries = response
            .data
            .as_ref()
            .and_then(|data| data.get("subscriptions").or(Some(data)))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(raw) = entry.as_str() else {
                continue;
            };
            match raw.parse::<SubscriptionKey>() {
                Ok(key) => keys.push(key),
                Err(error) => debug!(%error, "skipping unparsable subscription key"),
            }
        }
        Ok(keys)
    }
}

/// Re-issues every registered key on a freshly opened socket. Confirmation
/// listeners are armed before each frame is written; confirmations are
/// awaited in the background so a slow server cannot stall the reconnect.
pub(crate) async fn replay_subscriptions(
    inner: &Arc<SessionInner>,
    stream: &mut FeedStream,
) -> Result<usize, FeedError> {
    let keys = inner.registry.keys();
    for key in &keys {
        let (frame, spec) =
            subscription_request(MessageType::Subscribe, key, inner.request_timeout());
        let pending = correlator::register(&inner.bus, spec, inner.request_token());
        stream.send(to_transport_message(&frame)?).await?;
        tokio::spawn(confirm_replayed(Arc::clone(&inner.bus), key.clone(), pending));
    }
    Ok(keys.len())
}

/// A failed replay leaves the key registered and raises a non-fatal alert.
async fn confirm_replayed(bus: Arc<EventBus>, key: SubscriptionKey, pending: PendingRequest) {
    match pending.wait().await {
        Ok(_) => debug!(subscription = %key, "subscription restored"),
        Err(error) => {
            warn!(subscription = %key, %error, "subscription was not restored after reconnect");
            bus.emit_lifecycle(LifecycleEvent::Error {
                message: format!("failed to restore subscription {key}: {error}"),
                fatal: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::test_support::{test_config, ServerBehavior, TestServer};
    use crate::market::types::UpdateSelector;

    #[test]
    fn registry_deduplicates_by_rendered_key() {
        let registry = SubscriptionRegistry::default();
        let key = SubscriptionKey::new("alpha", &SubscriptionOptions::outcome(0));
        assert!(registry.insert(key.clone()));
        assert!(!registry.insert(key.clone()));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&key));
        assert!(registry.remove(&key));
        assert!(registry.is_empty());
    }

    #[test]
    fn subscribe_frame_carries_options_and_key() {
        let key = SubscriptionKey::new(
            "alpha",
            &SubscriptionOptions {
                outcome_index: Some(2),
                update_type: Some("trades".to_string()),
            },
        );
        let frame = subscription_frame(MessageType::Subscribe, &key);

        assert_eq!(frame.market_id.as_deref(), Some("alpha"));
        assert_eq!(frame.data_str("subscriptionKey"), Some("alpha:2:trades"));
        assert_eq!(frame.data_str("type"), Some("trades"));
        assert_eq!(
            frame
                .data
                .as_ref()
                .and_then(|data| data.get("outcomeIndex"))
                .and_then(Value::as_u64),
            Some(2)
        );
    }

    #[tokio::test]
    async fn subscribe_records_key_only_after_confirmation() {
        let mut server = TestServer::start(ServerBehavior::default()).await;
        let manager = ConnectionManager::new(test_config(&server.url));
        manager.connect().await.expect("connect should succeed");
        let _connection = server.next_connection().await.expect("connection");

        let key = manager
            .subscribe(
                "alpha",
                SubscriptionOptions {
                    outcome_index: None,
                    update_type: Some("trades".to_string()),
                },
            )
            .await
            .expect("subscription should confirm");
        assert_eq!(key.update_type, UpdateSelector::Only("trades".to_string()));
        assert_eq!(manager.subscriptions(), vec![key.clone()]);

        manager
            .unsubscribe("alpha", key.options())
            .await
            .expect("unsubscription should confirm");
        assert!(manager.subscriptions().is_empty());
        manager.destroy().await;
    }

    #[tokio::test]
    async fn subscribe_timeout_leaves_no_listeners_or_keys() {
        let mut server = TestServer::start(ServerBehavior {
            confirm_subscriptions: false,
            ..ServerBehavior::default()
        })
        .await;
        let mut config = test_config(&server.url);
        config.request_timeout_ms = 200;
        let manager = ConnectionManager::new(config);
        manager.connect().await.expect("connect should succeed");
        let connection = server.next_connection().await.expect("connection");
        let baseline = manager.bus().listener_count();

        let result = manager
            .subscribe("alpha", SubscriptionOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(FeedError::SubscriptionTimeout { ref market_id }) if market_id == "alpha"
        ));
        assert_eq!(manager.bus().listener_count(), baseline);

        // A late confirmation must not resurrect the key.
        connection.send(
            WireMessage::new(MessageType::SubscriptionConfirmed)
                .with_market("alpha")
                .with_data(json!({ "subscriptionKey": "alpha:all:all" })),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.subscriptions().is_empty());
        manager.destroy().await;
    }

    #[tokio::test]
    async fn error_frame_rejects_subscription() {
        let mut server = TestServer::start(ServerBehavior {
            confirm_subscriptions: false,
            ..ServerBehavior::default()
        })
        .await;
        let manager = ConnectionManager::new(test_config(&server.url));
        manager.connect().await.expect("connect should succeed");
        let mut connection = server.next_connection().await.expect("connection");

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .subscribe("alpha", SubscriptionOptions::default())
                    .await
            })
        };
        connection
            .next_of(MessageType::Subscribe)
            .await
            .expect("subscribe frame should arrive");
        connection.send(
            WireMessage::new(MessageType::Error)
                .with_market("alpha")
                .with_data(json!({ "message": "unknown market" })),
        );

        let result = pending.await.expect("subscribe task should not panic");
        assert!(matches!(
            result,
            Err(FeedError::SubscriptionRejected { ref reason, .. }) if reason == "unknown market"
        ));
        assert!(manager.subscriptions().is_empty());
        manager.destroy().await;
    }

    #[tokio::test]
    async fn confirmation_for_a_different_key_is_ignored() {
        let mut server = TestServer::start(ServerBehavior {
            confirm_subscriptions: false,
            ..ServerBehavior::default()
        })
        .await;
        let manager = ConnectionManager::new(test_config(&server.url));
        manager.connect().await.expect("connect should succeed");
        let mut connection = server.next_connection().await.expect("connection");

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .subscribe("alpha", SubscriptionOptions::outcome(1))
                    .await
            })
        };
        connection
            .next_of(MessageType::Subscribe)
            .await
            .expect("subscribe frame should arrive");
        connection.send(
            WireMessage::new(MessageType::SubscriptionConfirmed)
                .with_market("alpha")
                .with_data(json!({ "subscriptionKey": "alpha:0:all" })),
        );
        connection.send(
            WireMessage::new(MessageType::SubscriptionConfirmed)
                .with_market("alpha")
                .with_data(json!({ "subscriptionKey": "alpha:1:all" })),
        );

        let key = pending
            .await
            .expect("subscribe task should not panic")
            .expect("matching confirmation should resolve");
        assert_eq!(key.to_string(), "alpha:1:all");
        assert_eq!(manager.subscriptions(), vec![key]);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn lists_server_side_subscriptions() {
        let mut server = TestServer::start(ServerBehavior::default()).await;
        let manager = ConnectionManager::new(test_config(&server.url));
        manager.connect().await.expect("connect should succeed");
        let mut connection = server.next_connection().await.expect("connection");

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.request_subscriptions_list().await })
        };
        connection
            .next_of(MessageType::SubscriptionsList)
            .await
            .expect("list request should arrive");
        connection.send(
            WireMessage::new(MessageType::SubscriptionsList)
                .with_data(json!({
                    "subscriptions": ["alpha:all:all", "beta:1:trades", "broken"]
                })),
        );

        let keys = pending
            .await
            .expect("list task should not panic")
            .expect("list should resolve");
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["alpha:all:all", "beta:1:trades"]);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn rejects_empty_market_id() {
        let manager = ConnectionManager::new(test_config("ws://127.0.0.1:9/ws"));
        let result = manager.subscribe("  ", SubscriptionOptions::default()).await;
        assert!(matches!(result, Err(FeedError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn subscribe_without_connection_fails_fast() {
        let manager = ConnectionManager::new(test_config("ws://127.0.0.1:9/ws"));
        let result = manager
            .subscribe("alpha", SubscriptionOptions::default())
            .await;
        assert!(matches!(result, Err(FeedError::NotConnected)));
        assert_eq!(manager.bus().listener_count(), 0);
    }
}
