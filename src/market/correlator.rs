//! Request/response correlation over the asynchronous push channel.
//!
//! A request is registered before its frame is sent so a fast response can
//! never slip past the listener. Registration installs two bus listeners (the
//! expected response and `error`) that race to take a single settlement slot;
//! whichever path runs first owns the outcome and every other path finds the
//! slot empty. Both listeners are held as guards and are removed on every exit
//! path, including timeout, cancellation and dropping the pending request.

use crate::error::FeedError;
use crate::market::events::{EventBus, EventKind, ListenerGuard};
use crate::market::types::{MessageType, WireMessage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type FrameMatcher = Box<dyn Fn(&WireMessage) -> bool + Send + Sync>;

type Settlement = Arc<Mutex<Option<oneshot::Sender<Result<WireMessage, FeedError>>>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Subscribe { market_id: String },
    Unsubscribe { market_id: String },
    Query { request: String },
}

impl RequestKind {
    fn timeout_error(&self) -> FeedError {
        match self {
            Self::Subscribe { market_id } | Self::Unsubscribe { market_id } => {
                FeedError::SubscriptionTimeout {
                    market_id: market_id.clone(),
                }
            }
            Self::Query { request } => FeedError::RequestTimeout {
                request: request.clone(),
            },
        }
    }

    fn rejected_error(&self, reason: String) -> FeedError {
        match self {
            Self::Subscribe { market_id } | Self::Unsubscribe { market_id } => {
                FeedError::SubscriptionRejected {
                    market_id: market_id.clone(),
                    reason,
                }
            }
            Self::Query { request } => FeedError::RequestRejected {
                request: request.clone(),
                reason,
            },
        }
    }
}

pub struct RequestSpec {
    pub kind: RequestKind,
    pub response: MessageType,
    pub matcher: FrameMatcher,
    pub error_matcher: FrameMatcher,
    pub timeout: Duration,
}

impl RequestSpec {
    /// Errors scoped to `market_id`, or carrying no market at all, reject the
    /// request. Errors about other markets belong to other callers.
    pub fn market_error_matcher(market_id: &str) -> FrameMatcher {
        let market_id = market_id.to_string();
        Box::new(move |frame: &WireMessage| match frame.market_id.as_deref() {
            Some(candidate) => candidate == market_id,
            None => true,
        })
    }
}

pub struct PendingRequest {
    kind: RequestKind,
    receiver: oneshot::Receiver<Result<WireMessage, FeedError>>,
    settlement: Settlement,
    deadline: Instant,
    cancel: CancellationToken,
    guards: Vec<ListenerGuard>,
}

pub fn register(
    bus: &Arc<EventBus>,
    spec: RequestSpec,
    cancel: CancellationToken,
) -> PendingRequest {
    let (sender, receiver) = oneshot::channel();
    let settlement: Settlement = Arc::new(Mutex::new(Some(sender)));

    let response_slot = Arc::clone(&settlement);
    let matcher = spec.matcher;
    let response_guard = bus.scoped(EventKind::Frame(spec.response), move |event| {
        let Some(frame) = event.as_frame() else {
            return;
        };
        if !matcher(frame) {
            return;
        }
        if let Some(sender) = response_slot.lock().take() {
            let _ = sender.send(Ok(frame.clone()));
        }
    });

    let error_slot = Arc::clone(&settlement);
    let error_matcher = spec.error_matcher;
    let error_kind = spec.kind.clone();
    let error_guard = bus.scoped(EventKind::Frame(MessageType::Error), move |event| {
        let Some(frame) = event.as_frame() else {
            return;
        };
        if !error_matcher(frame) {
            return;
        }
        if let Some(sender) = error_slot.lock().take() {
            let _ = sender.send(Err(error_kind.rejected_error(frame.error_reason())));
        }
    });

    PendingRequest {
        kind: spec.kind,
        receiver,
        settlement,
        deadline: Instant::now() + spec.timeout,
        cancel,
        guards: vec![response_guard, error_guard],
    }
}

impl PendingRequest {
    pub async fn wait(self) -> Result<WireMessage, FeedError> {
        let PendingRequest {
            kind,
            mut receiver,
            settlement,
            deadline,
            cancel,
            guards,
        } = self;

        let outcome = tokio::select! {
            biased;
            settled = &mut receiver => match settled {
                Ok(result) => result,
                Err(_) => Err(FeedError::TransportClosed(
                    "request abandoned before settlement".to_string(),
                )),
            },
            _ = cancel.cancelled() => Err(FeedError::TransportClosed(
                "connection closed before a response arrived".to_string(),
            )),
            _ = tokio::time::sleep_until(deadline) => Err(kind.timeout_error()),
        };

        // Close the slot so a late response is a no-op, then drop listeners.
        settlement.lock().take();
        drop(guards);

        if let Err(error) = &outcome {
            debug!(request = ?kind, %error, "correlated request failed");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn confirmation(market_id: &str) -> WireMessage {
        WireMessage::new(MessageType::SubscriptionConfirmed)
            .with_market(market_id)
            .with_data(json!({ "subscriptionKey": format!("{market_id}:all:all") }))
    }

    fn subscribe_spec(market_id: &str, timeout: Duration) -> RequestSpec {
        let expected = market_id.to_string();
        RequestSpec {
            kind: RequestKind::Subscribe {
                market_id: market_id.to_string(),
            },
            response: MessageType::SubscriptionConfirmed,
            matcher: Box::new(move |frame: &WireMessage| {
                frame.market_id.as_deref() == Some(expected.as_str())
            }),
            error_matcher: RequestSpec::market_error_matcher(market_id),
            timeout,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_on_first_matching_frame() {
        let bus = EventBus::new();
        let pending = register(
            &bus,
            subscribe_spec("alpha", Duration::from_secs(5)),
            CancellationToken::new(),
        );

        bus.emit_frame(confirmation("beta"));
        bus.emit_frame(confirmation("alpha").with_timestamp(1));
        bus.emit_frame(confirmation("alpha").with_timestamp(2));

        let frame = pending.wait().await.expect("request should resolve");
        assert_eq!(frame.market_id.as_deref(), Some("alpha"));
        assert_eq!(frame.timestamp, Some(1));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_removes_listeners() {
        let bus = EventBus::new();
        let pending = register(
            &bus,
            subscribe_spec("alpha", Duration::from_secs(5)),
            CancellationToken::new(),
        );
        assert_eq!(bus.listener_count(), 2);

        let result = pending.wait().await;
        assert!(matches!(
            result,
            Err(FeedError::SubscriptionTimeout { ref market_id }) if market_id == "alpha"
        ));
        assert_eq!(bus.listener_count(), 0);

        // A later unrelated confirmation has nothing left to settle.
        bus.emit_frame(confirmation("beta"));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_on_error_frame_for_same_market() {
        let bus = EventBus::new();
        let pending = register(
            &bus,
            subscribe_spec("alpha", Duration::from_secs(5)),
            CancellationToken::new(),
        );

        bus.emit_frame(
            WireMessage::new(MessageType::Error)
                .with_market("beta")
                .with_data(json!({ "message": "not yours" })),
        );
        bus.emit_frame(
            WireMessage::new(MessageType::Error)
                .with_market("alpha")
                .with_data(json!({ "message": "market closed" })),
        );
        bus.emit_frame(confirmation("alpha"));

        let result = pending.wait().await;
        assert!(matches!(
            result,
            Err(FeedError::SubscriptionRejected { ref reason, .. }) if reason == "market closed"
        ));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_rejects_pending_request() {
        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        let pending = register(
            &bus,
            RequestSpec {
                kind: RequestKind::Query {
                    request: "get_market_data".to_string(),
                },
                response: MessageType::MarketData,
                matcher: Box::new(|_: &WireMessage| true),
                error_matcher: Box::new(|_: &WireMessage| true),
                timeout: Duration::from_secs(5),
            },
            cancel.clone(),
        );

        cancel.cancel();
        let result = pending.wait().await;
        assert!(matches!(result, Err(FeedError::TransportClosed(_))));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn query_timeout_maps_to_request_timeout() {
        let bus = EventBus::new();
        let pending = register(
            &bus,
            RequestSpec {
                kind: RequestKind::Query {
                    request: "get_market_data".to_string(),
                },
                response: MessageType::MarketData,
                matcher: Box::new(|_: &WireMessage| true),
                error_matcher: Box::new(|_: &WireMessage| true),
                timeout: Duration::from_secs(5),
            },
            CancellationToken::new(),
        );

        let result = pending.wait().await;
        assert!(matches!(result, Err(FeedError::RequestTimeout { .. })));
    }

    #[tokio::test]
    async fn dropping_pending_request_removes_listeners() {
        let bus = EventBus::new();
        let pending = register(
            &bus,
            subscribe_spec("alpha", Duration::from_secs(5)),
            CancellationToken::new(),
        );
        drop(pending);
        assert_eq!(bus.listener_count(), 0);
    }
}
