//! Loopback market-data server for session tests.

use crate::market::codec::{decode_transport_message, to_transport_message, DecodedFrame};
use crate::market::types::{
    MessageType, SessionConfig, SubscriptionKey, WireMessage, DEFAULT_PUMP_THRESHOLD,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const TEST_WAIT: Duration = Duration::from_secs(5);

pub(crate) fn test_config(url: &str) -> SessionConfig {
    SessionConfig {
        url: url.to_string(),
        heartbeat_interval_ms: 10_000,
        reconnect_base_ms: 50,
        max_reconnect_attempts: 5,
        request_timeout_ms: 1_000,
        connect_timeout_ms: 1_000,
        pong_timeout_ms: None,
        markets: Vec::new(),
        ranking_interval_ms: 250,
        pump_threshold: DEFAULT_PUMP_THRESHOLD,
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerBehavior {
    pub confirm_subscriptions: bool,
    /// When false, only the first accepted connection confirms.
    pub confirm_on_reconnect: bool,
    pub answer_pings: bool,
    pub client_id: Option<&'static str>,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            confirm_subscriptions: true,
            confirm_on_reconnect: true,
            answer_pings: true,
            client_id: None,
        }
    }
}

enum ServerCommand {
    Send(WireMessage),
    Drop,
}

pub(crate) struct ServerConnection {
    frames: mpsc::UnboundedReceiver<WireMessage>,
    commands: mpsc::UnboundedSender<ServerCommand>,
}

impl ServerConnection {
    pub async fn next_frame(&mut self) -> Option<WireMessage> {
        tokio::time::timeout(TEST_WAIT, self.frames.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn next_of(&mut self, message_type: MessageType) -> Option<WireMessage> {
        loop {
            let frame = self.next_frame().await?;
            if frame.message_type == message_type {
                return Some(frame);
            }
        }
    }

    /// Counts frames of `message_type` received during `window`.
    pub async fn count_during(&mut self, message_type: MessageType, window: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + window;
        let mut count = 0;
        loop {
            match tokio::time::timeout_at(deadline, self.frames.recv()).await {
                Ok(Some(frame)) if frame.message_type == message_type => count += 1,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return count,
            }
        }
    }

    /// Resolves once the client side has gone away.
    pub async fn closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(TEST_WAIT, self.frames.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }

    pub fn send(&self, frame: WireMessage) {
        let _ = self.commands.send(ServerCommand::Send(frame));
    }

    /// Drops the socket without a close handshake.
    pub fn drop_connection(&self) {
        let _ = self.commands.send(ServerCommand::Drop);
    }
}

pub(crate) struct TestServer {
    pub url: String,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("loopback bind should succeed");
        let address = listener
            .local_addr()
            .expect("listener should have a local address");
        let (connections_tx, connections) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            let mut behavior = behavior;
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let Ok(websocket) = tokio_tungstenite::accept_async(socket).await else {
                    continue;
                };
                let (frames_tx, frames) = mpsc::unbounded_channel();
                let (commands, commands_rx) = mpsc::unbounded_channel();
                tokio::spawn(serve_connection(websocket, behavior, frames_tx, commands_rx));
                if !behavior.confirm_on_reconnect {
                    behavior.confirm_subscriptions = false;
                }
                if connections_tx
                    .send(ServerConnection { frames, commands })
                    .is_err()
                {
                    break;
                }
            }
        });

        Self {
            url: format!("ws://{address}/ws"),
            connections,
            accept_task,
        }
    }

    pub async fn next_connection(&mut self) -> Option<ServerConnection> {
        tokio::time::timeout(TEST_WAIT, self.connections.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn no_connection_within(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.connections.recv())
            .await
            .is_err()
    }

    /// Stops accepting; later connects are refused.
    pub fn stop_accepting(&self) {
        self.accept_task.abort();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn confirmation_for(request: &WireMessage, response: MessageType) -> WireMessage {
    let mut confirmation = WireMessage::new(response);
    if let Some(key) = SubscriptionKey::from_confirmation(request) {
        confirmation = confirmation
            .with_market(key.market_id.clone())
            .with_data(json!({ "subscriptionKey": key.to_string() }));
    }
    confirmation
}

async fn serve_connection(
    mut websocket: WebSocketStream<TcpStream>,
    behavior: ServerBehavior,
    frames_tx: mpsc::UnboundedSender<WireMessage>,
    mut commands: mpsc::UnboundedReceiver<ServerCommand>,
) {
    if let Some(client_id) = behavior.client_id {
        let mut welcome = WireMessage::new(MessageType::ConnectionEstablished);
        welcome.client_id = Some(client_id.to_string());
        if let Ok(message) = to_transport_message(&welcome) {
            let _ = websocket.send(message).await;
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ServerCommand::Send(frame)) => {
                    let Ok(message) = to_transport_message(&frame) else { continue };
                    if websocket.send(message).await.is_err() {
                        return;
                    }
                }
                Some(ServerCommand::Drop) | None => return,
            },
            incoming = websocket.next() => {
                let Some(Ok(message)) = incoming else { return };
                if matches!(message, Message::Close(_)) {
                    let _ = websocket.close(None).await;
                    return;
                }
                let Ok(Some(DecodedFrame::Frame(frame))) = decode_transport_message(message) else {
                    continue;
                };

                let reply = match frame.message_type {
                    MessageType::Ping if behavior.answer_pings => Some(
                        WireMessage::new(MessageType::Pong)
                            .with_timestamp(frame.timestamp.unwrap_or_default()),
                    ),
                    MessageType::Subscribe if behavior.confirm_subscriptions => {
                        Some(confirmation_for(&frame, MessageType::SubscriptionConfirmed))
                    }
                    MessageType::Unsubscribe if behavior.confirm_subscriptions => {
                        Some(confirmation_for(&frame, MessageType::UnsubscriptionConfirmed))
                    }
                    _ => None,
                };

                if let Some(reply) = reply {
                    let Ok(message) = to_transport_message(&reply) else { continue };
                    if websocket.send(message).await.is_err() {
                        return;
                    }
                }

                if frames_tx.send(frame).is_err() {
                    return;
                }
            }
        }
    }
}
