use crate::error::FeedError;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const NORMAL_CLOSURE_CODE: u16 = 1000;
pub const ABNORMAL_CLOSURE_CODE: u16 = 1006;

pub async fn connect_market_stream(url: &str, timeout: Duration) -> Result<FeedStream, FeedError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let handshake = connect_async_with_config(url, Some(ws_config), true);
    match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(error)) => Err(error.into()),
        Err(_) => Err(FeedError::ConnectFailed(format!(
            "handshake with {url} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

pub fn normal_close_frame(reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::Normal,
        reason: reason.to_string().into(),
    }
}

/// Code and reason reported for a close frame; a missing frame counts as an
/// abnormal closure.
pub fn close_details(frame: Option<&CloseFrame<'_>>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
        None => (
            ABNORMAL_CLOSURE_CODE,
            "connection closed without a close frame".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_close_frame_uses_code_1000() {
        let frame = normal_close_frame("client disconnect");
        let (code, reason) = close_details(Some(&frame));
        assert_eq!(code, NORMAL_CLOSURE_CODE);
        assert_eq!(reason, "client disconnect");
    }

    #[test]
    fn missing_close_frame_is_abnormal() {
        let (code, _) = close_details(None);
        assert_eq!(code, ABNORMAL_CLOSURE_CODE);
    }

    #[tokio::test]
    async fn reports_refused_connection_as_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind should succeed");
        let address = listener.local_addr().expect("listener has an address");
        drop(listener);

        let result =
            connect_market_stream(&format!("ws://{address}/ws"), Duration::from_secs(2)).await;
        assert!(result.is_err());
    }
}
