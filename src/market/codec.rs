//! Wire codec for the market-data channel.
//!
//! Frames are JSON objects `{type, marketId?, data?, timestamp?, clientId?}`.
//! Decoding distinguishes frames this client understands from frames with a
//! tag it does not know yet; the latter are ignored so the server can evolve
//! the protocol without breaking older clients.

use crate::error::FeedError;
use crate::market::types::{MessageType, WireMessage};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    message_type: Option<String>,
    #[serde(default)]
    market_id: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Frame(WireMessage),
    Unknown(String),
}

pub fn decode_frame(payload: &mut [u8]) -> Result<DecodedFrame, FeedError> {
    let envelope: WireEnvelope = simd_json::serde::from_slice(payload)
        .map_err(|error| FeedError::MalformedFrame(error.to_string()))?;

    let Some(raw_type) = envelope.message_type else {
        return Err(FeedError::MalformedFrame(
            "frame is missing the 'type' field".to_string(),
        ));
    };

    let Some(message_type) = MessageType::parse_str(&raw_type) else {
        return Ok(DecodedFrame::Unknown(raw_type));
    };

    Ok(DecodedFrame::Frame(WireMessage {
        message_type,
        market_id: envelope.market_id,
        data: envelope.data,
        timestamp: envelope.timestamp.and_then(whole_millis),
        client_id: envelope.client_id,
    }))
}

/// Servers may send fractional milliseconds; round to the nearest whole one.
fn whole_millis(timestamp: f64) -> Option<i64> {
    timestamp.is_finite().then(|| timestamp.round() as i64)
}

pub fn encode_frame(message: &WireMessage) -> Result<String, FeedError> {
    Ok(simd_json::serde::to_string(message)?)
}

pub fn to_transport_message(message: &WireMessage) -> Result<Message, FeedError> {
    Ok(Message::Text(encode_frame(message)?))
}

/// Decodes a transport message. Control frames yield `Ok(None)`.
pub fn decode_transport_message(message: Message) -> Result<Option<DecodedFrame>, FeedError> {
    match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            decode_frame(owned_payload.as_mut_slice()).map(Some)
        }
        Message::Binary(mut binary_payload) => {
            decode_frame(binary_payload.as_mut_slice()).map(Some)
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_market_update_frame() {
        let mut payload = br#"{"type":"market_update","marketId":"m-1","data":{"outcomeIndex":0,"price":0.61},"timestamp":1700000000000}"#
            .to_vec();
        let decoded = decode_frame(&mut payload).expect("frame should decode");

        let DecodedFrame::Frame(frame) = decoded else {
            panic!("expected a known frame");
        };
        assert_eq!(frame.message_type, MessageType::MarketUpdate);
        assert_eq!(frame.market_id.as_deref(), Some("m-1"));
        assert_eq!(frame.timestamp, Some(1_700_000_000_000));
        assert_eq!(
            frame
                .data
                .as_ref()
                .and_then(|data| data.get("price"))
                .and_then(|price| price.as_f64()),
            Some(0.61)
        );
    }

    #[test]
    fn rounds_fractional_timestamps() {
        let mut payload =
            br#"{"type":"trade_event","marketId":"m-2","timestamp":1700000000123.6}"#.to_vec();
        let decoded = decode_frame(&mut payload).expect("fractional timestamps are accepted");

        let DecodedFrame::Frame(frame) = decoded else {
            panic!("expected a known frame");
        };
        assert_eq!(frame.message_type, MessageType::TradeEvent);
        assert_eq!(frame.timestamp, Some(1_700_000_000_124));
    }

    #[test]
    fn ignores_unknown_frame_types() {
        let mut payload = br#"{"type":"leaderboard_update","data":{}}"#.to_vec();
        let decoded = decode_frame(&mut payload).expect("unknown types are not errors");
        assert_eq!(decoded, DecodedFrame::Unknown("leaderboard_update".to_string()));
    }

    #[test]
    fn rejects_frames_without_type() {
        let mut payload = br#"{"marketId":"m-1"}"#.to_vec();
        let result = decode_frame(&mut payload);
        assert!(matches!(result, Err(FeedError::MalformedFrame(_))));
    }

    #[test]
    fn rejects_invalid_json() {
        let mut payload = b"{not json".to_vec();
        let result = decode_frame(&mut payload);
        assert!(matches!(result, Err(FeedError::MalformedFrame(_))));
    }

    #[test]
    fn encodes_without_absent_fields() {
        let frame = WireMessage::new(MessageType::Subscribe).with_market("m-9");
        let encoded = encode_frame(&frame).expect("frame should encode");

        assert!(encoded.contains(r#""type":"subscribe""#));
        assert!(encoded.contains(r#""marketId":"m-9""#));
        assert!(!encoded.contains("clientId"));
        assert!(!encoded.contains("data"));
    }

    #[test]
    fn skips_control_messages() {
        let decoded = decode_transport_message(Message::Ping(Vec::new()))
            .expect("control frames are not errors");
        assert!(decoded.is_none());
    }
}
