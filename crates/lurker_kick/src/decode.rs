#![forbid(unsafe_code)]

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{CHAT_MESSAGE_EVENT, DecodeError};

static LINK_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://[^\s]+").expect("valid link regex"));

/// Outcome of decoding one raw frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
	/// A chat message payload worth forwarding.
	Chat(RawChatMessage),

	/// A well-formed envelope that is not a chat message; silently dropped.
	Ignored,
}

/// The subset of the upstream chat payload the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawChatMessage {
	pub id: String,
	pub content: String,
	pub sender: RawSender,
	#[serde(default)]
	pub timestamp: Option<DateTime<Utc>>,
	#[serde(rename = "type")]
	pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawSender {
	pub id: i64,
	pub username: String,
	#[serde(default)]
	pub identity: Option<RawIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawIdentity {
	#[serde(default)]
	pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PusherEnvelope {
	event: String,
	data: JsonValue,
}

/// Decode one upstream frame.
///
/// Envelopes whose `event` is not the chat-message event, and chat payloads
/// whose `type` is not `"message"`, decode to [`DecodedFrame::Ignored`].
pub fn decode_frame(raw: &str) -> Result<DecodedFrame, DecodeError> {
	let envelope: PusherEnvelope = serde_json::from_str(raw).map_err(|e| DecodeError::Envelope(e.to_string()))?;

	if envelope.event != CHAT_MESSAGE_EVENT {
		return Ok(DecodedFrame::Ignored);
	}

	// The payload normally arrives as a JSON-encoded string, but some event
	// replays inline it as an object.
	let message: RawChatMessage = match envelope.data {
		JsonValue::String(inner) => serde_json::from_str(&inner).map_err(|e| DecodeError::Payload(e.to_string()))?,
		other => serde_json::from_value(other).map_err(|e| DecodeError::Payload(e.to_string()))?,
	};

	if message.kind != "message" {
		return Ok(DecodedFrame::Ignored);
	}

	Ok(DecodedFrame::Chat(message))
}

/// Extract `http(s)` links from message content with the shared compiled expression.
pub fn extract_links(content: &str) -> Vec<String> {
	LINK_REGEX.find_iter(content).map(|m| m.as_str().to_string()).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	const CHAT_FRAME: &str = r##"{"event":"App\\Events\\ChatMessageEvent","data":"{\"type\":\"message\",\"id\":\"m1\",\"content\":\"hello https://a.b\",\"sender\":{\"id\":1,\"username\":\"u\",\"identity\":{\"color\":\"#ff0000\"}},\"timestamp\":\"2024-01-01T00:00:00Z\"}"}"##;

	#[test]
	fn decodes_chat_message_envelope() {
		let decoded = decode_frame(CHAT_FRAME).expect("decodes");
		let DecodedFrame::Chat(msg) = decoded else {
			panic!("expected chat frame, got {decoded:?}");
		};

		assert_eq!(msg.id, "m1");
		assert_eq!(msg.content, "hello https://a.b");
		assert_eq!(msg.sender.id, 1);
		assert_eq!(msg.sender.username, "u");
		assert_eq!(msg.sender.identity.and_then(|i| i.color).as_deref(), Some("#ff0000"));
		assert_eq!(msg.timestamp.expect("timestamp").to_rfc3339(), "2024-01-01T00:00:00+00:00");
	}

	#[test]
	fn ignores_non_chat_envelopes() {
		let frame = r#"{"event":"pusher:ping","data":"{}"}"#;
		assert_eq!(decode_frame(frame).expect("decodes"), DecodedFrame::Ignored);

		let frame = r#"{"event":"App\\Events\\UserBannedEvent","data":"{}"}"#;
		assert_eq!(decode_frame(frame).expect("decodes"), DecodedFrame::Ignored);
	}

	#[test]
	fn ignores_non_message_payload_types() {
		let frame = r#"{"event":"App\\Events\\ChatMessageEvent","data":"{\"type\":\"reply\",\"id\":\"m2\",\"content\":\"x\",\"sender\":{\"id\":2,\"username\":\"v\"}}"}"#;
		assert_eq!(decode_frame(frame).expect("decodes"), DecodedFrame::Ignored);
	}

	#[test]
	fn accepts_inlined_payload_objects() {
		let frame = r#"{"event":"App\\Events\\ChatMessageEvent","data":{"type":"message","id":"m3","content":"inline","sender":{"id":3,"username":"w"}}}"#;
		let decoded = decode_frame(frame).expect("decodes");
		assert!(matches!(decoded, DecodedFrame::Chat(ref m) if m.id == "m3"));
	}

	#[test]
	fn malformed_frames_error_out() {
		assert!(decode_frame("not json").is_err());

		let bad_inner = r#"{"event":"App\\Events\\ChatMessageEvent","data":"not json"}"#;
		assert!(matches!(decode_frame(bad_inner), Err(DecodeError::Payload(_))));
	}

	#[test]
	fn link_extraction_finds_every_link() {
		assert_eq!(
			extract_links("go to https://a.b and http://c.d/e now"),
			vec!["https://a.b".to_string(), "http://c.d/e".to_string()]
		);
		assert!(extract_links("no links here").is_empty());
	}
}
