#![forbid(unsafe_code)]

pub mod decode;
pub mod resolver;
pub mod transport;

use thiserror::Error;

pub use decode::{DecodedFrame, RawChatMessage, decode_frame, extract_links};
pub use resolver::{ChatroomResolver, HttpResolver, ResolvedChannel, ResolverChain, StaticOverrideResolver};
pub use transport::{ChatConnection, ChatTransport, PusherTransport};

/// Upstream event name carrying chat messages; every other envelope is ignored.
pub const CHAT_MESSAGE_EVENT: &str = "App\\Events\\ChatMessageEvent";

/// Default Pusher application endpoint (query parameters are appended on connect).
pub const DEFAULT_PUSHER_WS_URL: &str = "wss://ws-us2.pusher.com/app/32cbd69e4b950bf97679";

/// Default subscribe frame template; `<ID>` is replaced with the chatroom id.
pub const DEFAULT_SUBSCRIBE_TEMPLATE: &str =
	"{\"event\":\"pusher:subscribe\",\"data\":{\"auth\":\"\",\"channel\":\"chatrooms.<ID>.v2\"}}";

/// Default chat-ID discovery endpoint.
pub const DEFAULT_RESOLVER_ENDPOINT: &str = "https://kick-api-provider.vercel.app/api/channel";

/// Render the subscribe frame for a chatroom.
pub fn subscribe_frame(template: &str, chatroom_id: u64) -> String {
	template.replace("<ID>", &chatroom_id.to_string())
}

/// Chat-ID resolution errors.
#[derive(Debug, Error, Clone)]
pub enum ResolverError {
	/// Every resolution method came back empty.
	#[error("streamer not found upstream")]
	NotFound,

	/// Network failure or upstream 5xx; retried inside the resolver before surfacing.
	#[error("transient resolver failure: {0}")]
	Transient(String),

	/// Upstream rejected the request (4xx other than 404).
	#[error("permanent resolver failure: {0}")]
	Permanent(String),
}

/// WebSocket transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("connect failed: {0}")]
	ConnectFailed(String),

	#[error("handshake timed out")]
	HandshakeTimeout,

	#[error("write failed: {0}")]
	WriteFailed(String),

	/// Peer-initiated graceful close.
	#[error("connection closed by peer")]
	ReadClosedNormal,

	#[error("connection closed abnormally: {0}")]
	ReadClosedAbnormal(String),
}

impl TransportError {
	/// Whether this is the clean end-of-stream case.
	pub fn is_closed_normal(&self) -> bool {
		matches!(self, TransportError::ReadClosedNormal)
	}
}

/// Frame decoding errors; frames that fail to decode are dropped, never fatal.
#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("malformed envelope: {0}")]
	Envelope(String),

	#[error("malformed chat payload: {0}")]
	Payload(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn subscribe_frame_substitutes_chatroom_id() {
		let frame = subscribe_frame(DEFAULT_SUBSCRIBE_TEMPLATE, 196);
		assert_eq!(
			frame,
			"{\"event\":\"pusher:subscribe\",\"data\":{\"auth\":\"\",\"channel\":\"chatrooms.196.v2\"}}"
		);
	}
}
