#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::TransportError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const PUSHER_PROTOCOL: &str = "7";
const PUSHER_CLIENT: &str = "js";
const PUSHER_VERSION: &str = "8.4.0";

/// Dials upstream WebSocket connections. No reconnection happens here;
/// the supervisor owns retry policy.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
	async fn connect(&self, url: &str) -> Result<Box<dyn ChatConnection>, TransportError>;
}

/// A single open upstream connection, exclusively owned by its reader.
#[async_trait]
pub trait ChatConnection: Send {
	/// Send one text frame.
	async fn write_text(&mut self, frame: &str) -> Result<(), TransportError>;

	/// Receive the next text frame. Returns `ReadClosedNormal` for a
	/// peer-initiated graceful close and `ReadClosedAbnormal` otherwise.
	async fn read(&mut self) -> Result<String, TransportError>;

	/// Best-effort close.
	async fn close(&mut self);
}

/// Pusher-protocol transport over tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct PusherTransport;

impl PusherTransport {
	pub fn new() -> Self {
		Self
	}

	fn pusher_url(base: &str) -> Result<Url, TransportError> {
		let mut url = Url::parse(base).map_err(|e| TransportError::ConnectFailed(format!("parse ws url: {e}")))?;
		url.query_pairs_mut()
			.append_pair("protocol", PUSHER_PROTOCOL)
			.append_pair("client", PUSHER_CLIENT)
			.append_pair("version", PUSHER_VERSION)
			.append_pair("flash", "false");
		Ok(url)
	}
}

#[async_trait]
impl ChatTransport for PusherTransport {
	async fn connect(&self, url: &str) -> Result<Box<dyn ChatConnection>, TransportError> {
		let url = Self::pusher_url(url)?;
		let connect = tokio_tungstenite::connect_async(url.to_string());
		let (ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect)
			.await
			.map_err(|_| TransportError::HandshakeTimeout)?
			.map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

		debug!(url = %url, "upstream websocket connected");
		Ok(Box::new(PusherConnection { ws }))
	}
}

struct PusherConnection {
	ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ChatConnection for PusherConnection {
	async fn write_text(&mut self, frame: &str) -> Result<(), TransportError> {
		self.ws
			.send(Message::Text(frame.to_string().into()))
			.await
			.map_err(|e| TransportError::WriteFailed(e.to_string()))
	}

	async fn read(&mut self) -> Result<String, TransportError> {
		loop {
			match self.ws.next().await {
				Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
				Some(Ok(Message::Close(_))) => return Err(TransportError::ReadClosedNormal),
				Some(Ok(_)) => {}
				Some(Err(e)) => return Err(TransportError::ReadClosedAbnormal(e.to_string())),
				None => return Err(TransportError::ReadClosedAbnormal("stream ended".to_string())),
			}
		}
	}

	async fn close(&mut self) {
		let _ = self.ws.close(None).await;
	}
}
