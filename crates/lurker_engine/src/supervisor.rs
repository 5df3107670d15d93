#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lurker_domain::{ChatEvent, ListenerId, StreamerHandle};
use lurker_kick::{
	ChatConnection, ChatTransport, ChatroomResolver, DecodedFrame, ResolverError, TransportError, decode_frame,
	extract_links, subscribe_frame,
};
use lurker_storage::ListenerRepository;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::console;
use crate::listener::ListenerState;
use crate::manager::ListenerManager;

/// Drives one listener through its lifecycle: connect, subscribe, stream,
/// reconnect within budget, then terminate and deregister.
pub struct Supervisor {
	state: Arc<ListenerState>,
	manager: Arc<ListenerManager>,
	repo: Arc<dyn ListenerRepository>,
	resolver: Arc<dyn ChatroomResolver>,
	transport: Arc<dyn ChatTransport>,
	cfg: Arc<EngineConfig>,
}

#[derive(Debug, Error)]
enum SetupError {
	#[error("resolve chat id: {0}")]
	Resolve(#[from] ResolverError),

	#[error("upstream connection: {0}")]
	Transport(#[from] TransportError),
}

/// Why one streaming session ended.
enum SessionEnd {
	Stopped,
	Expired,
	ClosedNormal,
	ClosedAbnormal,
}

/// How the reader task exited.
#[derive(Debug)]
enum ReaderExit {
	ClosedNormal,
	ClosedAbnormal(String),
	Cancelled,
}

impl Supervisor {
	pub fn new(
		state: Arc<ListenerState>,
		manager: Arc<ListenerManager>,
		repo: Arc<dyn ListenerRepository>,
		resolver: Arc<dyn ChatroomResolver>,
		transport: Arc<dyn ChatTransport>,
		cfg: Arc<EngineConfig>,
	) -> Self {
		Self {
			state,
			manager,
			repo,
			resolver,
			transport,
			cfg,
		}
	}

	pub fn spawn(self) -> JoinHandle<()> {
		tokio::spawn(async move { self.run().await })
	}

	async fn run(self) {
		let streamer = self.state.handle().clone();

		let Some(mut events_rx) = self.state.take_events_rx() else {
			warn!(streamer = %streamer, "listener already has a supervisor; refusing to start another");
			return;
		};
		let mut stop_rx = self.state.stop_rx();

		self.state.set_active(true);
		info!(streamer = %streamer, listener_id = %self.state.listener_id(), "listener supervisor started");

		'lifecycle: loop {
			if self.state.is_stopped() {
				break;
			}

			// CONNECTING / SUBSCRIBING
			let conn = match self.open_session(&streamer).await {
				Ok(conn) => conn,
				Err(err) => {
					warn!(streamer = %streamer, error = %err, "upstream session setup failed");
					if self.backoff(&streamer, &mut stop_rx).await {
						continue;
					}
					break 'lifecycle;
				}
			};

			// STREAMING
			self.state.reset_reconnect();
			metrics::counter!("lurker_engine_sessions_total").increment(1);
			info!(streamer = %streamer, "streaming upstream chat");

			let (cancel_tx, cancel_rx) = watch::channel(false);
			let (done_tx, mut done_rx) = oneshot::channel();
			let reader = tokio::spawn(read_loop(
				conn,
				cancel_rx,
				done_tx,
				self.state.events_sender(),
				self.state.listener_id(),
				streamer.clone(),
			));

			let mut ticker = tokio::time::interval(self.cfg.tick_period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

			let end = loop {
				tokio::select! {
					maybe_event = events_rx.recv() => {
						if let Some(event) = maybe_event {
							self.handle_event(&streamer, event);
						}
					}
					_ = ticker.tick() => {
						let now = Utc::now();
						self.state.remove_expired_interests(now);
						if !self.state.is_active()
							|| (self.state.aggregate_end_time() < now && !self.state.has_active_interests(now))
						{
							info!(streamer = %streamer, "listening window elapsed");
							break SessionEnd::Expired;
						}
					}
					_ = stop_rx.wait_for(|stopped| *stopped) => {
						info!(streamer = %streamer, "stop signal received");
						break SessionEnd::Stopped;
					}
					outcome = &mut done_rx => {
						match outcome {
							Ok(ReaderExit::ClosedNormal) => {
								info!(streamer = %streamer, "upstream closed the stream");
								break SessionEnd::ClosedNormal;
							}
							Ok(ReaderExit::ClosedAbnormal(reason)) => {
								warn!(streamer = %streamer, reason = %reason, "upstream stream ended abnormally");
								break SessionEnd::ClosedAbnormal;
							}
							Ok(ReaderExit::Cancelled) | Err(_) => break SessionEnd::ClosedAbnormal,
						}
					}
				}
			};

			let _ = cancel_tx.send(true);

			match end {
				SessionEnd::ClosedAbnormal => {
					let _ = reader.await;
					if self.backoff(&streamer, &mut stop_rx).await {
						continue;
					}
					break 'lifecycle;
				}
				SessionEnd::Stopped | SessionEnd::Expired | SessionEnd::ClosedNormal => {
					// DRAINING
					self.drain(&streamer, &mut events_rx).await;
					let _ = reader.await;
					break 'lifecycle;
				}
			}
		}

		self.terminate(&streamer).await;
	}

	async fn open_session(&self, streamer: &StreamerHandle) -> Result<Box<dyn ChatConnection>, SetupError> {
		let resolved = self.resolver.resolve(streamer).await?;
		let mut conn = self.transport.connect(&self.cfg.upstream_ws_url).await?;

		let frame = subscribe_frame(&self.cfg.subscribe_template, resolved.chatroom_id);
		conn.write_text(&frame).await?;
		debug!(streamer = %streamer, chatroom_id = resolved.chatroom_id, "subscribed to upstream chatroom");

		Ok(conn)
	}

	/// BACKOFF. Returns `true` to reconnect, `false` once the attempt budget
	/// is spent or a stop arrives mid-sleep.
	async fn backoff(&self, streamer: &StreamerHandle, stop_rx: &mut watch::Receiver<bool>) -> bool {
		let attempts = self.state.increment_reconnect();
		if attempts >= self.cfg.max_reconnect_attempts {
			warn!(streamer = %streamer, attempts, "reconnect budget exhausted");
			return false;
		}

		metrics::counter!("lurker_engine_reconnects_total").increment(1);
		info!(
			streamer = %streamer,
			attempts,
			delay_ms = self.cfg.reconnect_interval.as_millis() as u64,
			"backing off before reconnect"
		);

		tokio::select! {
			_ = tokio::time::sleep(self.cfg.reconnect_interval) => true,
			_ = stop_rx.wait_for(|stopped| *stopped) => false,
		}
	}

	fn handle_event(&self, streamer: &StreamerHandle, event: ChatEvent) {
		metrics::counter!("lurker_engine_messages_total").increment(1);
		self.state.touch();
		console::print_chat_line(streamer, &event);

		// Persistence is best-effort off the hot path; failures are logged,
		// never fatal to the stream.
		let repo = Arc::clone(&self.repo);
		let deadline = self.cfg.storage_timeout;
		let streamer = streamer.clone();
		tokio::spawn(async move {
			persist_event(repo, deadline, &streamer, event).await;
		});
	}

	/// DRAINING: flush whatever the decode tasks already queued, bounded by
	/// the drain budget.
	async fn drain(&self, streamer: &StreamerHandle, events_rx: &mut mpsc::Receiver<ChatEvent>) {
		let deadline = tokio::time::Instant::now() + self.cfg.drain_timeout;
		loop {
			match tokio::time::timeout_at(deadline, events_rx.recv()).await {
				Ok(Some(event)) => persist_event(Arc::clone(&self.repo), self.cfg.storage_timeout, streamer, event).await,
				Ok(None) => break,
				Err(_) => break,
			}
		}
	}

	/// TERMINATED: flip the in-memory and durable flags, then deregister.
	async fn terminate(&self, streamer: &StreamerHandle) {
		self.state.set_active(false);

		let listener_id = self.state.listener_id();
		match tokio::time::timeout(self.cfg.storage_timeout, self.repo.update_listener_status(listener_id, false)).await {
			Ok(Ok(())) => {}
			Ok(Err(err)) => warn!(streamer = %streamer, error = %err, "failed to mark listener inactive"),
			Err(_) => warn!(streamer = %streamer, "marking listener inactive timed out"),
		}

		self.manager.remove_if_same(streamer, &self.state);
		info!(streamer = %streamer, "listener supervisor terminated");
	}
}

async fn persist_event(repo: Arc<dyn ListenerRepository>, deadline: Duration, streamer: &StreamerHandle, event: ChatEvent) {
	let write = repo.insert_message(
		event.listener_id,
		&event.sender,
		&event.content,
		event.timestamp,
		event.has_link,
		&event.links,
	);

	match tokio::time::timeout(deadline, write).await {
		Ok(Ok(())) => {}
		Ok(Err(err)) => warn!(streamer = %streamer, error = %err, "failed to persist chat message"),
		Err(_) => warn!(streamer = %streamer, "chat message persistence timed out"),
	}
}

/// Reader task: owns the connection while streaming, hands every frame to a
/// fire-and-forget decode task, and reports how the stream ended.
async fn read_loop(
	mut conn: Box<dyn ChatConnection>,
	mut cancel_rx: watch::Receiver<bool>,
	done_tx: oneshot::Sender<ReaderExit>,
	events_tx: mpsc::Sender<ChatEvent>,
	listener_id: ListenerId,
	streamer: StreamerHandle,
) {
	let exit = loop {
		tokio::select! {
			frame = conn.read() => match frame {
				Ok(frame) => {
					let events_tx = events_tx.clone();
					let streamer = streamer.clone();
					tokio::spawn(async move {
						decode_and_forward(&frame, listener_id, &events_tx, &streamer);
					});
				}
				Err(err) if err.is_closed_normal() => break ReaderExit::ClosedNormal,
				Err(err) => break ReaderExit::ClosedAbnormal(err.to_string()),
			},
			_ = cancel_rx.wait_for(|cancelled| *cancelled) => break ReaderExit::Cancelled,
		}
	};

	conn.close().await;
	let _ = done_tx.send(exit);
}

/// Decode one frame and push the resulting event without ever blocking the
/// reader: a full inbound buffer drops the event with a warning.
fn decode_and_forward(frame: &str, listener_id: ListenerId, events_tx: &mpsc::Sender<ChatEvent>, streamer: &StreamerHandle) {
	match decode_frame(frame) {
		Ok(DecodedFrame::Chat(msg)) => {
			let links = extract_links(&msg.content);
			let event = ChatEvent {
				platform_id: msg.id,
				listener_id,
				sender: msg.sender.username,
				sender_color: msg.sender.identity.and_then(|identity| identity.color),
				content: msg.content,
				timestamp: msg.timestamp.unwrap_or_else(Utc::now),
				has_link: !links.is_empty(),
				links,
			};

			match events_tx.try_send(event) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					metrics::counter!("lurker_engine_events_dropped_total").increment(1);
					warn!(streamer = %streamer, "inbound buffer full, dropping chat event");
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					debug!(streamer = %streamer, "inbound channel gone, dropping chat event");
				}
			}
		}
		Ok(DecodedFrame::Ignored) => {}
		Err(err) => debug!(streamer = %streamer, error = %err, "dropping undecodable frame"),
	}
}
