#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use lurker_domain::{StreamerHandle, UserId};
use lurker_kick::{ChatTransport, ChatroomResolver, ResolverError};
use lurker_storage::{ListenerRepository, StorageError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::listener::ListenerState;
use crate::manager::ListenerManager;
use crate::supervisor::Supervisor;

/// What a listen request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
	/// A brand-new listener was created and its supervisor started.
	Started,

	/// An already-running listener absorbed the interest.
	Extended,

	/// A dormant listener was rebuilt and its supervisor restarted.
	Resumed,
}

impl ListenOutcome {
	/// Human-readable confirmation for the requesting user.
	pub fn message(&self, handle: &StreamerHandle) -> String {
		match self {
			ListenOutcome::Started => format!("started listening to '{handle}' chat"),
			ListenOutcome::Extended => format!("extended the listening window for '{handle}'"),
			ListenOutcome::Resumed => format!("resumed listening to '{handle}' chat"),
		}
	}
}

/// Listen request failures surfaced to the HTTP layer.
#[derive(Debug, Error)]
pub enum ListenError {
	#[error("streamer '{0}' not found")]
	StreamerNotFound(StreamerHandle),

	#[error("chat id resolution failed: {0}")]
	Resolver(ResolverError),

	#[error(transparent)]
	Storage(#[from] StorageError),

	#[error("no running listener for '{0}'")]
	NotListening(StreamerHandle),
}

/// Listener counts for the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
	pub active_listeners: usize,
	pub total_listeners: usize,
}

/// Application service owning the manager and the collaborators every
/// supervisor needs. Handlers receive this explicitly; there is no global.
pub struct ListenService {
	pub(crate) manager: Arc<ListenerManager>,
	pub(crate) repo: Arc<dyn ListenerRepository>,
	pub(crate) resolver: Arc<dyn ChatroomResolver>,
	pub(crate) transport: Arc<dyn ChatTransport>,
	pub(crate) cfg: Arc<EngineConfig>,
}

impl ListenService {
	pub fn new(
		manager: Arc<ListenerManager>,
		repo: Arc<dyn ListenerRepository>,
		resolver: Arc<dyn ChatroomResolver>,
		transport: Arc<dyn ChatTransport>,
		cfg: Arc<EngineConfig>,
	) -> Self {
		Self {
			manager,
			repo,
			resolver,
			transport,
			cfg,
		}
	}

	pub fn manager(&self) -> &Arc<ListenerManager> {
		&self.manager
	}

	pub fn config(&self) -> &Arc<EngineConfig> {
		&self.cfg
	}

	/// Handle one authenticated listen request: upsert the durable rows,
	/// append the interest, then attach to (or start) the in-memory listener.
	pub async fn listen(&self, user_id: UserId, handle: &StreamerHandle) -> Result<ListenOutcome, ListenError> {
		let now = Utc::now();
		let window = chrono::Duration::from_std(self.cfg.interest_window).unwrap_or_else(|_| chrono::Duration::hours(5));
		let end_time = now + window;

		let resolved = match self.resolver.resolve(handle).await {
			Ok(resolved) => resolved,
			Err(ResolverError::NotFound) | Err(ResolverError::Permanent(_)) => {
				return Err(ListenError::StreamerNotFound(handle.clone()));
			}
			Err(err) => return Err(ListenError::Resolver(err)),
		};

		// Control-path storage failures abort the request.
		let streamer_id = self
			.with_deadline(self.repo.upsert_streamer(handle, resolved.upstream_user_id, resolved.profile_pic.as_deref()))
			.await?;
		let listener_id = self
			.with_deadline(
				self.repo
					.upsert_listener(streamer_id, user_id, end_time, window.num_seconds(), true),
			)
			.await?;
		self.with_deadline(self.repo.insert_interest(listener_id, user_id, now, end_time))
			.await?;

		match self.manager.get(handle) {
			None => {
				let state = Arc::new(ListenerState::new(
					handle.clone(),
					listener_id,
					end_time,
					self.cfg.inbound_buffer_size,
				));
				state.add_interest(user_id, end_time);

				match self.manager.insert_if_absent(handle.clone(), Arc::clone(&state)) {
					Ok(()) => {
						self.spawn_supervisor(state);
						info!(streamer = %handle, user = %user_id, "new listener started");
						Ok(ListenOutcome::Started)
					}
					// Another request won the race; ride its listener.
					Err(existing) => {
						self.extend_listener(&existing, user_id, end_time).await;
						Ok(ListenOutcome::Extended)
					}
				}
			}

			Some(state) if state.is_active() => {
				self.extend_listener(&state, user_id, end_time).await;
				info!(streamer = %handle, user = %user_id, "listening window extended");
				Ok(ListenOutcome::Extended)
			}

			// Dormant entry: its stop channel may already have fired, so a
			// fresh state (carrying the live interests) replaces it.
			Some(dormant) => {
				let fresh = Arc::new(ListenerState::new(
					handle.clone(),
					dormant.listener_id(),
					end_time,
					self.cfg.inbound_buffer_size,
				));
				fresh.import_interests(
					dormant
						.interests_snapshot()
						.into_iter()
						.filter(|interest| interest.is_active(now)),
				);
				fresh.add_interest(user_id, end_time);

				match self.manager.replace_if_same(handle, &dormant, Arc::clone(&fresh)) {
					Ok(()) => {
						self.spawn_supervisor(fresh);
						info!(streamer = %handle, user = %user_id, "dormant listener resumed");
						Ok(ListenOutcome::Resumed)
					}
					Err(Some(current)) => {
						self.extend_listener(&current, user_id, end_time).await;
						Ok(ListenOutcome::Extended)
					}
					Err(None) => {
						// The entry vanished while we looked; start over from scratch.
						let state = Arc::new(ListenerState::new(
							handle.clone(),
							listener_id,
							end_time,
							self.cfg.inbound_buffer_size,
						));
						state.add_interest(user_id, end_time);
						match self.manager.insert_if_absent(handle.clone(), Arc::clone(&state)) {
							Ok(()) => {
								self.spawn_supervisor(state);
								Ok(ListenOutcome::Started)
							}
							Err(existing) => {
								self.extend_listener(&existing, user_id, end_time).await;
								Ok(ListenOutcome::Extended)
							}
						}
					}
				}
			}
		}
	}

	/// Signal a running listener to stop.
	pub fn stop_listener(&self, handle: &StreamerHandle) -> Result<(), ListenError> {
		match self.manager.get(handle) {
			Some(state) => {
				state.signal_stop();
				info!(streamer = %handle, "listener stop requested");
				Ok(())
			}
			None => Err(ListenError::NotListening(handle.clone())),
		}
	}

	pub fn stats(&self) -> ListenerStats {
		ListenerStats {
			active_listeners: self.manager.active_count(),
			total_listeners: self.manager.len(),
		}
	}

	pub(crate) fn spawn_supervisor(&self, state: Arc<ListenerState>) -> JoinHandle<()> {
		Supervisor::new(
			state,
			Arc::clone(&self.manager),
			Arc::clone(&self.repo),
			Arc::clone(&self.resolver),
			Arc::clone(&self.transport),
			Arc::clone(&self.cfg),
		)
		.spawn()
	}

	async fn extend_listener(&self, state: &Arc<ListenerState>, user_id: UserId, end_time: chrono::DateTime<Utc>) {
		let previous_end = state.aggregate_end_time();
		state.add_interest(user_id, end_time);

		// The durable row tracked by this in-memory listener follows the
		// aggregate; failures here are logged, not surfaced.
		if end_time > previous_end
			&& let Err(err) = self
				.with_deadline(self.repo.update_listener_end_time(state.listener_id(), end_time))
				.await
		{
			warn!(streamer = %state.handle(), error = %err, "failed to extend durable listener end time");
		}
	}

	pub(crate) async fn with_deadline<T>(
		&self,
		fut: impl Future<Output = Result<T, StorageError>>,
	) -> Result<T, StorageError> {
		match tokio::time::timeout(self.cfg.storage_timeout, fut).await {
			Ok(result) => result,
			Err(_) => Err(StorageError::DeadlineExceeded),
		}
	}
}
