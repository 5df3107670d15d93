#![forbid(unsafe_code)]

pub mod memory;
pub mod postgres;
pub mod session;
pub mod users;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lurker_domain::{ListenerId, StreamerHandle, StreamerId, UserId};
use thiserror::Error;

pub use memory::InMemoryRepository;
pub use postgres::PgRepository;
pub use session::{InMemorySessionStore, RedisSessionStore, Session, SessionStore};
pub use users::{InMemoryUserStore, PgUserStore, UserAccount, UserStore};

/// Storage-layer errors surfaced to the engine and the API.
#[derive(Debug, Error)]
pub enum StorageError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("migration error: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),

	#[error("password hash error: {0}")]
	PasswordHash(String),

	#[error("user already exists: {0}")]
	UserExists(String),

	#[error("user not found: {0}")]
	UserNotFound(String),

	#[error("invalid credentials")]
	InvalidCredentials,

	#[error("session backend error: {0}")]
	Session(String),

	#[error("storage deadline exceeded")]
	DeadlineExceeded,
}

/// A durable listener row joined with its streamer handle.
#[derive(Debug, Clone)]
pub struct ActiveListener {
	pub listener_id: ListenerId,
	pub streamer_id: StreamerId,
	pub handle: StreamerHandle,
	pub user_id: UserId,
	pub is_active: bool,
	pub end_time: Option<DateTime<Utc>>,
	pub duration_seconds: i64,
}

/// A durable interest row.
#[derive(Debug, Clone, Copy)]
pub struct InterestRow {
	pub user_id: UserId,
	pub request_time: DateTime<Utc>,
	pub end_time: DateTime<Utc>,
}

/// Repository port for streamers, listeners, interests and messages.
///
/// `upsert_listener` is atomic under the `(streamer_id, user_id)` uniqueness
/// constraint: an existing row keeps the later `end_time`, the larger
/// duration, and never ends up active with an already-past `end_time`.
#[async_trait]
pub trait ListenerRepository: Send + Sync + 'static {
	/// Returns the existing streamer id when the handle is already stored.
	async fn upsert_streamer(
		&self,
		handle: &StreamerHandle,
		upstream_user_id: Option<i64>,
		profile_pic: Option<&str>,
	) -> Result<StreamerId, StorageError>;

	async fn upsert_listener(
		&self,
		streamer_id: StreamerId,
		user_id: UserId,
		end_time: DateTime<Utc>,
		duration_seconds: i64,
		is_active: bool,
	) -> Result<ListenerId, StorageError>;

	async fn insert_interest(
		&self,
		listener_id: ListenerId,
		user_id: UserId,
		request_time: DateTime<Utc>,
		end_time: DateTime<Utc>,
	) -> Result<(), StorageError>;

	/// Listeners with `is_active = true` and an `end_time` that is NULL or in the future.
	async fn list_active_listeners(&self) -> Result<Vec<ActiveListener>, StorageError>;

	/// Interests for a listener whose `end_time` is still in the future.
	async fn list_interests(&self, listener_id: ListenerId) -> Result<Vec<InterestRow>, StorageError>;

	async fn update_listener_status(&self, listener_id: ListenerId, is_active: bool) -> Result<(), StorageError>;

	async fn update_listener_end_time(&self, listener_id: ListenerId, end_time: DateTime<Utc>) -> Result<(), StorageError>;

	async fn insert_message(
		&self,
		listener_id: ListenerId,
		sender: &str,
		content: &str,
		timestamp: DateTime<Utc>,
		has_link: bool,
		links: &[String],
	) -> Result<(), StorageError>;

	/// Prune interest rows whose `end_time` passed; returns how many were removed.
	async fn delete_expired_interests(&self, before: DateTime<Utc>) -> Result<u64, StorageError>;
}
