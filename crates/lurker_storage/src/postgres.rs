#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lurker_domain::{ListenerId, StreamerHandle, StreamerId, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::{ActiveListener, InterestRow, ListenerRepository, StorageError};

/// sqlx-backed repository over PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgRepository {
	pool: PgPool,
}

impl PgRepository {
	/// Connect a pool and run pending migrations.
	pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
		let pool = PgPoolOptions::new().max_connections(8).connect(database_url).await?;
		sqlx::migrate!("./migrations").run(&pool).await?;
		Ok(Self { pool })
	}

	/// Wrap an existing pool (migrations are the caller's concern).
	pub fn from_pool(pool: PgPool) -> Self {
		Self { pool }
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}
}

#[async_trait]
impl ListenerRepository for PgRepository {
	async fn upsert_streamer(
		&self,
		handle: &StreamerHandle,
		upstream_user_id: Option<i64>,
		profile_pic: Option<&str>,
	) -> Result<StreamerId, StorageError> {
		let row = sqlx::query(
			"INSERT INTO streamers (handle, upstream_user_id, profile_pic) \
			VALUES ($1, $2, $3) \
			ON CONFLICT (handle) DO UPDATE SET \
				upstream_user_id = COALESCE(EXCLUDED.upstream_user_id, streamers.upstream_user_id), \
				profile_pic = COALESCE(EXCLUDED.profile_pic, streamers.profile_pic) \
			RETURNING id",
		)
		.bind(handle.as_str())
		.bind(upstream_user_id)
		.bind(profile_pic)
		.fetch_one(&self.pool)
		.await?;

		Ok(StreamerId(row.try_get::<Uuid, _>("id")?))
	}

	async fn upsert_listener(
		&self,
		streamer_id: StreamerId,
		user_id: UserId,
		end_time: DateTime<Utc>,
		duration_seconds: i64,
		is_active: bool,
	) -> Result<ListenerId, StorageError> {
		// A fresh row must not be born active with an already-past end_time;
		// the conflict branch applies the same rule against the merged end_time.
		let effective_active = is_active && end_time > Utc::now();

		let row = sqlx::query(
			"INSERT INTO listeners (streamer_id, user_id, is_active, end_time, duration_seconds) \
			VALUES ($1, $2, $3, $4, $5) \
			ON CONFLICT (streamer_id, user_id) DO UPDATE SET \
				end_time = GREATEST(listeners.end_time, EXCLUDED.end_time), \
				duration_seconds = GREATEST(listeners.duration_seconds, EXCLUDED.duration_seconds), \
				is_active = EXCLUDED.is_active AND GREATEST(listeners.end_time, EXCLUDED.end_time) > NOW(), \
				updated_at = NOW() \
			RETURNING id",
		)
		.bind(streamer_id.as_uuid())
		.bind(user_id.as_uuid())
		.bind(effective_active)
		.bind(end_time)
		.bind(duration_seconds)
		.fetch_one(&self.pool)
		.await?;

		Ok(ListenerId(row.try_get::<Uuid, _>("id")?))
	}

	async fn insert_interest(
		&self,
		listener_id: ListenerId,
		user_id: UserId,
		request_time: DateTime<Utc>,
		end_time: DateTime<Utc>,
	) -> Result<(), StorageError> {
		sqlx::query("INSERT INTO interests (listener_id, user_id, request_time, end_time) VALUES ($1, $2, $3, $4)")
			.bind(listener_id.as_uuid())
			.bind(user_id.as_uuid())
			.bind(request_time)
			.bind(end_time)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn list_active_listeners(&self) -> Result<Vec<ActiveListener>, StorageError> {
		let rows = sqlx::query(
			"SELECT l.id, l.streamer_id, s.handle, l.user_id, l.is_active, l.end_time, l.duration_seconds \
			FROM listeners l \
			JOIN streamers s ON l.streamer_id = s.id \
			WHERE l.is_active = TRUE AND (l.end_time IS NULL OR l.end_time > NOW())",
		)
		.fetch_all(&self.pool)
		.await?;

		let mut listeners = Vec::with_capacity(rows.len());
		for row in rows {
			let raw_handle: String = row.try_get("handle")?;
			let handle = match StreamerHandle::new(&raw_handle) {
				Ok(handle) => handle,
				Err(err) => {
					warn!(handle = %raw_handle, error = %err, "skipping listener row with unusable handle");
					continue;
				}
			};

			listeners.push(ActiveListener {
				listener_id: ListenerId(row.try_get::<Uuid, _>("id")?),
				streamer_id: StreamerId(row.try_get::<Uuid, _>("streamer_id")?),
				handle,
				user_id: UserId(row.try_get::<Uuid, _>("user_id")?),
				is_active: row.try_get("is_active")?,
				end_time: row.try_get("end_time")?,
				duration_seconds: row.try_get("duration_seconds")?,
			});
		}

		Ok(listeners)
	}

	async fn list_interests(&self, listener_id: ListenerId) -> Result<Vec<InterestRow>, StorageError> {
		let rows = sqlx::query(
			"SELECT user_id, request_time, end_time FROM interests WHERE listener_id = $1 AND end_time > NOW()",
		)
		.bind(listener_id.as_uuid())
		.fetch_all(&self.pool)
		.await?;

		let mut interests = Vec::with_capacity(rows.len());
		for row in rows {
			interests.push(InterestRow {
				user_id: UserId(row.try_get::<Uuid, _>("user_id")?),
				request_time: row.try_get("request_time")?,
				end_time: row.try_get("end_time")?,
			});
		}

		Ok(interests)
	}

	async fn update_listener_status(&self, listener_id: ListenerId, is_active: bool) -> Result<(), StorageError> {
		sqlx::query("UPDATE listeners SET is_active = $1, updated_at = NOW() WHERE id = $2")
			.bind(is_active)
			.bind(listener_id.as_uuid())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn update_listener_end_time(&self, listener_id: ListenerId, end_time: DateTime<Utc>) -> Result<(), StorageError> {
		sqlx::query("UPDATE listeners SET end_time = $1, updated_at = NOW() WHERE id = $2")
			.bind(end_time)
			.bind(listener_id.as_uuid())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn insert_message(
		&self,
		listener_id: ListenerId,
		sender: &str,
		content: &str,
		timestamp: DateTime<Utc>,
		has_link: bool,
		links: &[String],
	) -> Result<(), StorageError> {
		sqlx::query(
			"INSERT INTO messages (listener_id, sender_handle, content, message_timestamp, has_link, extracted_links) \
			VALUES ($1, $2, $3, $4, $5, $6)",
		)
		.bind(listener_id.as_uuid())
		.bind(sender)
		.bind(content)
		.bind(timestamp)
		.bind(has_link)
		.bind(links)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn delete_expired_interests(&self, before: DateTime<Utc>) -> Result<u64, StorageError> {
		let result = sqlx::query("DELETE FROM interests WHERE end_time <= $1")
			.bind(before)
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected())
	}
}
