#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lurker_domain::{ListenerId, StreamerHandle, StreamerId, UserId};
use parking_lot::Mutex;

use crate::{ActiveListener, InterestRow, ListenerRepository, StorageError};

/// In-memory repository with the same merge semantics as the Postgres
/// backend. Used by engine tests and useful for embedding.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	streamers: HashMap<StreamerId, StreamerRow>,
	listeners: HashMap<ListenerId, ListenerRow>,
	interests: Vec<StoredInterest>,
	messages: Vec<StoredMessage>,
}

#[derive(Debug, Clone)]
struct StreamerRow {
	handle: StreamerHandle,
	upstream_user_id: Option<i64>,
	profile_pic: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct ListenerRow {
	streamer_id: StreamerId,
	user_id: UserId,
	is_active: bool,
	end_time: Option<DateTime<Utc>>,
	duration_seconds: i64,
}

#[derive(Debug, Clone, Copy)]
struct StoredInterest {
	listener_id: ListenerId,
	user_id: UserId,
	request_time: DateTime<Utc>,
	end_time: DateTime<Utc>,
}

/// A persisted chat message, exposed for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub listener_id: ListenerId,
	pub sender: String,
	pub content: String,
	pub timestamp: DateTime<Utc>,
	pub has_link: bool,
	pub links: Vec<String>,
}

impl InMemoryRepository {
	pub fn new() -> Self {
		Self::default()
	}

	/// Snapshot of every stored message, in insertion order.
	pub fn messages(&self) -> Vec<StoredMessage> {
		self.inner.lock().messages.clone()
	}

	/// Current `is_active` flag of a listener row, if present.
	pub fn listener_is_active(&self, listener_id: ListenerId) -> Option<bool> {
		self.inner.lock().listeners.get(&listener_id).map(|l| l.is_active)
	}

	/// Current `end_time` of a listener row, if present.
	pub fn listener_end_time(&self, listener_id: ListenerId) -> Option<Option<DateTime<Utc>>> {
		self.inner.lock().listeners.get(&listener_id).map(|l| l.end_time)
	}

	pub fn interest_count(&self) -> usize {
		self.inner.lock().interests.len()
	}
}

#[async_trait]
impl ListenerRepository for InMemoryRepository {
	async fn upsert_streamer(
		&self,
		handle: &StreamerHandle,
		upstream_user_id: Option<i64>,
		profile_pic: Option<&str>,
	) -> Result<StreamerId, StorageError> {
		let mut inner = self.inner.lock();

		if let Some((id, row)) = inner.streamers.iter_mut().find(|(_, row)| &row.handle == handle) {
			if row.upstream_user_id.is_none() {
				row.upstream_user_id = upstream_user_id;
			}
			if row.profile_pic.is_none() {
				row.profile_pic = profile_pic.map(str::to_string);
			}
			return Ok(*id);
		}

		let id = StreamerId::new_v4();
		inner.streamers.insert(
			id,
			StreamerRow {
				handle: handle.clone(),
				upstream_user_id,
				profile_pic: profile_pic.map(str::to_string),
			},
		);
		Ok(id)
	}

	async fn upsert_listener(
		&self,
		streamer_id: StreamerId,
		user_id: UserId,
		end_time: DateTime<Utc>,
		duration_seconds: i64,
		is_active: bool,
	) -> Result<ListenerId, StorageError> {
		let now = Utc::now();
		let mut inner = self.inner.lock();

		if let Some((id, row)) = inner
			.listeners
			.iter_mut()
			.find(|(_, row)| row.streamer_id == streamer_id && row.user_id == user_id)
		{
			let merged_end = match row.end_time {
				Some(existing) => existing.max(end_time),
				None => end_time,
			};
			row.end_time = Some(merged_end);
			row.duration_seconds = row.duration_seconds.max(duration_seconds);
			row.is_active = is_active && merged_end > now;
			return Ok(*id);
		}

		let id = ListenerId::new_v4();
		inner.listeners.insert(
			id,
			ListenerRow {
				streamer_id,
				user_id,
				is_active: is_active && end_time > now,
				end_time: Some(end_time),
				duration_seconds,
			},
		);
		Ok(id)
	}

	async fn insert_interest(
		&self,
		listener_id: ListenerId,
		user_id: UserId,
		request_time: DateTime<Utc>,
		end_time: DateTime<Utc>,
	) -> Result<(), StorageError> {
		self.inner.lock().interests.push(StoredInterest {
			listener_id,
			user_id,
			request_time,
			end_time,
		});
		Ok(())
	}

	async fn list_active_listeners(&self) -> Result<Vec<ActiveListener>, StorageError> {
		let now = Utc::now();
		let inner = self.inner.lock();

		let mut out = Vec::new();
		for (id, row) in &inner.listeners {
			if !row.is_active {
				continue;
			}
			if let Some(end) = row.end_time
				&& end <= now
			{
				continue;
			}
			let Some(streamer) = inner.streamers.get(&row.streamer_id) else {
				continue;
			};
			out.push(ActiveListener {
				listener_id: *id,
				streamer_id: row.streamer_id,
				handle: streamer.handle.clone(),
				user_id: row.user_id,
				is_active: row.is_active,
				end_time: row.end_time,
				duration_seconds: row.duration_seconds,
			});
		}

		Ok(out)
	}

	async fn list_interests(&self, listener_id: ListenerId) -> Result<Vec<InterestRow>, StorageError> {
		let now = Utc::now();
		let inner = self.inner.lock();
		Ok(inner
			.interests
			.iter()
			.filter(|i| i.listener_id == listener_id && i.end_time > now)
			.map(|i| InterestRow {
				user_id: i.user_id,
				request_time: i.request_time,
				end_time: i.end_time,
			})
			.collect())
	}

	async fn update_listener_status(&self, listener_id: ListenerId, is_active: bool) -> Result<(), StorageError> {
		if let Some(row) = self.inner.lock().listeners.get_mut(&listener_id) {
			row.is_active = is_active;
		}
		Ok(())
	}

	async fn update_listener_end_time(&self, listener_id: ListenerId, end_time: DateTime<Utc>) -> Result<(), StorageError> {
		if let Some(row) = self.inner.lock().listeners.get_mut(&listener_id) {
			row.end_time = Some(end_time);
		}
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
		self.inner.lock().messages.push(StoredMessage {
			listener_id,
			sender: sender.to_string(),
			content: content.to_string(),
			timestamp,
			has_link,
			links: links.to_vec(),
		});
		Ok(())
	}

	async fn delete_expired_interests(&self, before: DateTime<Utc>) -> Result<u64, StorageError> {
		let mut inner = self.inner.lock();
		let len_before = inner.interests.len();
		inner.interests.retain(|i| i.end_time > before);
		Ok((len_before - inner.interests.len()) as u64)
	}
}

#[cfg(test)]
mod tests {
	use chrono::Duration;

	use super::*;

	fn handle(s: &str) -> StreamerHandle {
		StreamerHandle::new(s).expect("valid handle")
	}

	#[tokio::test]
	async fn upsert_streamer_never_duplicates() {
		let repo = InMemoryRepository::new();
		let first = repo.upsert_streamer(&handle("s1"), Some(7), None).await.expect("upsert");
		let second = repo
			.upsert_streamer(&handle("s1"), None, Some("pic.png"))
			.await
			.expect("upsert");
		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn upsert_listener_keeps_later_end_time_and_larger_duration() {
		let repo = InMemoryRepository::new();
		let streamer = repo.upsert_streamer(&handle("s1"), None, None).await.expect("upsert");
		let user = UserId::new_v4();

		let now = Utc::now();
		let far = now + Duration::hours(6);
		let near = now + Duration::hours(2);

		let id = repo
			.upsert_listener(streamer, user, far, 6 * 3600, true)
			.await
			.expect("insert");
		let same = repo
			.upsert_listener(streamer, user, near, 2 * 3600, true)
			.await
			.expect("update");

		assert_eq!(id, same);
		assert_eq!(repo.listener_end_time(id), Some(Some(far)));
	}

	#[tokio::test]
	async fn upsert_listener_coerces_past_end_time_to_inactive() {
		let repo = InMemoryRepository::new();
		let streamer = repo.upsert_streamer(&handle("s1"), None, None).await.expect("upsert");
		let user = UserId::new_v4();

		let past = Utc::now() - Duration::hours(1);
		let id = repo.upsert_listener(streamer, user, past, 3600, true).await.expect("insert");

		assert_eq!(repo.listener_is_active(id), Some(false));
		assert!(repo.list_active_listeners().await.expect("list").is_empty());
	}

	#[tokio::test]
	async fn list_interests_filters_expired_rows() {
		let repo = InMemoryRepository::new();
		let streamer = repo.upsert_streamer(&handle("s1"), None, None).await.expect("upsert");
		let user = UserId::new_v4();
		let now = Utc::now();
		let id = repo
			.upsert_listener(streamer, user, now + Duration::hours(5), 5 * 3600, true)
			.await
			.expect("insert");

		repo.insert_interest(id, user, now - Duration::hours(2), now - Duration::hours(1))
			.await
			.expect("expired interest");
		repo.insert_interest(id, user, now, now + Duration::hours(5))
			.await
			.expect("live interest");

		let interests = repo.list_interests(id).await.expect("list");
		assert_eq!(interests.len(), 1);
		assert!(interests[0].end_time > now);

		let removed = repo.delete_expired_interests(now).await.expect("prune");
		assert_eq!(removed, 1);
		assert_eq!(repo.interest_count(), 1);
	}
}
