#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lurker_domain::UserId;
use parking_lot::Mutex;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::StorageError;

/// Session payload stored against an opaque token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
	pub user_id: UserId,
	#[serde(default)]
	pub device: Option<String>,
	#[serde(default)]
	pub ip: Option<String>,
}

/// TTL key/value store for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
	async fn create(&self, token: &str, session: &Session, ttl: Duration) -> Result<(), StorageError>;

	/// `None` when the token is unknown or expired.
	async fn get(&self, token: &str) -> Result<Option<Session>, StorageError>;

	async fn delete(&self, token: &str) -> Result<(), StorageError>;

	async fn delete_all_for_user(&self, user_id: UserId) -> Result<(), StorageError>;
}

fn user_sessions_key(user_id: UserId) -> String {
	format!("user_sessions:{user_id}")
}

/// Redis-backed session store; tokens expire server-side, and a per-user set
/// allows revoking every session of one user.
#[derive(Clone)]
pub struct RedisSessionStore {
	conn: redis::aio::ConnectionManager,
}

impl RedisSessionStore {
	pub async fn connect(redis_url: &str) -> Result<Self, StorageError> {
		let client = redis::Client::open(redis_url).map_err(|e| StorageError::Session(e.to_string()))?;
		let conn = client
			.get_connection_manager()
			.await
			.map_err(|e| StorageError::Session(e.to_string()))?;
		Ok(Self { conn })
	}
}

#[async_trait]
impl SessionStore for RedisSessionStore {
	async fn create(&self, token: &str, session: &Session, ttl: Duration) -> Result<(), StorageError> {
		let payload = serde_json::to_string(session).map_err(|e| StorageError::Session(e.to_string()))?;
		let mut conn = self.conn.clone();

		redis::pipe()
			.atomic()
			.set_ex(token, payload, ttl.as_secs().max(1))
			.ignore()
			.sadd(user_sessions_key(session.user_id), token)
			.ignore()
			.query_async::<()>(&mut conn)
			.await
			.map_err(|e| StorageError::Session(e.to_string()))
	}

	async fn get(&self, token: &str) -> Result<Option<Session>, StorageError> {
		let mut conn = self.conn.clone();
		let payload: Option<String> = conn.get(token).await.map_err(|e| StorageError::Session(e.to_string()))?;

		match payload {
			Some(payload) => serde_json::from_str(&payload)
				.map(Some)
				.map_err(|e| StorageError::Session(e.to_string())),
			None => Ok(None),
		}
	}

	async fn delete(&self, token: &str) -> Result<(), StorageError> {
		let Some(session) = self.get(token).await? else {
			return Ok(());
		};

		let mut conn = self.conn.clone();
		redis::pipe()
			.atomic()
			.del(token)
			.ignore()
			.srem(user_sessions_key(session.user_id), token)
			.ignore()
			.query_async::<()>(&mut conn)
			.await
			.map_err(|e| StorageError::Session(e.to_string()))
	}

	async fn delete_all_for_user(&self, user_id: UserId) -> Result<(), StorageError> {
		let key = user_sessions_key(user_id);
		let mut conn = self.conn.clone();

		let tokens: Vec<String> = conn.smembers(&key).await.map_err(|e| StorageError::Session(e.to_string()))?;
		if tokens.is_empty() {
			return Ok(());
		}

		let mut pipe = redis::pipe();
		pipe.atomic();
		for token in &tokens {
			pipe.del(token).ignore();
		}
		pipe.del(&key).ignore();

		pipe.query_async::<()>(&mut conn)
			.await
			.map_err(|e| StorageError::Session(e.to_string()))
	}
}

/// In-memory session store for tests and single-process setups.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
	sessions: Mutex<HashMap<String, (Session, Instant)>>,
}

impl InMemorySessionStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
	async fn create(&self, token: &str, session: &Session, ttl: Duration) -> Result<(), StorageError> {
		self.sessions
			.lock()
			.insert(token.to_string(), (session.clone(), Instant::now() + ttl));
		Ok(())
	}

	async fn get(&self, token: &str) -> Result<Option<Session>, StorageError> {
		let mut sessions = self.sessions.lock();
		match sessions.get(token) {
			Some((_, deadline)) if *deadline <= Instant::now() => {
				sessions.remove(token);
				Ok(None)
			}
			Some((session, _)) => Ok(Some(session.clone())),
			None => Ok(None),
		}
	}

	async fn delete(&self, token: &str) -> Result<(), StorageError> {
		self.sessions.lock().remove(token);
		Ok(())
	}

	async fn delete_all_for_user(&self, user_id: UserId) -> Result<(), StorageError> {
		self.sessions.lock().retain(|_, (session, _)| session.user_id != user_id);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn session(user_id: UserId) -> Session {
		Session {
			user_id,
			device: Some("test-agent".to_string()),
			ip: None,
		}
	}

	#[tokio::test]
	async fn create_get_delete_round_trip() {
		let store = InMemorySessionStore::new();
		let user = UserId::new_v4();

		store
			.create("tok-1", &session(user), Duration::from_secs(60))
			.await
			.expect("create");
		let got = store.get("tok-1").await.expect("get").expect("present");
		assert_eq!(got.user_id, user);

		store.delete("tok-1").await.expect("delete");
		assert!(store.get("tok-1").await.expect("get").is_none());
	}

	#[tokio::test]
	async fn expired_sessions_are_gone() {
		let store = InMemorySessionStore::new();
		store
			.create("tok-2", &session(UserId::new_v4()), Duration::from_secs(0))
			.await
			.expect("create");
		assert!(store.get("tok-2").await.expect("get").is_none());
	}

	#[tokio::test]
	async fn delete_all_for_user_revokes_every_token() {
		let store = InMemorySessionStore::new();
		let user = UserId::new_v4();
		let other = UserId::new_v4();

		store
			.create("a", &session(user), Duration::from_secs(60))
			.await
			.expect("create");
		store
			.create("b", &session(user), Duration::from_secs(60))
			.await
			.expect("create");
		store
			.create("c", &session(other), Duration::from_secs(60))
			.await
			.expect("create");

		store.delete_all_for_user(user).await.expect("revoke");
		assert!(store.get("a").await.expect("get").is_none());
		assert!(store.get("b").await.expect("get").is_none());
		assert!(store.get("c").await.expect("get").is_some());
	}
}
