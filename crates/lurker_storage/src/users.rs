#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::LazyLock;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng};
use argon2::Argon2;
use async_trait::async_trait;
use lurker_domain::UserId;
use parking_lot::Mutex;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::StorageError;

/// A registered end-user account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
	pub id: UserId,
	pub username: String,
	pub email: String,
}

/// Account registration and credential verification.
#[async_trait]
pub trait UserStore: Send + Sync + 'static {
	async fn create_user(&self, username: &str, email: &str, password: &str) -> Result<UserAccount, StorageError>;

	/// `identifier` matches either username or email.
	async fn verify_credentials(&self, identifier: &str, password: &str) -> Result<UserAccount, StorageError>;
}

fn hash_password(password: &str) -> Result<String, StorageError> {
	let salt = SaltString::generate(&mut OsRng);
	Argon2::default()
		.hash_password(password.as_bytes(), &salt)
		.map(|hash| hash.to_string())
		.map_err(|e| StorageError::PasswordHash(e.to_string()))
}

fn verify_password(password: &str, hash: &str) -> Result<(), StorageError> {
	let parsed = PasswordHash::new(hash).map_err(|e| StorageError::PasswordHash(e.to_string()))?;
	Argon2::default()
		.verify_password(password.as_bytes(), &parsed)
		.map_err(|_| StorageError::InvalidCredentials)
}

static DUMMY_HASH: LazyLock<String> = LazyLock::new(|| hash_password("lurker-dummy-password").unwrap_or_default());

/// Burn a hash verification for unknown accounts so lookups take roughly the
/// same time as a wrong-password attempt.
fn dummy_password_verify(password: &str) {
	let _ = verify_password(password, &DUMMY_HASH);
}

/// Postgres-backed account store.
#[derive(Debug, Clone)]
pub struct PgUserStore {
	pool: PgPool,
}

impl PgUserStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}
}

#[async_trait]
impl UserStore for PgUserStore {
	async fn create_user(&self, username: &str, email: &str, password: &str) -> Result<UserAccount, StorageError> {
		let password_hash = hash_password(password)?;

		let row = sqlx::query("INSERT INTO users (username, email, password_hash) VALUES ($1, $2, $3) RETURNING id")
			.bind(username)
			.bind(email)
			.bind(&password_hash)
			.fetch_one(&self.pool)
			.await
			.map_err(|e| {
				if let sqlx::Error::Database(ref db_err) = e
					&& db_err.is_unique_violation()
				{
					return StorageError::UserExists(username.to_string());
				}
				StorageError::from(e)
			})?;

		Ok(UserAccount {
			id: UserId(row.try_get::<Uuid, _>("id")?),
			username: username.to_string(),
			email: email.to_string(),
		})
	}

	async fn verify_credentials(&self, identifier: &str, password: &str) -> Result<UserAccount, StorageError> {
		let row = sqlx::query("SELECT id, username, email, password_hash FROM users WHERE username = $1 OR email = $1")
			.bind(identifier)
			.fetch_optional(&self.pool)
			.await?;

		let Some(row) = row else {
			dummy_password_verify(password);
			return Err(StorageError::UserNotFound(identifier.to_string()));
		};

		let password_hash: String = row.try_get("password_hash")?;
		verify_password(password, &password_hash)?;

		Ok(UserAccount {
			id: UserId(row.try_get::<Uuid, _>("id")?),
			username: row.try_get("username")?,
			email: row.try_get("email")?,
		})
	}
}

/// In-memory account store for tests.
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
	users: Mutex<HashMap<String, (UserAccount, String)>>,
}

impl InMemoryUserStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl UserStore for InMemoryUserStore {
	async fn create_user(&self, username: &str, email: &str, password: &str) -> Result<UserAccount, StorageError> {
		let password_hash = hash_password(password)?;
		let mut users = self.users.lock();

		if users.contains_key(username) || users.values().any(|(account, _)| account.email == email) {
			return Err(StorageError::UserExists(username.to_string()));
		}

		let account = UserAccount {
			id: UserId::new_v4(),
			username: username.to_string(),
			email: email.to_string(),
		};
		users.insert(username.to_string(), (account.clone(), password_hash));
		Ok(account)
	}

	async fn verify_credentials(&self, identifier: &str, password: &str) -> Result<UserAccount, StorageError> {
		let entry = {
			let users = self.users.lock();
			users
				.values()
				.find(|(account, _)| account.username == identifier || account.email == identifier)
				.cloned()
		};

		let Some((account, password_hash)) = entry else {
			dummy_password_verify(password);
			return Err(StorageError::UserNotFound(identifier.to_string()));
		};

		verify_password(password, &password_hash)?;
		Ok(account)
	}
}
