#![forbid(unsafe_code)]

use hyper::http::request::Parts;
use lurker_storage::{Session, SessionStore, StorageError, UserAccount};
use uuid::Uuid;

use crate::api::{ApiContext, ApiError};

pub const SESSION_COOKIE: &str = "session_token";

/// Resolve the caller's session from `Authorization: Bearer` or the session cookie.
pub async fn authenticate(ctx: &ApiContext, parts: &Parts) -> Result<Session, ApiError> {
	let Some(token) = bearer_token(parts).or_else(|| cookie_token(parts)) else {
		return Err(ApiError::Unauthorized);
	};

	match ctx.sessions.get(&token).await {
		Ok(Some(session)) => Ok(session),
		Ok(None) => Err(ApiError::Unauthorized),
		Err(err) => Err(ApiError::Internal(format!("session lookup: {err}"))),
	}
}

/// Mint and store an opaque session token for a signed-in user.
pub async fn issue_session(
	ctx: &ApiContext,
	user: &UserAccount,
	device: Option<String>,
	ip: Option<String>,
) -> Result<String, StorageError> {
	let token = Uuid::new_v4().to_string();
	let session = Session {
		user_id: user.id,
		device,
		ip,
	};
	ctx.sessions.create(&token, &session, ctx.session_ttl).await?;
	Ok(token)
}

fn bearer_token(parts: &Parts) -> Option<String> {
	let value = parts.headers.get("Authorization")?.to_str().ok()?;
	let token = value.strip_prefix("Bearer ")?.trim();
	if token.is_empty() { None } else { Some(token.to_string()) }
}

fn cookie_token(parts: &Parts) -> Option<String> {
	let value = parts.headers.get("Cookie")?.to_str().ok()?;
	for pair in value.split(';') {
		let pair = pair.trim();
		if let Some(token) = pair.strip_prefix(SESSION_COOKIE)
			&& let Some(token) = token.strip_prefix('=')
		{
			let token = token.trim();
			if !token.is_empty() {
				return Some(token.to_string());
			}
		}
	}
	None
}
