#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use lurker_domain::StreamerHandle;
use lurker_engine::ListenError;
use lurker_storage::{StorageError, UserStore as _};
use serde::Deserialize;
use tracing::info;

use crate::api::auth::{self, SESSION_COOKIE};
use crate::api::{ApiContext, ApiError, json_response};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Deserialize)]
struct SignUpRequest {
	username: String,
	email: String,
	password: String,
}

#[derive(Debug, Deserialize)]
struct SignInRequest {
	identifier: String,
	password: String,
}

fn parse_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, ApiError> {
	serde_json::from_slice(body).map_err(|err| ApiError::BadRequest(format!("invalid request body: {err}")))
}

pub async fn signup(ctx: &ApiContext, body: &[u8]) -> Result<Response<Full<Bytes>>, ApiError> {
	let req: SignUpRequest = parse_body(body)?;

	let username = req.username.trim();
	if username.is_empty() {
		return Err(ApiError::BadRequest("username must not be empty".to_string()));
	}
	let email = req.email.trim();
	if !email.contains('@') {
		return Err(ApiError::BadRequest("email looks invalid".to_string()));
	}
	if req.password.chars().count() < MIN_PASSWORD_LEN {
		return Err(ApiError::BadRequest(format!(
			"password must be at least {MIN_PASSWORD_LEN} characters"
		)));
	}

	let account = ctx.users.create_user(username, email, &req.password).await.map_err(|err| match err {
		StorageError::UserExists(name) => ApiError::Conflict(format!("user '{name}' already exists")),
		other => ApiError::Internal(other.to_string()),
	})?;

	info!(user = %account.username, user_id = %account.id, "user signed up");
	Ok(json_response(
		StatusCode::CREATED,
		&serde_json::json!({ "user_id": account.id, "username": account.username }),
	))
}

pub async fn signin(
	ctx: &ApiContext,
	parts: &Parts,
	body: &[u8],
	remote: SocketAddr,
) -> Result<Response<Full<Bytes>>, ApiError> {
	let req: SignInRequest = parse_body(body)?;

	let account = ctx
		.users
		.verify_credentials(req.identifier.trim(), &req.password)
		.await
		.map_err(|err| match err {
			StorageError::UserNotFound(_) | StorageError::InvalidCredentials => ApiError::Unauthorized,
			other => ApiError::Internal(other.to_string()),
		})?;

	let device = parts
		.headers
		.get("User-Agent")
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);
	let token = auth::issue_session(ctx, &account, device, Some(remote.ip().to_string()))
		.await
		.map_err(|err| ApiError::Internal(format!("create session: {err}")))?;

	info!(user = %account.username, user_id = %account.id, "user signed in");

	let body = serde_json::json!({
		"token": token,
		"user_id": account.id,
		"username": account.username,
	});
	let cookie = format!(
		"{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
		ctx.session_ttl.as_secs()
	);

	Response::builder()
		.status(StatusCode::OK)
		.header("Content-Type", "application/json")
		.header("Set-Cookie", cookie)
		.body(Full::new(Bytes::from(body.to_string())))
		.map_err(|err| ApiError::Internal(err.to_string()))
}

pub async fn listen(ctx: &ApiContext, parts: &Parts, raw_handle: &str) -> Result<Response<Full<Bytes>>, ApiError> {
	let session = auth::authenticate(ctx, parts).await?;

	let handle = StreamerHandle::new(raw_handle)
		.map_err(|err| ApiError::BadRequest(format!("invalid streamer handle: {err}")))?;

	let outcome = ctx.service.listen(session.user_id, &handle).await.map_err(|err| match err {
		ListenError::StreamerNotFound(handle) => ApiError::NotFound(format!("streamer '{handle}' not found")),
		ListenError::Resolver(reason) => ApiError::Upstream(reason.to_string()),
		other => ApiError::Internal(other.to_string()),
	})?;

	Ok(json_response(
		StatusCode::OK,
		&serde_json::json!({ "message": outcome.message(&handle) }),
	))
}

pub async fn stats(ctx: &ApiContext, parts: &Parts) -> Result<Response<Full<Bytes>>, ApiError> {
	auth::authenticate(ctx, parts).await?;

	let stats = ctx.service.stats();
	Ok(json_response(
		StatusCode::OK,
		&serde_json::json!({
			"active_listeners": stats.active_listeners,
			"total_listeners": stats.total_listeners,
		}),
	))
}
