#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lurker_domain::StreamerHandle;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::ResolverError;

/// Per-attempt wall-clock budget for discovery calls.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra attempts made inside the resolver when the failure is transient.
const TRANSIENT_RETRIES: u32 = 2;

/// Upstream channel metadata for a streamer handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChannel {
	pub chatroom_id: u64,
	pub upstream_user_id: Option<i64>,
	pub profile_pic: Option<String>,
}

impl ResolvedChannel {
	/// Bare chatroom id with no display metadata.
	pub fn bare(chatroom_id: u64) -> Self {
		Self {
			chatroom_id,
			upstream_user_id: None,
			profile_pic: None,
		}
	}
}

/// Resolves a streamer handle to its upstream chatroom identifier.
#[async_trait]
pub trait ChatroomResolver: Send + Sync + 'static {
	async fn resolve(&self, handle: &StreamerHandle) -> Result<ResolvedChannel, ResolverError>;
}

/// Operator-supplied `handle -> chatroom id` overrides, consulted before any network call.
#[derive(Debug, Default)]
pub struct StaticOverrideResolver {
	overrides: HashMap<String, u64>,
}

impl StaticOverrideResolver {
	pub fn new(overrides: HashMap<String, u64>) -> Self {
		let overrides = overrides.into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect();
		Self { overrides }
	}

	pub fn is_empty(&self) -> bool {
		self.overrides.is_empty()
	}
}

#[async_trait]
impl ChatroomResolver for StaticOverrideResolver {
	async fn resolve(&self, handle: &StreamerHandle) -> Result<ResolvedChannel, ResolverError> {
		match self.overrides.get(handle.as_str()) {
			Some(id) => {
				debug!(handle = %handle, chatroom_id = id, "chatroom id resolved from overrides");
				Ok(ResolvedChannel::bare(*id))
			}
			None => Err(ResolverError::NotFound),
		}
	}
}

/// HTTP discovery against the configured resolver endpoint.
///
/// Transient failures (network errors, 5xx) are retried in place; only the
/// final outcome surfaces to the caller.
#[derive(Debug, Clone)]
pub struct HttpResolver {
	endpoint: String,
	client: reqwest::Client,
}

impl HttpResolver {
	pub fn new(endpoint: impl Into<String>) -> Self {
		let client = reqwest::Client::builder()
			.timeout(RESOLVE_TIMEOUT)
			.build()
			.unwrap_or_else(|_| reqwest::Client::new());
		Self {
			endpoint: endpoint.into(),
			client,
		}
	}

	async fn resolve_once(&self, handle: &StreamerHandle) -> Result<ResolvedChannel, ResolverError> {
		let url = format!("{}?username={}", self.endpoint.trim_end_matches('/'), handle);
		let resp = self.client.get(&url).send().await.map_err(|e| {
			if e.is_status() {
				ResolverError::Permanent(e.to_string())
			} else {
				ResolverError::Transient(e.to_string())
			}
		})?;

		match resp.status() {
			StatusCode::NOT_FOUND => return Err(ResolverError::NotFound),
			status if status.is_server_error() => {
				return Err(ResolverError::Transient(format!("upstream returned {status}")));
			}
			status if status.is_client_error() => {
				return Err(ResolverError::Permanent(format!("upstream returned {status}")));
			}
			_ => {}
		}

		let body: ChannelInfoResponse = resp
			.json()
			.await
			.map_err(|e| ResolverError::Transient(format!("parse channel info: {e}")))?;

		if body.chatroom.id == 0 {
			return Err(ResolverError::NotFound);
		}

		Ok(ResolvedChannel {
			chatroom_id: body.chatroom.id,
			upstream_user_id: body.user.as_ref().map(|u| u.id),
			profile_pic: body.user.and_then(|u| u.profile_pic),
		})
	}
}

#[async_trait]
impl ChatroomResolver for HttpResolver {
	async fn resolve(&self, handle: &StreamerHandle) -> Result<ResolvedChannel, ResolverError> {
		let mut attempt = 0;
		loop {
			match self.resolve_once(handle).await {
				Ok(resolved) => return Ok(resolved),
				Err(ResolverError::Transient(reason)) if attempt < TRANSIENT_RETRIES => {
					attempt += 1;
					warn!(handle = %handle, attempt, reason = %reason, "transient resolver failure, retrying");
				}
				Err(err) => return Err(err),
			}
		}
	}
}

/// Tries resolvers in order; the first success wins.
///
/// `NotFound` falls through to the next resolver; any other error is
/// remembered and reported only if nothing later succeeds.
pub struct ResolverChain {
	resolvers: Vec<Arc<dyn ChatroomResolver>>,
}

impl ResolverChain {
	pub fn new(resolvers: Vec<Arc<dyn ChatroomResolver>>) -> Self {
		Self { resolvers }
	}
}

#[async_trait]
impl ChatroomResolver for ResolverChain {
	async fn resolve(&self, handle: &StreamerHandle) -> Result<ResolvedChannel, ResolverError> {
		let mut last_failure: Option<ResolverError> = None;

		for resolver in &self.resolvers {
			match resolver.resolve(handle).await {
				Ok(resolved) => return Ok(resolved),
				Err(ResolverError::NotFound) => {}
				Err(err) => last_failure = Some(err),
			}
		}

		Err(last_failure.unwrap_or(ResolverError::NotFound))
	}
}

#[derive(Debug, Deserialize)]
struct ChannelInfoResponse {
	chatroom: ChatroomInfo,
	#[serde(default)]
	user: Option<ChannelUserInfo>,
}

#[derive(Debug, Deserialize)]
struct ChatroomInfo {
	id: u64,
}

#[derive(Debug, Deserialize)]
struct ChannelUserInfo {
	id: i64,
	#[serde(default)]
	profile_pic: Option<String>,
}
