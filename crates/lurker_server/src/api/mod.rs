#![forbid(unsafe_code)]

pub mod auth;
pub mod handlers;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lurker_engine::ListenService;
use lurker_storage::{SessionStore, UserStore};
use tokio::net::TcpListener;
use tracing::warn;

/// Readiness flag exposed on `/readyz`.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Everything the handlers need, passed explicitly (no globals).
#[derive(Clone)]
pub struct ApiContext {
	pub service: Arc<ListenService>,
	pub users: Arc<dyn UserStore>,
	pub sessions: Arc<dyn SessionStore>,
	pub session_ttl: Duration,
	pub health: HealthState,
}

/// API-layer failures, mapped onto HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
	BadRequest(String),
	Unauthorized,
	NotFound(String),
	Conflict(String),
	Upstream(String),
	Internal(String),
}

impl ApiError {
	fn status(&self) -> StatusCode {
		match self {
			ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
			ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
			ApiError::NotFound(_) => StatusCode::NOT_FOUND,
			ApiError::Conflict(_) => StatusCode::CONFLICT,
			ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
			ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	fn detail(&self) -> &str {
		match self {
			ApiError::BadRequest(msg)
			| ApiError::NotFound(msg)
			| ApiError::Conflict(msg)
			| ApiError::Upstream(msg)
			| ApiError::Internal(msg) => msg,
			ApiError::Unauthorized => "unauthorized",
		}
	}

	fn into_response(self) -> Response<Full<Bytes>> {
		if matches!(self, ApiError::Internal(_)) {
			warn!(detail = %self.detail(), "request failed internally");
		}
		json_response(self.status(), &serde_json::json!({ "error": self.detail() }))
	}
}

pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header("Content-Type", "application/json")
		.body(Full::new(Bytes::from(body.to_string())))
		.unwrap_or_default()
}

/// Accept loop for the JSON API (plus health endpoints).
pub async fn run_api_server(bind: SocketAddr, ctx: ApiContext) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, remote) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let ctx = ctx.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| route(req, ctx.clone(), remote));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "api connection error");
			}
		});
	}
}

async fn route(req: Request<Incoming>, ctx: ApiContext, remote: SocketAddr) -> Result<Response<Full<Bytes>>, Infallible> {
	let (parts, body) = req.into_parts();
	let path = parts.uri.path().to_string();

	// Health endpoints carry no body and need no auth.
	if parts.method == Method::GET {
		match path.as_str() {
			"/healthz" => {
				return Ok(Response::builder()
					.status(StatusCode::OK)
					.body(Full::new(Bytes::from_static(b"ok")))
					.unwrap_or_default());
			}
			"/readyz" => {
				let (status, text): (StatusCode, &[u8]) = if ctx.health.is_ready() {
					(StatusCode::OK, b"ready")
				} else {
					(StatusCode::SERVICE_UNAVAILABLE, b"not-ready")
				};
				return Ok(Response::builder()
					.status(status)
					.body(Full::new(Bytes::from_static(text)))
					.unwrap_or_default());
			}
			"/v1/stats" => {
				let result = handlers::stats(&ctx, &parts).await;
				return Ok(result.unwrap_or_else(ApiError::into_response));
			}
			_ => {}
		}
	}

	let body = match body.collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(err) => {
			return Ok(ApiError::BadRequest(format!("read request body: {err}")).into_response());
		}
	};

	let result = match (&parts.method, path.as_str()) {
		(&Method::POST, "/v1/signup") => handlers::signup(&ctx, &body).await,
		(&Method::POST, "/v1/signin") => handlers::signin(&ctx, &parts, &body, remote).await,
		(&Method::POST, listen_path) if listen_path.starts_with("/v1/listen/") => {
			let raw_handle = listen_path.trim_start_matches("/v1/listen/");
			handlers::listen(&ctx, &parts, raw_handle).await
		}
		_ => Err(ApiError::NotFound(format!("no route for {} {}", parts.method, path))),
	};

	Ok(result.unwrap_or_else(ApiError::into_response))
}
