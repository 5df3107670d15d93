#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use lurker_engine::EngineConfig;
use lurker_kick::{DEFAULT_PUSHER_WS_URL, DEFAULT_RESOLVER_ENDPOINT, DEFAULT_SUBSCRIBE_TEMPLATE};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.lurker/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".lurker").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub database: DatabaseSettings,
	pub session: SessionSettings,
	pub kick: KickSettings,
}

/// HTTP surface settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// API bind address (host:port).
	pub api_bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Persistence settings.
#[derive(Debug, Clone, Default)]
pub struct DatabaseSettings {
	/// PostgreSQL URL.
	pub url: Option<String>,
}

/// Session store settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	/// Redis URL; sessions fall back to the in-memory store when unset.
	pub redis_url: Option<String>,
	/// Session lifetime.
	pub ttl: Duration,
}

/// Upstream chat ingestion settings.
#[derive(Debug, Clone)]
pub struct KickSettings {
	pub upstream_ws_url: String,
	pub subscribe_template: String,
	pub resolver_endpoint: String,
	pub inbound_buffer_size: usize,
	pub reconnect_interval: Duration,
	pub max_reconnect_attempts: u32,
	pub interest_window: Duration,
	pub cleanup_period: Duration,
	/// Optional overrides: streamer handle -> chatroom id.
	pub chatroom_id_overrides: BTreeMap<String, u64>,
}

impl ServerConfig {
	/// Project the engine's slice of the config.
	pub fn engine_config(&self) -> EngineConfig {
		EngineConfig {
			upstream_ws_url: self.kick.upstream_ws_url.clone(),
			subscribe_template: self.kick.subscribe_template.clone(),
			inbound_buffer_size: self.kick.inbound_buffer_size,
			reconnect_interval: self.kick.reconnect_interval,
			max_reconnect_attempts: self.kick.max_reconnect_attempts,
			interest_window: self.kick.interest_window,
			cleanup_period: self.kick.cleanup_period,
			..EngineConfig::default()
		}
	}

	fn from_file(file: FileConfig) -> Self {
		let defaults = EngineConfig::default();

		Self {
			server: ServerSettings {
				api_bind: file
					.server
					.api_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| "127.0.0.1:8080".to_string()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			database: DatabaseSettings {
				url: file.database.url.filter(|s| !s.trim().is_empty()),
			},
			session: SessionSettings {
				redis_url: file.session.redis_url.filter(|s| !s.trim().is_empty()),
				ttl: Duration::from_secs(file.session.ttl_hours.unwrap_or(24).max(1) * 60 * 60),
			},
			kick: KickSettings {
				upstream_ws_url: file
					.kick
					.upstream_ws_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_PUSHER_WS_URL.to_string()),
				subscribe_template: file
					.kick
					.subscribe_template
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_SUBSCRIBE_TEMPLATE.to_string()),
				resolver_endpoint: file
					.kick
					.resolver_endpoint
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_RESOLVER_ENDPOINT.to_string()),
				inbound_buffer_size: file.kick.inbound_buffer_size.unwrap_or(defaults.inbound_buffer_size),
				reconnect_interval: file
					.kick
					.reconnect_interval_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.reconnect_interval),
				max_reconnect_attempts: file.kick.max_reconnect_attempts.unwrap_or(defaults.max_reconnect_attempts),
				interest_window: file
					.kick
					.interest_window_minutes
					.map(|m| Duration::from_secs(m * 60))
					.unwrap_or(defaults.interest_window),
				cleanup_period: file
					.kick
					.cleanup_period_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.cleanup_period),
				chatroom_id_overrides: file.kick.chatroom_id_overrides,
			},
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	database: FileDatabaseSettings,

	#[serde(default)]
	session: FileSessionSettings,

	#[serde(default)]
	kick: FileKickSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	api_bind: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDatabaseSettings {
	url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	redis_url: Option<String>,
	ttl_hours: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileKickSettings {
	upstream_ws_url: Option<String>,
	subscribe_template: Option<String>,
	resolver_endpoint: Option<String>,
	inbound_buffer_size: Option<usize>,
	reconnect_interval_ms: Option<u64>,
	max_reconnect_attempts: Option<u32>,
	interest_window_minutes: Option<u64>,
	cleanup_period_secs: Option<u64>,

	#[serde(default)]
	chatroom_id_overrides: BTreeMap<String, u64>,
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("LURKER_API_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.api_bind = v;
			info!("server config: api_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LURKER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LURKER_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.database.url = Some(v);
			info!("database config: url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LURKER_SESSION_REDIS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.session.redis_url = Some(v);
			info!("session config: redis_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LURKER_SESSION_TTL_HOURS")
		&& let Ok(hours) = v.trim().parse::<u64>()
	{
		cfg.session.ttl = Duration::from_secs(hours.max(1) * 60 * 60);
		info!(hours, "session config: ttl overridden by env");
	}

	if let Ok(v) = std::env::var("LURKER_KICK_WS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.kick.upstream_ws_url = v;
			info!("kick config: upstream_ws_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LURKER_KICK_RESOLVER_ENDPOINT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.kick.resolver_endpoint = v;
			info!("kick config: resolver_endpoint overridden by env");
		}
	}

	if let Ok(v) = std::env::var("LURKER_KICK_RECONNECT_INTERVAL_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.kick.reconnect_interval = Duration::from_millis(ms);
		info!(ms, "kick config: reconnect_interval overridden by env");
	}

	if let Ok(v) = std::env::var("LURKER_KICK_MAX_RECONNECT_ATTEMPTS")
		&& let Ok(attempts) = v.trim().parse::<u32>()
	{
		cfg.kick.max_reconnect_attempts = attempts;
		info!(attempts, "kick config: max_reconnect_attempts overridden by env");
	}

	if let Ok(v) = std::env::var("LURKER_INTEREST_WINDOW_MINUTES")
		&& let Ok(minutes) = v.trim().parse::<u64>()
	{
		cfg.kick.interest_window = Duration::from_secs(minutes * 60);
		info!(minutes, "kick config: interest_window overridden by env");
	}

	if let Ok(v) = std::env::var("LURKER_CLEANUP_PERIOD_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.kick.cleanup_period = Duration::from_secs(secs);
		info!(secs, "kick config: cleanup_period overridden by env");
	}
}
