#![forbid(unsafe_code)]

use std::time::Duration;

use lurker_kick::{DEFAULT_PUSHER_WS_URL, DEFAULT_SUBSCRIBE_TEMPLATE};

/// Engine tunables. Every listener supervisor shares one instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	/// Upstream Pusher application endpoint.
	pub upstream_ws_url: String,

	/// Subscribe frame template with a single `<ID>` placeholder.
	pub subscribe_template: String,

	/// Bounded capacity of each listener's inbound event channel.
	pub inbound_buffer_size: usize,

	/// Sleep between reconnect attempts.
	pub reconnect_interval: Duration,

	/// Consecutive connection failures tolerated before a supervisor gives up.
	pub max_reconnect_attempts: u32,

	/// How far a listen request extends a listener into the future.
	pub interest_window: Duration,

	/// Period of the manager's cleanup sweep.
	pub cleanup_period: Duration,

	/// Period of the supervisor's expiry tick.
	pub tick_period: Duration,

	/// Budget for draining buffered events during shutdown.
	pub drain_timeout: Duration,

	/// Deadline applied to every storage call made by the engine.
	pub storage_timeout: Duration,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			upstream_ws_url: DEFAULT_PUSHER_WS_URL.to_string(),
			subscribe_template: DEFAULT_SUBSCRIBE_TEMPLATE.to_string(),
			inbound_buffer_size: 1000,
			reconnect_interval: Duration::from_secs(5),
			max_reconnect_attempts: 3,
			interest_window: Duration::from_secs(5 * 60 * 60),
			cleanup_period: Duration::from_secs(60),
			tick_period: Duration::from_secs(1),
			drain_timeout: Duration::from_millis(250),
			storage_timeout: Duration::from_secs(5),
		}
	}
}
