#![forbid(unsafe_code)]

mod api;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use lurker_engine::{ListenService, ListenerManager};
use lurker_kick::{ChatroomResolver, HttpResolver, PusherTransport, ResolverChain, StaticOverrideResolver};
use lurker_storage::{
	InMemorySessionStore, ListenerRepository, PgRepository, PgUserStore, RedisSessionStore, SessionStore, UserStore,
};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::api::{ApiContext, HealthState};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: lurker_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    API bind address (default: from config, 127.0.0.1:8080)\n\
\t--config  Config file path (default: ~/.lurker/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<SocketAddr>,
	config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				match v.parse::<SocketAddr>() {
					Ok(addr) => args.bind = Some(addr),
					Err(e) => {
						eprintln!("invalid --bind address: {e}");
						usage_and_exit();
					}
				}
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,lurker_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();
	let config_path = match args.config_path {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let database_url = server_cfg
		.database
		.url
		.as_deref()
		.context("no database url configured (set [database] url or LURKER_DATABASE_URL)")?;
	let pg = Arc::new(PgRepository::connect(database_url).await.context("connect postgres")?);
	info!("postgres connected, migrations applied");

	let repo: Arc<dyn ListenerRepository> = Arc::clone(&pg) as Arc<dyn ListenerRepository>;
	let users: Arc<dyn UserStore> = Arc::new(PgUserStore::new(pg.pool().clone()));

	let sessions: Arc<dyn SessionStore> = match server_cfg.session.redis_url.as_deref() {
		Some(url) => {
			let store = RedisSessionStore::connect(url).await.context("connect redis")?;
			info!("redis session store connected");
			Arc::new(store)
		}
		None => {
			warn!("no redis url configured; sessions are in-memory and die with the process");
			Arc::new(InMemorySessionStore::new())
		}
	};

	let mut resolvers: Vec<Arc<dyn ChatroomResolver>> = Vec::new();
	if !server_cfg.kick.chatroom_id_overrides.is_empty() {
		info!(
			count = server_cfg.kick.chatroom_id_overrides.len(),
			"chatroom id overrides configured"
		);
		resolvers.push(Arc::new(StaticOverrideResolver::new(
			server_cfg.kick.chatroom_id_overrides.clone().into_iter().collect(),
		)));
	}
	resolvers.push(Arc::new(HttpResolver::new(server_cfg.kick.resolver_endpoint.clone())));
	let resolver: Arc<dyn ChatroomResolver> = Arc::new(ResolverChain::new(resolvers));

	let engine_cfg = Arc::new(server_cfg.engine_config());
	let manager = Arc::new(ListenerManager::new());
	let service = Arc::new(ListenService::new(
		Arc::clone(&manager),
		Arc::clone(&repo),
		resolver,
		Arc::new(PusherTransport::new()),
		Arc::clone(&engine_cfg),
	));

	let report = service.recover_active_listeners().await.context("startup recovery")?;
	for (handle, reason) in &report.errors {
		warn!(streamer = %handle, reason = %reason, "listener recovery failed");
	}

	let sweeper = lurker_engine::manager::spawn_sweeper(Arc::clone(&manager), engine_cfg.cleanup_period);

	// Durable interests age out alongside the in-memory sweep.
	let pruner = {
		let repo = Arc::clone(&repo);
		let period = engine_cfg.cleanup_period;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				match repo.delete_expired_interests(Utc::now()).await {
					Ok(0) => {}
					Ok(removed) => debug!(removed, "pruned expired interest rows"),
					Err(err) => warn!(error = %err, "failed to prune expired interests"),
				}
			}
		})
	};

	let health = HealthState::new();
	let ctx = ApiContext {
		service: Arc::clone(&service),
		users,
		sessions,
		session_ttl: server_cfg.session.ttl,
		health: health.clone(),
	};

	let bind = match args.bind {
		Some(addr) => addr,
		None => server_cfg
			.server
			.api_bind
			.parse::<SocketAddr>()
			.with_context(|| format!("invalid api_bind '{}'", server_cfg.server.api_bind))?,
	};

	health.mark_ready();
	info!(%bind, "lurker api listening");

	tokio::select! {
		result = api::run_api_server(bind, ctx) => {
			result.context("api server")?;
		}
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown signal received, stopping listeners");
			sweeper.abort();
			pruner.abort();
			manager.shutdown_all();
			// Give supervisors a moment to mark their rows inactive.
			tokio::time::sleep(Duration::from_millis(500)).await;
		}
	}

	Ok(())
}
