#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use liveboard_twitch::TwitchConfig;
use liveboard_twitch::cache::{PROFILE_ICON_TTL, SCHEDULE_TTL, TtlStore};
use liveboard_twitch::helix::HelixClient;
use liveboard_twitch::identity::IdentityResolver;
use liveboard_twitch::reconcile::Reconciler;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::registry::{GroupRegistry, RegistryConfig};
use crate::server::state::AppState;

const DEFAULT_BIND: &str = "127.0.0.1:3001";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: liveboard_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    HTTP bind address (default: {DEFAULT_BIND}; config [server].bind overrides the default)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<String> {
	let mut bind = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,liveboard_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
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

	let bind_arg = parse_args();

	let config_path = crate::config::default_config_path()?;
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let client_id = cfg.twitch.client_id.clone().context("twitch.client_id is required")?;
	let bearer_token = cfg.twitch.bearer_token.clone().context("twitch.bearer_token is required")?;
	let subscription_secret = cfg
		.twitch
		.subscription_secret
		.clone()
		.context("twitch.subscription_secret is required")?;
	let callback_url = cfg
		.callback_url()
		.context("hostname is required (webhook callback is derived from it)")?;

	let mut twitch_cfg = TwitchConfig::new(client_id, bearer_token, callback_url, subscription_secret);
	if let Some(base_url) = cfg.twitch.helix_base_url.clone() {
		twitch_cfg.helix_base_url = base_url;
	}

	let helix = Arc::new(HelixClient::new(
		&twitch_cfg.helix_base_url,
		twitch_cfg.client_id.clone(),
		twitch_cfg.bearer_token.clone(),
		twitch_cfg.request_timeout,
	)?);

	let data_dir = match cfg.server.data_dir.clone() {
		Some(dir) => dir,
		None => crate::config::default_data_dir()?,
	};

	let registry = Arc::new(GroupRegistry::load(data_dir.join("groups.json"), RegistryConfig::default()).await?);
	let identity = Arc::new(IdentityResolver::load((*helix).clone(), data_dir.join("cache").join("uids.json")).await?);
	let schedules = Arc::new(TtlStore::load(data_dir.join("cache").join("schedules.json"), Some(SCHEDULE_TTL)).await?);
	let profile_icons =
		Arc::new(TtlStore::load(data_dir.join("cache").join("profile_icons.json"), Some(PROFILE_ICON_TTL)).await?);

	let reconciler = Arc::new(Reconciler::new(
		(*helix).clone(),
		twitch_cfg.callback_url.clone(),
		twitch_cfg.subscription_secret.clone(),
	));

	let state = Arc::new(AppState {
		registry: Arc::clone(&registry),
		helix: Arc::clone(&helix),
		identity: Arc::clone(&identity),
		schedules,
		profile_icons,
		reconciler: Arc::clone(&reconciler),
		webhook_secret: cfg
			.twitch
			.verify_signatures
			.then(|| twitch_cfg.subscription_secret.clone()),
		modify_password: cfg.modify_password.clone(),
	});

	let usernames = registry.member_usernames().await;
	info!(members = usernames.len(), "resolving tracked member ids");
	let tracked_ids = match identity.resolve(&usernames).await {
		Ok(resolved) => resolved.into_values().collect::<Vec<_>>(),
		Err(e) => {
			warn!(error = %e, "startup identity resolution failed; continuing with cached ids only");
			Vec::new()
		}
	};

	state.discover_online(&usernames).await;

	// Deletes go out before the listener is up; creates wait until the
	// webhook endpoint can answer verification challenges.
	let plan = match reconciler.plan_remote(&tracked_ids).await {
		Ok(plan) => {
			reconciler.delete_obsolete(&plan).await;
			Some(plan)
		}
		Err(e) => {
			warn!(error = %e, "startup subscription listing failed; skipping reconciliation");
			None
		}
	};

	let bind = bind_arg
		.or_else(|| cfg.server.bind.clone())
		.unwrap_or_else(|| DEFAULT_BIND.to_string());
	let addr: SocketAddr = bind.parse().with_context(|| format!("invalid bind address {bind}"))?;
	let listener = TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
	info!(%addr, "listening");

	if let Some(plan) = plan {
		let reconciler = Arc::clone(&reconciler);
		tokio::spawn(async move {
			reconciler.create_needed(&plan).await;
		});
	}

	crate::server::http::run_http_server(listener, state).await
}
