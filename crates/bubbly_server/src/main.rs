#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use bubbly_domain::UserId;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::auth::issue_hmac_token;
use crate::server::notify::ChannelNotificationBridge;
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::sql_store::SqliteChatStore;
use crate::server::state::AppState;
use crate::server::store::{ChatStore, InMemoryChatStore};

const TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: bubbly_server [--bind host:port] [--config path] [--issue-token user_id]\n\
\n\
Options:\n\
\t--bind         Bind address (default: 127.0.0.1:8080)\n\
\t--config       Config file (default: ~/.bubbly/config.toml)\n\
\t--issue-token  Print a 24h access token for a user id and exit (dev only)\n\
\t--help         Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<SocketAddr>,
	config: Option<PathBuf>,
	issue_token: Option<UserId>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config: None,
		issue_token: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let addr = v.trim().parse::<SocketAddr>().unwrap_or_else(|e| {
					eprintln!("--bind: {e} (expected host:port)");
					usage_and_exit();
				});
				args.bind = Some(addr);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			"--issue-token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let user = v.trim().parse::<UserId>().unwrap_or_else(|e| {
					eprintln!("--issue-token: {e}");
					usage_and_exit();
				});
				args.issue_token = Some(user);
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
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,bubbly_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("bubbly_server");
				global::set_tracer_provider(tracer_provider);

				base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
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

async fn open_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn ChatStore>> {
	match database_url {
		Some(url) => {
			let store = SqliteChatStore::connect(url).await?;
			info!("persistence: sqlite store ready");
			Ok(Arc::new(store))
		}
		None => {
			warn!("persistence: no database_url configured; rooms and messages live in memory only");
			Ok(Arc::new(InMemoryChatStore::new()))
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(user) = args.issue_token {
		let secret = server_cfg
			.server
			.auth_hmac_secret
			.as_ref()
			.ok_or_else(|| anyhow::anyhow!("auth_hmac_secret is not configured"))?;
		let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() + TOKEN_TTL_SECS;
		println!("{}", issue_hmac_token(user, exp, secret.expose())?);
		return Ok(());
	}

	if let Some(bind) = args.bind {
		server_cfg.server.bind = bind.to_string();
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store = open_store(server_cfg.persistence.database_url.as_deref()).await?;
	let bus = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: server_cfg.server.subscriber_queue_capacity,
		..RoomHubConfig::default()
	});
	let bridge = ChannelNotificationBridge::spawn_logging();

	let state = AppState::new(&server_cfg, store, Arc::new(bus), Arc::new(bridge));
	let health = state.health.clone();
	let app = crate::server::api::router(state);

	let listener = tokio::net::TcpListener::bind(&server_cfg.server.bind)
		.await
		.with_context(|| format!("bind {}", server_cfg.server.bind))?;
	info!(bind = %server_cfg.server.bind, "bubbly_server: listening");

	health.mark_ready();
	axum::serve(listener, app).await.context("http server")?;

	Ok(())
}
