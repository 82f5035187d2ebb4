#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use qarooms_util::endpoint::{HttpEndpoint, validate_http_endpoint};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::api::{AppState, router};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::store::{InMemoryRoomStore, RoomStore, SqlRoomStore};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: qarooms_server [--bind http://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: {})\n\
\t         Format: http://host:port\n\
\t--config  Config file (default: ~/.qarooms/config.toml)\n\
\t--help   Show this help\n\
",
		crate::config::DEFAULT_HTTP_BIND
	);
	std::process::exit(2)
}

#[derive(Debug)]
struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	match parse_args_from(std::env::args().skip(1)) {
		Ok(Some(args)) => args,
		Ok(None) => usage_and_exit(),
		Err(e) => {
			eprintln!("{e}");
			usage_and_exit()
		}
	}
}

/// `Ok(None)` means `--help` was requested.
fn parse_args_from(argv: impl IntoIterator<Item = String>) -> Result<Option<Args>, String> {
	let mut args = Args { bind: None, config: None };

	let mut it = argv.into_iter();
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => return Ok(None),
			"--bind" | "--listen" => {
				let v = it.next().ok_or_else(|| format!("{arg} requires a value"))?;
				validate_http_endpoint(&v).map_err(|e| format!("--bind: {e}"))?;
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().ok_or_else(|| "--config requires a value".to_string())?;
				args.config = Some(PathBuf::from(v));
			}
			other => return Err(format!("Unknown argument: {other}")),
		}
	}

	Ok(Some(args))
}

fn resolve_bind_addr(endpoint: &str) -> SocketAddr {
	let bind = HttpEndpoint::parse(endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,qarooms_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("qarooms_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
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

async fn open_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn RoomStore>> {
	match database_url {
		Some(url) => {
			let store = SqlRoomStore::connect(url).await?;
			info!("room store: sql backend connected");
			Ok(Arc::new(store))
		}
		None => {
			warn!("room store: no database_url configured; using in-memory store");
			Ok(Arc::new(InMemoryRoomStore::new()))
		}
	}
}

fn spawn_ctrl_c_handler(shutdown: CancellationToken) {
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => info!("shutdown requested"),
			Err(e) => warn!(error = %e, "failed to listen for ctrl-c; shutting down"),
		}
		shutdown.cancel();
	});
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind = args
		.bind
		.or_else(|| server_cfg.server.http_bind.clone())
		.unwrap_or_else(|| crate::config::DEFAULT_HTTP_BIND.to_string());
	let bind_addr = resolve_bind_addr(&bind);

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: server_cfg.hub.subscriber_queue_capacity,
		debug_logs: server_cfg.hub.debug_logs,
	});

	let health_state = HealthState::new(hub.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store = open_store(server_cfg.persistence.database_url.as_deref()).await?;

	let shutdown = CancellationToken::new();
	spawn_ctrl_c_handler(shutdown.clone());

	let app = router(AppState {
		hub,
		store,
		shutdown: shutdown.clone(),
	});

	let listener = TcpListener::bind(bind_addr).await?;
	info!(bind = %listener.local_addr()?, "qarooms_server: http endpoint ready");
	health_state.mark_ready();

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown.cancelled_owned())
		.await?;

	info!("qarooms_server: stopped");
	Ok(())
}
