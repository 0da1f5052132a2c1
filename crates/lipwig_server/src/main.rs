#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use lipwig_server::config::{self, DEFAULT_BIND, ServerConfig, TlsSource};
use lipwig_server::server::health::{HealthState, spawn_health_server};
use lipwig_server::tls::{build_dev_server_config, build_server_config};
use lipwig_server::{Server, ServerOptions};
use lipwig_util::BindEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: lipwig_server [--bind tcp://host:port | tls://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: {DEFAULT_BIND})\n\
\t          Overrides the config file and LIPWIG_BIND\n\
\t--config   Config file (default: ~/.lipwig/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct Args {
	bind: Option<BindEndpoint>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let endpoint = BindEndpoint::parse(&v).unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit();
				});
				args.bind = Some(endpoint);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,lipwig_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("lipwig_server");
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

async fn resolve_bind(endpoint: &BindEndpoint) -> anyhow::Result<SocketAddr> {
	if let Ok(addr) = endpoint.to_socket_addr_if_ip_literal() {
		return Ok(addr);
	}

	tokio::net::lookup_host(endpoint.hostport())
		.await
		.with_context(|| format!("resolve {endpoint}"))?
		.next()
		.ok_or_else(|| anyhow!("{endpoint} resolved to no addresses"))
}

fn tls_config(cfg: &ServerConfig) -> anyhow::Result<Arc<rustls::ServerConfig>> {
	let client_ca = cfg.server.tls_client_ca_path.as_deref();

	match cfg.tls_source()? {
		TlsSource::Files { cert, key } => {
			info!(cert = %cert.display(), key = %key.display(), "loading TLS cert/key");
			build_server_config(cert, key, client_ca)
		}
		TlsSource::SelfSigned => {
			let (config, cert_der) = build_dev_server_config(client_ca)?;
			warn!(
				cert_der_len = cert_der.len(),
				"tls_self_signed enabled; using a generated self-signed certificate (dev only)"
			);
			Ok(config)
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone()).await?;
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let endpoint = match args.bind {
		Some(endpoint) => endpoint,
		None => server_cfg.bind_endpoint()?,
	};
	let bind_addr = resolve_bind(&endpoint).await?;

	let mut opts = ServerOptions::new(bind_addr, server_cfg.authenticators()?);
	opts.settings = server_cfg.session.connection_settings();
	if endpoint.is_tls() {
		opts.tls = Some(tls_config(&server_cfg)?);
	} else if server_cfg.server.tls_cert_path.is_some() {
		warn!(%endpoint, "TLS cert configured but bind endpoint is plain tcp; ignoring");
	}

	info!(auth = ?opts.authenticators, "auth schemes configured");

	let server = Server::bind(opts).await?;
	info!(%endpoint, local_addr = %server.local_addr(), "lipwig_server: ready");
	health_state.mark_ready();

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutdown requested");

	health_state.mark_not_ready();
	server.stop().await;

	Ok(())
}
