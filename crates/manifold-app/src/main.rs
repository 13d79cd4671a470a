use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use manifold::commands::{CommandRegistry, StatusCommand};
use manifold::config::{ConfigError, RawInboundAuth, RawProxyConfig};
use manifold::http::authgate::AuthGate;
use manifold::http::oauth::MemoryAuthServerStore;
use manifold::http::streamable::SessionManager;
use manifold::http::AppState;
use manifold::proxy::Proxy;

const EXIT_GENERIC: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_INBOUND_AUTH: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "manifold", about = "MCP multiplexing proxy", version)]
struct Args {
	/// Path to the JSON configuration file.
	#[arg(long)]
	config: Option<PathBuf>,

	#[arg(long, default_value_t = 3100)]
	port: u16,

	#[arg(long, default_value = "127.0.0.1")]
	host: String,

	/// Require this bearer token on inbound requests. Repeatable.
	#[arg(long = "inbound-auth-token")]
	inbound_auth_token: Vec<String>,
}

fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();

	let args = Args::parse();
	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(rt) => rt,
		Err(e) => {
			eprintln!("failed to start runtime: {e}");
			return ExitCode::from(EXIT_GENERIC);
		},
	};
	match runtime.block_on(run(args)) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!("{e:#}");
			ExitCode::from(exit_code_for(&e))
		},
	}
}

fn exit_code_for(e: &anyhow::Error) -> u8 {
	match e.downcast_ref::<ConfigError>() {
		Some(ConfigError::InboundAuth(_)) => EXIT_INBOUND_AUTH,
		Some(_) => EXIT_CONFIG,
		None => EXIT_GENERIC,
	}
}

async fn run(args: Args) -> anyhow::Result<()> {
	let mut raw = match &args.config {
		Some(path) => RawProxyConfig::from_file(path).await?,
		None => RawProxyConfig::default(),
	};

	// CLI tokens extend (or establish) bearer inbound auth.
	if !args.inbound_auth_token.is_empty() {
		raw.inbound_auth = Some(match raw.inbound_auth.take() {
			Some(RawInboundAuth::Bearer { mut tokens }) => {
				tokens.extend(args.inbound_auth_token.clone());
				RawInboundAuth::Bearer { tokens }
			},
			_ => RawInboundAuth::Bearer {
				tokens: args.inbound_auth_token.clone(),
			},
		});
	}

	let config = raw.validate()?;
	let gate = Arc::new(AuthGate::new(&config.inbound_auth));

	let mut registry = CommandRegistry::new();
	registry.register(Arc::new(StatusCommand));

	let proxy = Proxy::new(config, registry);
	proxy.connect_all().await;

	let addr = resolve_addr(&args.host, args.port)?;
	let state = AppState {
		proxy: proxy.clone(),
		sessions: SessionManager::new(),
		gate,
		oauth: MemoryAuthServerStore::new(),
	};

	let shutdown_proxy = proxy.clone();
	manifold::http::serve(addr, state, shutdown_signal()).await?;

	shutdown_proxy.shutdown().await;
	Ok(())
}

fn resolve_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
	(host, port)
		.to_socket_addrs()?
		.next()
		.ok_or_else(|| anyhow::anyhow!("could not resolve {host}:{port}"))
}

async fn shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			},
			Err(_) => std::future::pending::<()>().await,
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
	tracing::info!("shutdown signal received");
}
