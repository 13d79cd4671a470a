//! The proxy's own HTTP/WS surface.

pub mod authgate;
pub mod oauth;
pub mod streamable;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use thiserror::Error;

use crate::proxy::Proxy;
use authgate::AuthGate;
use oauth::AuthServerStore;
use streamable::SessionManager;

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;

#[derive(Error, Debug)]
pub enum Error {
	#[error("client must accept both application/json and text/event-stream")]
	InvalidAccept,
	#[error("client must send application/json")]
	InvalidContentType,
	#[error("fail to deserialize request body: {0}")]
	Deserialize(String),
	#[error("session not found")]
	UnknownSession,
	#[error("session header is required for non-initialize requests")]
	MissingSessionHeader,
	#[error("session ID is required")]
	SessionIdRequired,
	#[error("{0}")]
	Internal(String),
}

impl IntoResponse for Error {
	fn into_response(self) -> Response {
		let status = match &self {
			Error::InvalidAccept | Error::InvalidContentType => StatusCode::NOT_ACCEPTABLE,
			Error::Deserialize(_) | Error::MissingSessionHeader | Error::SessionIdRequired => {
				StatusCode::BAD_REQUEST
			},
			Error::UnknownSession => StatusCode::NOT_FOUND,
			Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		(status, self.to_string()).into_response()
	}
}

#[derive(Clone)]
pub struct AppState {
	pub proxy: Arc<Proxy>,
	pub sessions: Arc<SessionManager>,
	pub gate: Arc<AuthGate>,
	pub oauth: Arc<dyn AuthServerStore>,
}

pub fn build_router(state: AppState) -> Router {
	Router::new()
		.route("/api/health", get(health))
		.route("/api/streamable/health", get(health))
		.route(
			"/api/streamable/mcp",
			post(streamable::post)
				.get(streamable::get_stream)
				.delete(streamable::delete),
		)
		.route("/ws", get(ws::upgrade))
		.route("/api/oauth/authorize", get(oauth::authorize))
		.route("/api/oauth/token", post(oauth::token))
		.route("/api/oauth/consent", post(oauth::consent))
		.route("/api/oauth/consent/revoke", post(oauth::consent_revoke))
		.route(
			"/api/oauth/client/{client_id}/rotate-secret",
			post(oauth::rotate_secret),
		)
		.route("/api/oauth/callback", get(oauth::callback))
		.layer(middleware::from_fn_with_state(state.clone(), enforce_auth))
		.with_state(state)
}

async fn health() -> Json<serde_json::Value> {
	Json(serde_json::json!({ "status": "ok" }))
}

async fn enforce_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
	if let Err(rejection) = state.gate.check(request.uri().path(), request.headers()) {
		return rejection;
	}
	next.run(request).await
}

/// Serves the router until `shutdown` resolves.
pub async fn serve(
	addr: SocketAddr,
	state: AppState,
	shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
	let router = build_router(state);
	let listener = tokio::net::TcpListener::bind(addr).await?;
	tracing::info!(addr = %addr, "listening");
	axum::serve(listener, router)
		.with_graceful_shutdown(shutdown)
		.await?;
	Ok(())
}
