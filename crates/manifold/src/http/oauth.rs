//! Authorization-server route surface.
//!
//! Token issuing itself is out of scope; these routes exist so the surface
//! is stable, backed by a pluggable [`AuthServerStore`]. The callback
//! route is fully functional: it completes pending authorization-code
//! flows started by upstream auth providers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::Deserialize;

use super::AppState;

/// Storage behind the authorization-server routes.
#[async_trait::async_trait]
pub trait AuthServerStore: Send + Sync + std::fmt::Debug {
	async fn record_consent(&self, client_id: &str, scope: Option<&str>) -> anyhow::Result<()>;

	async fn revoke_consent(&self, client_id: &str) -> anyhow::Result<()>;

	/// Returns the new secret.
	async fn rotate_client_secret(&self, client_id: &str) -> anyhow::Result<String>;
}

/// In-memory store; real deployments plug their own.
#[derive(Debug, Default)]
pub struct MemoryAuthServerStore {
	consents: parking_lot::Mutex<HashMap<String, Option<String>>>,
	secrets: parking_lot::Mutex<HashMap<String, String>>,
}

impl MemoryAuthServerStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}
}

#[async_trait::async_trait]
impl AuthServerStore for MemoryAuthServerStore {
	async fn record_consent(&self, client_id: &str, scope: Option<&str>) -> anyhow::Result<()> {
		self
			.consents
			.lock()
			.insert(client_id.to_string(), scope.map(str::to_string));
		Ok(())
	}

	async fn revoke_consent(&self, client_id: &str) -> anyhow::Result<()> {
		self.consents.lock().remove(client_id);
		Ok(())
	}

	async fn rotate_client_secret(&self, client_id: &str) -> anyhow::Result<String> {
		let secret = uuid::Uuid::new_v4().to_string();
		self
			.secrets
			.lock()
			.insert(client_id.to_string(), secret.clone());
		Ok(secret)
	}
}

pub async fn authorize() -> Response {
	(
		StatusCode::NOT_IMPLEMENTED,
		"authorization issuing is not enabled on this proxy",
	)
		.into_response()
}

pub async fn token() -> Response {
	(
		StatusCode::NOT_IMPLEMENTED,
		"token issuing is not enabled on this proxy",
	)
		.into_response()
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRequest {
	pub client_id: String,
	pub scope: Option<String>,
}

pub async fn consent(
	State(state): State<AppState>,
	Json(req): Json<ConsentRequest>,
) -> Result<StatusCode, Response> {
	state
		.oauth
		.record_consent(&req.client_id, req.scope.as_deref())
		.await
		.map_err(internal)?;
	Ok(StatusCode::NO_CONTENT)
}

pub async fn consent_revoke(
	State(state): State<AppState>,
	Json(req): Json<ConsentRequest>,
) -> Result<StatusCode, Response> {
	state
		.oauth
		.revoke_consent(&req.client_id)
		.await
		.map_err(internal)?;
	Ok(StatusCode::NO_CONTENT)
}

pub async fn rotate_secret(
	State(state): State<AppState>,
	Path(client_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
	let secret = state
		.oauth
		.rotate_client_secret(&client_id)
		.await
		.map_err(internal)?;
	Ok(Json(serde_json::json!({ "clientSecret": secret })))
}

#[derive(Deserialize, Debug)]
pub struct CallbackQuery {
	pub state: Option<String>,
	pub code: Option<String>,
	pub error: Option<String>,
	pub error_description: Option<String>,
}

/// Redirect target for authorization-code flows started by upstream auth
/// providers.
pub async fn callback(
	State(state): State<AppState>,
	Query(query): Query<CallbackQuery>,
) -> Response {
	if let Some(error) = query.error {
		let description = query.error_description.unwrap_or_default();
		tracing::warn!(error = %error, description = %description, "authorization callback returned an error");
		return (
			StatusCode::BAD_REQUEST,
			Html(format!("<h1>Authorization failed</h1><p>{error}</p>")),
		)
			.into_response();
	}
	let (Some(flow_state), Some(code)) = (query.state, query.code) else {
		return (
			StatusCode::BAD_REQUEST,
			Html("<h1>Authorization failed</h1><p>missing state or code</p>".to_string()),
		)
			.into_response();
	};
	match state.proxy.flows().complete(&flow_state, &code).await {
		Ok(()) => Html(
			"<h1>Authorization complete</h1><p>You can close this window.</p>".to_string(),
		)
		.into_response(),
		Err(e) => {
			tracing::warn!(error = %e, "failed to complete authorization flow");
			(
				StatusCode::BAD_REQUEST,
				Html(format!("<h1>Authorization failed</h1><p>{e}</p>")),
			)
				.into_response()
		},
	}
}

fn internal(e: anyhow::Error) -> Response {
	tracing::warn!(error = %e, "authorization store failure");
	StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
