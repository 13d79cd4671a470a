//! RFC 6749 token endpoint client and the client-credentials provider.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::time::Instant;

use super::store::{TokenData, TokenStore};
use super::{bearer_headers, AuthError, AuthProvider, OAuth2ErrorCode};

/// Applied when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(3600);

#[derive(Deserialize, Debug)]
pub(crate) struct TokenResponse {
	pub access_token: String,
	pub token_type: String,
	pub expires_in: Option<u64>,
	pub scope: Option<String>,
	pub refresh_token: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ErrorResponse {
	error: String,
	error_description: Option<String>,
}

impl TokenResponse {
	pub fn into_token(self) -> TokenData {
		let expires_in = self
			.expires_in
			.map(Duration::from_secs)
			.unwrap_or(DEFAULT_EXPIRES_IN);
		TokenData::new(self.access_token, self.token_type, Instant::now() + expires_in)
			.with_scope(self.scope)
			.with_refresh_token(self.refresh_token)
	}
}

/// Posts `application/x-www-form-urlencoded` grant requests and maps error
/// responses onto the OAuth2 error taxonomy.
#[derive(Clone)]
pub(crate) struct TokenClient {
	http: reqwest::Client,
	endpoint: url::Url,
}

impl std::fmt::Debug for TokenClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TokenClient").field("endpoint", &self.endpoint.as_str()).finish()
	}
}

impl TokenClient {
	pub fn new(http: reqwest::Client, endpoint: &str) -> Result<Self, AuthError> {
		let endpoint = url::Url::parse(endpoint)
			.map_err(|e| AuthError::new(OAuth2ErrorCode::InvalidRequest, format!("token endpoint: {e}")))?;
		Ok(Self { http, endpoint })
	}

	pub async fn post_form(&self, params: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
		let resp = self
			.http
			.post(self.endpoint.clone())
			.form(params)
			.send()
			.await
			.map_err(|e| AuthError::network(format!("token request failed: {e}")))?;

		let status = resp.status();
		let body = resp
			.bytes()
			.await
			.map_err(|e| AuthError::network(format!("token response read failed: {e}")))?;

		if status.is_success() {
			return serde_json::from_slice::<TokenResponse>(&body).map_err(|e| {
				AuthError::new(
					OAuth2ErrorCode::ServerError,
					format!("unparseable token response: {e}"),
				)
			});
		}

		Err(match serde_json::from_slice::<ErrorResponse>(&body) {
			Ok(err) => {
				let code = OAuth2ErrorCode::from_wire(&err.error, status.as_u16());
				let description = err.error_description.unwrap_or_else(|| err.error.clone());
				AuthError::new(code, description)
			},
			Err(_) => {
				// The body is not a token error document; synthesize one.
				let code = if status.is_client_error() {
					OAuth2ErrorCode::InvalidRequest
				} else {
					OAuth2ErrorCode::ServerError
				};
				let reason = status.canonical_reason().unwrap_or("");
				AuthError::new(code, format!("HTTP {}: {reason}", status.as_u16()))
			},
		})
	}
}

/// OAuth2 client-credentials provider. Concurrent `get_headers` calls
/// coalesce onto a single in-flight token request.
pub struct ClientCredentialsProvider {
	client_id: String,
	client_secret: SecretString,
	scope: Option<String>,
	audience: Option<String>,
	store: Arc<TokenStore>,
	client: TokenClient,
	inflight: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ClientCredentialsProvider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClientCredentialsProvider")
			.field("client_id", &self.client_id)
			.field("client", &self.client)
			.finish()
	}
}

impl ClientCredentialsProvider {
	pub fn new(
		client_id: String,
		client_secret: String,
		token_endpoint: &str,
		scope: Option<String>,
		audience: Option<String>,
		store: Arc<TokenStore>,
		http: reqwest::Client,
	) -> Result<Arc<Self>, AuthError> {
		let provider = Arc::new(Self {
			client_id,
			client_secret: SecretString::from(client_secret),
			scope,
			audience,
			store,
			client: TokenClient::new(http, token_endpoint)?,
			inflight: tokio::sync::Mutex::new(()),
		});
		// Proactive refresh keeps a weak handle so the store does not keep
		// its owner alive.
		let weak = Arc::downgrade(&provider);
		provider.store.schedule_refresh(move || {
			let weak = weak.clone();
			Box::pin(async move {
				match weak.upgrade() {
					Some(p) => p.refresh().await,
					None => Ok(()),
				}
			})
		});
		Ok(provider)
	}

	async fn fetch_token(&self) -> Result<(), AuthError> {
		let mut params = vec![
			("grant_type", "client_credentials"),
			("client_id", self.client_id.as_str()),
			("client_secret", self.client_secret.expose_secret()),
		];
		if let Some(scope) = &self.scope {
			params.push(("scope", scope.as_str()));
		}
		if let Some(audience) = &self.audience {
			params.push(("audience", audience.as_str()));
		}
		let resp = self.client.post_form(&params).await?;
		self.store.store(resp.into_token())
	}

	/// Fetches a token unless another caller already did while we waited on
	/// the in-flight lock.
	async fn ensure_token(&self) -> Result<(), AuthError> {
		if !self.store.is_expired() {
			return Ok(());
		}
		let _guard = self.inflight.lock().await;
		if !self.store.is_expired() {
			return Ok(());
		}
		self.fetch_token().await
	}
}

#[async_trait::async_trait]
impl AuthProvider for ClientCredentialsProvider {
	async fn get_headers(&self) -> Result<http::HeaderMap, AuthError> {
		self.ensure_token().await?;
		let token = self
			.store
			.retrieve()
			.ok_or_else(|| AuthError::new(OAuth2ErrorCode::ServerError, "token store empty after fetch"))?;
		bearer_headers(token.token_type(), token.access_token())
	}

	fn is_valid(&self) -> bool {
		!self.store.is_expired()
	}

	async fn refresh(&self) -> Result<(), AuthError> {
		let _guard = self.inflight.lock().await;
		self.fetch_token().await
	}
}
