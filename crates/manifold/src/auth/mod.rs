//! Outbound authentication for upstream servers.
//!
//! An [`AuthProvider`] produces `Authorization` headers and can refresh
//! itself. Four variants exist: none, static bearer, OAuth2
//! client-credentials, and OAuth2 authorization-code with PKCE. OAuth2
//! providers own a [`store::TokenStore`] (1:1) holding the current token.

pub mod flow;
pub mod oauth2;
pub mod store;

use std::sync::Arc;

use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::config::AuthProviderConfig;
use store::TokenStore;

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;

/// OAuth2 error taxonomy. Wire values from RFC 6749 plus the local
/// `network_error`/`unknown_error` codes for failures that never produced a
/// server error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuth2ErrorCode {
	InvalidRequest,
	InvalidClient,
	InvalidGrant,
	UnauthorizedClient,
	UnsupportedGrantType,
	InvalidScope,
	AccessDenied,
	UnsupportedResponseType,
	ServerError,
	TemporarilyUnavailable,
	NetworkError,
	UnknownError,
}

impl OAuth2ErrorCode {
	pub fn from_wire(code: &str, http_status: u16) -> Self {
		match code {
			"invalid_request" => OAuth2ErrorCode::InvalidRequest,
			"invalid_client" => OAuth2ErrorCode::InvalidClient,
			"invalid_grant" => OAuth2ErrorCode::InvalidGrant,
			"unauthorized_client" => OAuth2ErrorCode::UnauthorizedClient,
			"unsupported_grant_type" => OAuth2ErrorCode::UnsupportedGrantType,
			"invalid_scope" => OAuth2ErrorCode::InvalidScope,
			"access_denied" => OAuth2ErrorCode::AccessDenied,
			"unsupported_response_type" => OAuth2ErrorCode::UnsupportedResponseType,
			"server_error" => OAuth2ErrorCode::ServerError,
			"temporarily_unavailable" => OAuth2ErrorCode::TemporarilyUnavailable,
			_ if http_status >= 500 => OAuth2ErrorCode::ServerError,
			_ => OAuth2ErrorCode::UnknownError,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			OAuth2ErrorCode::InvalidRequest => "invalid_request",
			OAuth2ErrorCode::InvalidClient => "invalid_client",
			OAuth2ErrorCode::InvalidGrant => "invalid_grant",
			OAuth2ErrorCode::UnauthorizedClient => "unauthorized_client",
			OAuth2ErrorCode::UnsupportedGrantType => "unsupported_grant_type",
			OAuth2ErrorCode::InvalidScope => "invalid_scope",
			OAuth2ErrorCode::AccessDenied => "access_denied",
			OAuth2ErrorCode::UnsupportedResponseType => "unsupported_response_type",
			OAuth2ErrorCode::ServerError => "server_error",
			OAuth2ErrorCode::TemporarilyUnavailable => "temporarily_unavailable",
			OAuth2ErrorCode::NetworkError => "network_error",
			OAuth2ErrorCode::UnknownError => "unknown_error",
		}
	}

	pub fn retryable(&self) -> bool {
		matches!(
			self,
			OAuth2ErrorCode::NetworkError
				| OAuth2ErrorCode::ServerError
				| OAuth2ErrorCode::TemporarilyUnavailable
		)
	}
}

impl std::fmt::Display for OAuth2ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// An authentication failure. The description never contains secret
/// material (tokens, client secrets, PKCE verifiers).
#[derive(Error, Debug, Clone)]
#[error("{code}: {description}")]
pub struct AuthError {
	pub code: OAuth2ErrorCode,
	pub retryable: bool,
	description: String,
}

impl AuthError {
	pub fn new(code: OAuth2ErrorCode, description: impl Into<String>) -> Self {
		Self {
			code,
			retryable: code.retryable(),
			description: description.into(),
		}
	}

	pub fn network(description: impl Into<String>) -> Self {
		Self::new(OAuth2ErrorCode::NetworkError, description)
	}

	pub fn invalid_token(description: impl Into<String>) -> Self {
		Self::new(OAuth2ErrorCode::InvalidRequest, description)
	}

	pub fn unknown_state() -> Self {
		Self::new(OAuth2ErrorCode::InvalidGrant, "unknown or expired OAuth state")
	}
}

#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync + std::fmt::Debug {
	/// Returns the headers to attach to an upstream request, refreshing the
	/// backing token if necessary.
	async fn get_headers(&self) -> Result<HeaderMap, AuthError>;

	/// True when a usable credential is currently held.
	fn is_valid(&self) -> bool;

	/// Forces a credential refresh.
	async fn refresh(&self) -> Result<(), AuthError>;

	/// Completes a pending authorization-code flow with the received code.
	/// Only meaningful for the authorization-code provider.
	async fn finish_auth(&self, _code: &str) -> Result<(), AuthError> {
		Err(AuthError::new(
			OAuth2ErrorCode::UnsupportedGrantType,
			"this auth provider has no authorization flow to complete",
		))
	}
}

#[derive(Debug, Default)]
pub struct NoneProvider;

#[async_trait::async_trait]
impl AuthProvider for NoneProvider {
	async fn get_headers(&self) -> Result<HeaderMap, AuthError> {
		Ok(HeaderMap::new())
	}

	fn is_valid(&self) -> bool {
		true
	}

	async fn refresh(&self) -> Result<(), AuthError> {
		Ok(())
	}
}

pub struct BearerProvider {
	token: SecretString,
}

impl std::fmt::Debug for BearerProvider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BearerProvider").finish()
	}
}

impl BearerProvider {
	pub fn new(token: impl Into<String>) -> Self {
		Self {
			token: SecretString::from(token.into()),
		}
	}
}

#[async_trait::async_trait]
impl AuthProvider for BearerProvider {
	async fn get_headers(&self) -> Result<HeaderMap, AuthError> {
		bearer_headers("Bearer", self.token.expose_secret())
	}

	fn is_valid(&self) -> bool {
		true
	}

	async fn refresh(&self) -> Result<(), AuthError> {
		Ok(())
	}
}

/// Builds an `Authorization` header map and marks the value sensitive so it
/// never shows up in logs.
pub(crate) fn bearer_headers(token_type: &str, token: &str) -> Result<HeaderMap, AuthError> {
	let mut headers = HeaderMap::new();
	let mut value = HeaderValue::from_str(&format!("{token_type} {token}"))
		.map_err(|_| AuthError::invalid_token("token is not a valid header value"))?;
	value.set_sensitive(true);
	headers.insert(AUTHORIZATION, value);
	Ok(headers)
}

/// Constructs a provider from config. OAuth2 variants exclusively own the
/// passed token store.
pub fn build(
	cfg: &AuthProviderConfig,
	store: Arc<TokenStore>,
	http: reqwest::Client,
	flows: Option<Arc<flow::FlowRegistry>>,
) -> Result<Arc<dyn AuthProvider>, AuthError> {
	Ok(match cfg {
		AuthProviderConfig::None {} => Arc::new(NoneProvider),
		AuthProviderConfig::Bearer { token } => Arc::new(BearerProvider::new(token.clone())),
		AuthProviderConfig::Oauth2Client {
			client_id,
			client_secret,
			token_endpoint,
			scope,
			audience,
		} => oauth2::ClientCredentialsProvider::new(
			client_id.clone(),
			client_secret.clone(),
			token_endpoint,
			scope.clone(),
			audience.clone(),
			store,
			http,
		)?,
		AuthProviderConfig::Oauth2Code {
			client_id,
			client_secret,
			authorization_endpoint,
			token_endpoint,
			redirect_uri,
			scope,
			audience,
		} => flow::AuthCodeProvider::new(
			flow::AuthCodeConfig {
				client_id: client_id.clone(),
				client_secret: client_secret.clone(),
				authorization_endpoint: authorization_endpoint.clone(),
				token_endpoint: token_endpoint.clone(),
				redirect_uri: redirect_uri.clone(),
				scope: scope.clone(),
				audience: audience.clone(),
			},
			store,
			http,
			flows,
		)?,
	})
}
