//! Inbound bearer enforcement on the proxy's own HTTP/WS surface.

use axum::response::{IntoResponse, Response};
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderMap, StatusCode};
use secrecy::{ExposeSecret, SecretString};

use crate::config::InboundAuth;

#[cfg(test)]
#[path = "authgate_tests.rs"]
mod tests;

const REALM: &str = "Bearer realm=\"MCP Proxy API\"";
const INVALID_FORMAT: &str = "Invalid Authorization header format. Expected: Bearer <token>";

/// Paths served without authentication. Everything else on the surface,
/// including the streamable endpoint and the websocket upgrade, is
/// protected. The trailing-slash entry covers the consent sub-routes
/// (`/api/oauth/consent/revoke`).
const UNPROTECTED_PATHS: &[&str] = &[
	"/api/health",
	"/api/oauth/callback",
	"/api/oauth/consent",
	"/api/oauth/consent/",
];

pub struct AuthGate {
	mode: Mode,
}

enum Mode {
	Allow,
	Bearer(Vec<SecretString>),
}

impl std::fmt::Debug for AuthGate {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let mode = match &self.mode {
			Mode::Allow => "allow",
			Mode::Bearer(_) => "bearer",
		};
		f.debug_struct("AuthGate").field("mode", &mode).finish()
	}
}

impl AuthGate {
	pub fn new(inbound: &InboundAuth) -> Self {
		let mode = match inbound {
			InboundAuth::None => Mode::Allow,
			InboundAuth::Bearer(tokens) => Mode::Bearer(tokens.clone()),
		};
		Self { mode }
	}

	pub fn is_unprotected(path: &str) -> bool {
		UNPROTECTED_PATHS
			.iter()
			.any(|p| path == *p || (p.ends_with('/') && path.starts_with(p)))
	}

	/// Checks one request. `Err` carries the 401 response to return.
	pub fn check(&self, path: &str, headers: &HeaderMap) -> Result<(), Response> {
		let Mode::Bearer(tokens) = &self.mode else {
			return Ok(());
		};
		if Self::is_unprotected(path) {
			return Ok(());
		}

		let Some(value) = headers.get(AUTHORIZATION) else {
			return Err(reject("Missing Authorization header"));
		};
		let Ok(value) = value.to_str() else {
			return Err(reject(INVALID_FORMAT));
		};
		let Some(rest) = value.strip_prefix("Bearer") else {
			return Err(reject(INVALID_FORMAT));
		};
		if !rest.starts_with(char::is_whitespace) {
			return Err(reject(INVALID_FORMAT));
		}
		let token = rest.trim();
		if token.is_empty() {
			return Err(reject(INVALID_FORMAT));
		}
		if tokens.iter().any(|t| t.expose_secret() == token) {
			Ok(())
		} else {
			Err(reject("Invalid token"))
		}
	}
}

fn reject(message: &str) -> Response {
	(
		StatusCode::UNAUTHORIZED,
		[(WWW_AUTHENTICATE, REALM)],
		message.to_string(),
	)
		.into_response()
}
