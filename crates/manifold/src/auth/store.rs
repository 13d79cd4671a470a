//! Single-slot token storage with proactive refresh scheduling.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;

use super::AuthError;

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

/// Tokens whose expiry lies within this buffer are reported expired, so
/// callers refresh before the token actually lapses.
pub const EXPIRY_BUFFER: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct TokenData {
	access_token: SecretString,
	token_type: String,
	expires_at: Instant,
	scope: Option<String>,
	refresh_token: Option<SecretString>,
}

impl std::fmt::Debug for TokenData {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TokenData")
			.field("token_type", &self.token_type)
			.field("expires_at", &self.expires_at)
			.field("scope", &self.scope)
			.field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
			.finish()
	}
}

impl TokenData {
	pub fn new(access_token: impl Into<String>, token_type: impl Into<String>, expires_at: Instant) -> Self {
		Self {
			access_token: SecretString::from(access_token.into()),
			token_type: token_type.into(),
			expires_at,
			scope: None,
			refresh_token: None,
		}
	}

	pub fn with_scope(mut self, scope: Option<String>) -> Self {
		self.scope = scope;
		self
	}

	pub fn with_refresh_token(mut self, refresh_token: Option<String>) -> Self {
		self.refresh_token = refresh_token.map(SecretString::from);
		self
	}

	pub fn access_token(&self) -> &str {
		self.access_token.expose_secret()
	}

	pub fn token_type(&self) -> &str {
		&self.token_type
	}

	pub fn expires_at(&self) -> Instant {
		self.expires_at
	}

	pub fn scope(&self) -> Option<&str> {
		self.scope.as_deref()
	}

	pub fn refresh_token(&self) -> Option<&str> {
		self.refresh_token.as_ref().map(|t| t.expose_secret())
	}
}

type RefreshFn = Arc<dyn Fn() -> futures::future::BoxFuture<'static, Result<(), AuthError>> + Send + Sync>;

struct Inner {
	token: Option<TokenData>,
	refresh: Option<RefreshFn>,
	timer: Option<tokio::task::JoinHandle<()>>,
}

/// Holds at most one token. All operations serialize on an internal lock;
/// a concurrent `store`/`retrieve` pair observes either the pre- or the
/// post-store token, never a torn value.
pub struct TokenStore {
	buffer: Duration,
	inner: Arc<parking_lot::Mutex<Inner>>,
}

impl std::fmt::Debug for TokenStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TokenStore").field("buffer", &self.buffer).finish()
	}
}

impl Default for TokenStore {
	fn default() -> Self {
		Self::new(EXPIRY_BUFFER)
	}
}

impl TokenStore {
	pub fn new(buffer: Duration) -> Self {
		Self {
			buffer,
			inner: Arc::new(parking_lot::Mutex::new(Inner {
				token: None,
				refresh: None,
				timer: None,
			})),
		}
	}

	/// Replaces any existing token. Trims whitespace and rejects empty
	/// access token or token type. Cancels any previously scheduled refresh
	/// timer; if a refresh callback is registered and the new token is not
	/// already expired, a single timer is scheduled at `expires_at - buffer`.
	pub fn store(&self, token: TokenData) -> Result<(), AuthError> {
		let access_token = token.access_token.expose_secret().trim().to_string();
		let token_type = token.token_type.trim().to_string();
		if access_token.is_empty() {
			return Err(AuthError::invalid_token("access token must be non-empty"));
		}
		if token_type.is_empty() {
			return Err(AuthError::invalid_token("token type must be non-empty"));
		}
		let token = TokenData {
			access_token: SecretString::from(access_token),
			token_type,
			..token
		};

		let mut inner = self.inner.lock();
		if let Some(timer) = inner.timer.take() {
			timer.abort();
		}
		if !self.token_expired(&token) {
			inner.timer = self.schedule_timer(&inner.refresh, token.expires_at);
		}
		inner.token = Some(token);
		Ok(())
	}

	pub fn retrieve(&self) -> Option<TokenData> {
		self.inner.lock().token.clone()
	}

	pub fn clear(&self) {
		let mut inner = self.inner.lock();
		if let Some(timer) = inner.timer.take() {
			timer.abort();
		}
		inner.token = None;
	}

	/// True when no token is held or the held token expires within the
	/// buffer window.
	pub fn is_expired(&self) -> bool {
		match &self.inner.lock().token {
			None => true,
			Some(t) => self.token_expired(t),
		}
	}

	/// Registers the proactive refresh callback. Failures of the callback
	/// are logged and swallowed. If a valid token is already held, its
	/// refresh timer is (re)scheduled.
	pub fn schedule_refresh(
		&self,
		refresh: impl Fn() -> futures::future::BoxFuture<'static, Result<(), AuthError>>
		+ Send
		+ Sync
		+ 'static,
	) {
		let mut inner = self.inner.lock();
		inner.refresh = Some(Arc::new(refresh));
		if let Some(timer) = inner.timer.take() {
			timer.abort();
		}
		if let Some(expires_at) = inner.token.as_ref().map(|t| t.expires_at)
			&& !self.is_instant_expired(expires_at)
		{
			inner.timer = self.schedule_timer(&inner.refresh, expires_at);
		}
	}

	fn token_expired(&self, token: &TokenData) -> bool {
		self.is_instant_expired(token.expires_at)
	}

	fn is_instant_expired(&self, expires_at: Instant) -> bool {
		Instant::now() + self.buffer >= expires_at
	}

	fn schedule_timer(
		&self,
		refresh: &Option<RefreshFn>,
		expires_at: Instant,
	) -> Option<tokio::task::JoinHandle<()>> {
		let refresh = refresh.as_ref()?.clone();
		let fire_at = expires_at
			.checked_sub(self.buffer)
			.unwrap_or_else(Instant::now);
		Some(tokio::spawn(async move {
			tokio::time::sleep_until(fire_at).await;
			if let Err(e) = refresh().await {
				tracing::warn!(error = %e, "scheduled token refresh failed");
			}
		}))
	}
}

impl Drop for TokenStore {
	fn drop(&mut self) {
		if let Some(timer) = self.inner.lock().timer.take() {
			timer.abort();
		}
	}
}
