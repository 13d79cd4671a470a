//! OAuth2 authorization-code flow with PKCE (RFC 7636, S256).
//!
//! A provider may have several flows pending at once, keyed by the `state`
//! parameter. Each state is single-use: it is removed on completion or when
//! the flow times out. The PKCE verifier/challenge pair is freshly generated
//! per flow.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine;
use rand::{Rng, RngExt};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use super::oauth2::TokenClient;
use super::store::TokenStore;
use super::{bearer_headers, AuthError, AuthProvider, OAuth2ErrorCode};

/// How long a pending flow waits for its callback before it is cancelled.
pub const FLOW_TIMEOUT: Duration = Duration::from_secs(300);

const STATE_LEN: usize = 32;
const VERIFIER_LEN: usize = 64;

#[derive(Clone, Debug)]
pub struct AuthCodeConfig {
	pub client_id: String,
	pub client_secret: Option<String>,
	pub authorization_endpoint: String,
	pub token_endpoint: String,
	pub redirect_uri: String,
	pub scope: Option<String>,
	pub audience: Option<String>,
}

/// A started flow: present `authorize_url` to the user, then complete with
/// the code delivered to the redirect URI.
#[derive(Clone, Debug)]
pub struct FlowHandle {
	pub state: String,
	pub authorize_url: url::Url,
}

struct PendingFlow {
	verifier: SecretString,
	waiters: Vec<oneshot::Sender<Result<(), AuthError>>>,
	timeout: tokio::task::JoinHandle<()>,
}

pub struct AuthCodeProvider {
	cfg: AuthCodeConfig,
	client_secret: Option<SecretString>,
	authorization_endpoint: url::Url,
	client: TokenClient,
	store: Arc<TokenStore>,
	flows: parking_lot::Mutex<HashMap<String, PendingFlow>>,
	registry: Option<Arc<FlowRegistry>>,
	// Coalesces concurrent interactive flows from get_headers.
	inflight: tokio::sync::Mutex<()>,
	flow_timeout: Duration,
	self_ref: parking_lot::Mutex<Weak<AuthCodeProvider>>,
}

impl std::fmt::Debug for AuthCodeProvider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AuthCodeProvider")
			.field("client_id", &self.cfg.client_id)
			.field("authorization_endpoint", &self.authorization_endpoint.as_str())
			.finish()
	}
}

impl AuthCodeProvider {
	pub fn new(
		cfg: AuthCodeConfig,
		store: Arc<TokenStore>,
		http: reqwest::Client,
		registry: Option<Arc<FlowRegistry>>,
	) -> Result<Arc<Self>, AuthError> {
		let authorization_endpoint = url::Url::parse(&cfg.authorization_endpoint).map_err(|e| {
			AuthError::new(
				OAuth2ErrorCode::InvalidRequest,
				format!("authorization endpoint: {e}"),
			)
		})?;
		let client = TokenClient::new(http, &cfg.token_endpoint)?;
		let client_secret = cfg.client_secret.clone().map(SecretString::from);
		let provider = Arc::new(Self {
			cfg,
			client_secret,
			authorization_endpoint,
			client,
			store,
			flows: parking_lot::Mutex::new(HashMap::new()),
			registry,
			inflight: tokio::sync::Mutex::new(()),
			flow_timeout: FLOW_TIMEOUT,
			self_ref: parking_lot::Mutex::new(Weak::new()),
		});
		*provider.self_ref.lock() = Arc::downgrade(&provider);
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

	/// Starts a new flow and returns the URL to present to the user.
	pub fn begin_flow(&self) -> FlowHandle {
		let state = random_token(STATE_LEN);
		let verifier = random_token(VERIFIER_LEN);
		let challenge =
			base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

		let mut url = self.authorization_endpoint.clone();
		{
			let mut q = url.query_pairs_mut();
			q.append_pair("response_type", "code");
			q.append_pair("client_id", &self.cfg.client_id);
			q.append_pair("redirect_uri", &self.cfg.redirect_uri);
			q.append_pair("state", &state);
			q.append_pair("code_challenge", &challenge);
			q.append_pair("code_challenge_method", "S256");
			if let Some(scope) = &self.cfg.scope {
				q.append_pair("scope", scope);
			}
			if let Some(audience) = &self.cfg.audience {
				q.append_pair("audience", audience);
			}
		}

		let timeout = self.spawn_timeout(state.clone());
		self.flows.lock().insert(
			state.clone(),
			PendingFlow {
				verifier: SecretString::from(verifier),
				waiters: Vec::new(),
				timeout,
			},
		);
		if let Some(registry) = &self.registry {
			registry.register(&state, self.self_ref.lock().clone());
		}
		tracing::info!(state = %state, url = %url, "authorization required; visit the authorize URL");
		FlowHandle {
			state,
			authorize_url: url,
		}
	}

	fn spawn_timeout(&self, state: String) -> tokio::task::JoinHandle<()> {
		let weak = self.self_ref.lock().clone();
		let registry = self.registry.clone();
		let timeout = self.flow_timeout;
		tokio::spawn(async move {
			tokio::time::sleep(timeout).await;
			let Some(provider) = weak.upgrade() else {
				return;
			};
			if let Some(flow) = provider.flows.lock().remove(&state) {
				tracing::debug!(state = %state, "authorization flow timed out");
				for waiter in flow.waiters {
					let _ = waiter.send(Err(AuthError::new(
						OAuth2ErrorCode::AccessDenied,
						"authorization flow timed out",
					)));
				}
			}
			if let Some(registry) = registry {
				registry.remove(&state);
			}
		})
	}

	/// Completes the flow identified by `state`, exchanging the code for a
	/// token. The state is deleted whether the exchange succeeds or fails.
	pub async fn complete_flow(&self, state: &str, code: &str) -> Result<(), AuthError> {
		let flow = self
			.flows
			.lock()
			.remove(state)
			.ok_or_else(AuthError::unknown_state)?;
		flow.timeout.abort();
		if let Some(registry) = &self.registry {
			registry.remove(state);
		}

		let result = self.exchange_code(code, flow.verifier.expose_secret()).await;
		for waiter in flow.waiters {
			let _ = waiter.send(result.clone());
		}
		result
	}

	async fn exchange_code(&self, code: &str, verifier: &str) -> Result<(), AuthError> {
		let mut params = vec![
			("grant_type", "authorization_code"),
			("code", code),
			("redirect_uri", self.cfg.redirect_uri.as_str()),
			("client_id", self.cfg.client_id.as_str()),
			("code_verifier", verifier),
		];
		if let Some(secret) = &self.client_secret {
			params.push(("client_secret", secret.expose_secret()));
		}
		let resp = self.client.post_form(&params).await?;
		self.store.store(resp.into_token())
	}

	async fn refresh_with_grant(&self, refresh_token: &str) -> Result<(), AuthError> {
		let mut params = vec![
			("grant_type", "refresh_token"),
			("refresh_token", refresh_token),
			("client_id", self.cfg.client_id.as_str()),
		];
		if let Some(secret) = &self.client_secret {
			params.push(("client_secret", secret.expose_secret()));
		}
		let resp = self.client.post_form(&params).await?;
		self.store.store(resp.into_token())
	}

	/// Waits for the flow identified by `state` to complete.
	pub async fn await_flow(&self, state: &str) -> Result<(), AuthError> {
		let rx = {
			let mut flows = self.flows.lock();
			let Some(flow) = flows.get_mut(state) else {
				return Err(AuthError::unknown_state());
			};
			let (tx, rx) = oneshot::channel();
			flow.waiters.push(tx);
			rx
		};
		rx.await.unwrap_or_else(|_| {
			Err(AuthError::new(
				OAuth2ErrorCode::AccessDenied,
				"authorization flow cancelled",
			))
		})
	}

	/// Runs one interactive flow to completion: publish the URL and wait for
	/// the callback.
	async fn interactive(&self) -> Result<(), AuthError> {
		let handle = self.begin_flow();
		self.await_flow(&handle.state).await
	}
}

#[async_trait::async_trait]
impl AuthProvider for AuthCodeProvider {
	async fn get_headers(&self) -> Result<http::HeaderMap, AuthError> {
		if self.store.is_expired() {
			let _guard = self.inflight.lock().await;
			if self.store.is_expired() {
				let refresh_token = self.store.retrieve().and_then(|t| t.refresh_token().map(str::to_string));
				match refresh_token {
					Some(rt) => self.refresh_with_grant(&rt).await?,
					None => self.interactive().await?,
				}
			}
		}
		let token = self
			.store
			.retrieve()
			.ok_or_else(|| AuthError::new(OAuth2ErrorCode::AccessDenied, "no token after authorization"))?;
		bearer_headers(token.token_type(), token.access_token())
	}

	fn is_valid(&self) -> bool {
		!self.store.is_expired()
	}

	async fn refresh(&self) -> Result<(), AuthError> {
		let _guard = self.inflight.lock().await;
		let refresh_token = self.store.retrieve().and_then(|t| t.refresh_token().map(str::to_string));
		match refresh_token {
			Some(rt) => self.refresh_with_grant(&rt).await,
			None => Err(AuthError::new(
				OAuth2ErrorCode::AccessDenied,
				"no refresh token; interactive authorization required",
			)),
		}
	}

	async fn finish_auth(&self, code: &str) -> Result<(), AuthError> {
		// Complete the most recently started flow when exactly one is
		// pending; otherwise the caller must go through the state-keyed
		// callback.
		let state = {
			let flows = self.flows.lock();
			let mut states = flows.keys();
			match (states.next(), states.next()) {
				(Some(s), None) => s.clone(),
				_ => return Err(AuthError::unknown_state()),
			}
		};
		self.complete_flow(&state, code).await
	}
}

/// Process-scoped lookup from pending `state` values to their providers,
/// used by the HTTP callback endpoint. Created at startup and threaded
/// through the server context.
#[derive(Default)]
pub struct FlowRegistry {
	states: parking_lot::Mutex<HashMap<String, Weak<AuthCodeProvider>>>,
}

impl std::fmt::Debug for FlowRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FlowRegistry")
			.field("pending", &self.states.lock().len())
			.finish()
	}
}

impl FlowRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	fn register(&self, state: &str, provider: Weak<AuthCodeProvider>) {
		self.states.lock().insert(state.to_string(), provider);
	}

	fn remove(&self, state: &str) {
		self.states.lock().remove(state);
	}

	/// Routes a callback to the provider that started the flow.
	pub async fn complete(&self, state: &str, code: &str) -> Result<(), AuthError> {
		let provider = self
			.states
			.lock()
			.remove(state)
			.and_then(|w| w.upgrade())
			.ok_or_else(AuthError::unknown_state)?;
		provider.complete_flow(state, code).await
	}
}

fn random_token(len: usize) -> String {
	rand::rng()
		.sample_iter(&rand::distr::Alphanumeric)
		.take(len)
		.map(char::from)
		.collect()
}
