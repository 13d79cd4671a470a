//! Transport construction: config validation, instantiation, memoization,
//! and the upgrade wrapper that swaps transports in place.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::ClientJsonRpcMessage;
use thiserror::Error;
use tokio::sync::mpsc;

use super::sse::SseTransport;
use super::stdio::StdioTransport;
use super::streamablehttp::StreamableHttpTransport;
use super::websocket::WebsocketTransport;
use super::{
	ConnectionState, ReconnectPolicy, Transport, TransportError, TransportEvent, DEFAULT_TIMEOUT,
	EVENT_CHANNEL_CAPACITY,
};
use crate::auth::store::TokenStore;
use crate::auth::{AuthProvider, NoneProvider};
use crate::config::{ReconnectConfig, TransportConfig, TransportKind};
use crate::Strng;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct InvalidConfig(String);

impl InvalidConfig {
	fn new(msg: impl Into<String>) -> Self {
		Self(msg.into())
	}
}

/// Rejects invalid transport configs at construction time.
pub fn validate(cfg: &TransportConfig) -> Result<(), InvalidConfig> {
	match cfg {
		TransportConfig::Stdio { command, .. } => {
			if command.trim().is_empty() {
				return Err(InvalidConfig::new("stdio transport requires a command"));
			}
		},
		TransportConfig::Sse {
			url,
			timeout_ms,
			reconnect,
		} => {
			url::Url::parse(url).map_err(|e| InvalidConfig::new(format!("invalid sse url: {e}")))?;
			validate_timeout(timeout_ms)?;
			validate_reconnect(reconnect)?;
		},
		TransportConfig::Websocket {
			url,
			timeout_ms,
			reconnect,
		} => {
			websocket_url(url)?;
			validate_timeout(timeout_ms)?;
			validate_reconnect(reconnect)?;
		},
		TransportConfig::StreamableHttp {
			url,
			timeout_ms,
			reconnect,
			..
		} => {
			let parsed = url::Url::parse(url)
				.map_err(|e| InvalidConfig::new(format!("invalid streamable-http url: {e}")))?;
			if !matches!(parsed.scheme(), "http" | "https") {
				return Err(InvalidConfig::new(format!(
					"streamable-http url must be http or https, got {}",
					parsed.scheme()
				)));
			}
			validate_timeout(timeout_ms)?;
			validate_reconnect(reconnect)?;
		},
	}
	Ok(())
}

fn validate_timeout(timeout_ms: &Option<u64>) -> Result<(), InvalidConfig> {
	if let Some(t) = timeout_ms
		&& *t == 0
	{
		return Err(InvalidConfig::new("timeout must be strictly positive"));
	}
	Ok(())
}

fn validate_reconnect(reconnect: &Option<ReconnectConfig>) -> Result<(), InvalidConfig> {
	let Some(r) = reconnect else {
		return Ok(());
	};
	if let Some(m) = r.backoff_multiplier {
		if !m.is_finite() || m <= 1.0 {
			return Err(InvalidConfig::new(
				"backoffMultiplier must be a finite number greater than 1",
			));
		}
	}
	// maxAttempts / initialDelayMs / maxDelayMs are unsigned by type; any
	// value present is a valid non-negative finite number.
	Ok(())
}

/// Coerces a websocket URL: http(s) is rewritten to ws(s); only ws, wss,
/// http, and https schemes are accepted.
pub fn websocket_url(raw: &str) -> Result<url::Url, InvalidConfig> {
	let mut parsed =
		url::Url::parse(raw).map_err(|e| InvalidConfig::new(format!("invalid websocket url: {e}")))?;
	let scheme = match parsed.scheme() {
		"ws" | "wss" => return Ok(parsed),
		"http" => "ws",
		"https" => "wss",
		other => {
			return Err(InvalidConfig::new(format!(
				"websocket url must be ws, wss, http, or https, got {other}"
			)));
		},
	};
	parsed
		.set_scheme(scheme)
		.map_err(|_| InvalidConfig::new("failed to rewrite websocket scheme"))?;
	Ok(parsed)
}

fn timeout_of(timeout_ms: &Option<u64>) -> Duration {
	timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT)
}

#[derive(Hash, PartialEq, Eq, Clone, Copy, Debug)]
struct CacheKey {
	config: u64,
	auth: usize,
	store: usize,
}

/// Builds transports and memoizes them by (config hash, auth provider
/// instance, token store instance). The same config with the same provider
/// and store instances yields the same transport; a different provider
/// instance yields a distinct one.
pub struct TransportFactory {
	http: reqwest::Client,
	cache: parking_lot::Mutex<HashMap<CacheKey, Arc<dyn Transport>>>,
}

impl std::fmt::Debug for TransportFactory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TransportFactory")
			.field("cached", &self.cache.lock().len())
			.finish()
	}
}

impl TransportFactory {
	pub fn new(http: reqwest::Client) -> Self {
		Self {
			http,
			cache: parking_lot::Mutex::new(HashMap::new()),
		}
	}

	pub fn create(
		&self,
		name: impl AsRef<str>,
		cfg: &TransportConfig,
		auth: Option<Arc<dyn AuthProvider>>,
		store: Option<Arc<TokenStore>>,
	) -> Result<Arc<dyn Transport>, InvalidConfig> {
		validate(cfg)?;
		let key = CacheKey {
			config: stable_hash(cfg),
			auth: auth
				.as_ref()
				.map(|a| Arc::as_ptr(a) as *const () as usize)
				.unwrap_or(0),
			store: store
				.as_ref()
				.map(|s| Arc::as_ptr(s) as *const () as usize)
				.unwrap_or(0),
		};
		if let Some(existing) = self.cache.lock().get(&key) {
			// Terminal transports cannot be restarted; build a fresh one.
			if !existing.state().is_terminal() {
				return Ok(existing.clone());
			}
		}
		let transport = self.build(name.as_ref(), cfg, auth)?;
		self.cache.lock().insert(key, transport.clone());
		Ok(transport)
	}

	fn build(
		&self,
		name: &str,
		cfg: &TransportConfig,
		auth: Option<Arc<dyn AuthProvider>>,
	) -> Result<Arc<dyn Transport>, InvalidConfig> {
		let auth = auth.unwrap_or_else(|| Arc::new(NoneProvider));
		Ok(match cfg {
			TransportConfig::Stdio { command, args, env } => Arc::new(StdioTransport::new(
				name,
				command.clone(),
				args.clone(),
				env.clone(),
			)),
			TransportConfig::Sse {
				url,
				timeout_ms,
				reconnect,
			} => {
				let url =
					url::Url::parse(url).map_err(|e| InvalidConfig::new(format!("invalid sse url: {e}")))?;
				Arc::new(SseTransport::new(
					name,
					url,
					timeout_of(timeout_ms),
					ReconnectPolicy::from_config(reconnect.as_ref()),
					auth,
					self.http.clone(),
				))
			},
			TransportConfig::Websocket {
				url,
				timeout_ms,
				reconnect,
			} => Arc::new(WebsocketTransport::new(
				name,
				websocket_url(url)?,
				timeout_of(timeout_ms),
				ReconnectPolicy::from_config(reconnect.as_ref()),
				auth,
			)),
			TransportConfig::StreamableHttp {
				url,
				session_id,
				timeout_ms,
				reconnect,
			} => {
				let url = url::Url::parse(url)
					.map_err(|e| InvalidConfig::new(format!("invalid streamable-http url: {e}")))?;
				Arc::new(StreamableHttpTransport::new(
					name,
					url,
					session_id.clone(),
					timeout_of(timeout_ms),
					ReconnectPolicy::from_config(reconnect.as_ref()),
					auth,
					self.http.clone(),
				))
			},
		})
	}
}

fn stable_hash(cfg: &TransportConfig) -> u64 {
	// Field order in the serialized form is fixed by the struct
	// definitions, so the serialization is deterministic.
	let serialized = serde_json::to_string(cfg).unwrap_or_default();
	let mut hasher = std::hash::DefaultHasher::new();
	serialized.hash(&mut hasher);
	hasher.finish()
}

/// A transport that can atomically swap its underlying implementation
/// while preserving auth and session id. Used for streamable-http
/// upstreams that can upgrade to a more capable channel once available.
pub struct UpgradableTransport {
	name: Strng,
	factory: Arc<TransportFactory>,
	auth: Arc<dyn AuthProvider>,
	current: tokio::sync::RwLock<Arc<dyn Transport>>,
	config: parking_lot::Mutex<TransportConfig>,
	events_tx: mpsc::Sender<TransportEvent>,
	events_rx: parking_lot::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
	generation: Arc<AtomicU64>,
	closed: AtomicBool,
}

impl std::fmt::Debug for UpgradableTransport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UpgradableTransport").field("name", &self.name).finish()
	}
}

impl UpgradableTransport {
	pub fn new(
		name: impl AsRef<str>,
		factory: Arc<TransportFactory>,
		cfg: TransportConfig,
		auth: Arc<dyn AuthProvider>,
		store: Option<Arc<TokenStore>>,
	) -> Result<Arc<Self>, InvalidConfig> {
		let inner = factory.create(name.as_ref(), &cfg, Some(auth.clone()), store)?;
		let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
		let wrapper = Arc::new(Self {
			name: crate::strng::new(name),
			factory,
			auth,
			current: tokio::sync::RwLock::new(inner.clone()),
			config: parking_lot::Mutex::new(cfg),
			events_tx,
			events_rx: parking_lot::Mutex::new(Some(events_rx)),
			generation: Arc::new(AtomicU64::new(0)),
			closed: AtomicBool::new(false),
		});
		wrapper.pump(inner, 0);
		Ok(wrapper)
	}

	/// Forwards the inner transport's events while it is still current.
	fn pump(&self, inner: Arc<dyn Transport>, generation: u64) {
		let Some(mut rx) = inner.take_events() else {
			return;
		};
		let tx = self.events_tx.clone();
		let current_gen = self.generation.clone();
		tokio::spawn(async move {
			while let Some(event) = rx.recv().await {
				if current_gen.load(Ordering::Acquire) != generation {
					// A newer transport took over; drop the stale stream.
					return;
				}
				let done = matches!(event, TransportEvent::Closed);
				if tx.send(event).await.is_err() || done {
					return;
				}
			}
		});
	}

	/// Atomically swaps the underlying transport for `target`, preserving
	/// auth headers and session id. Failure to close the old transport does
	/// not prevent the new one from starting.
	pub async fn upgrade_transport(&self, target: TransportKind) -> Result<(), TransportError> {
		if self.closed.load(Ordering::Acquire) {
			return Err(TransportError::restart_after_close());
		}
		let mut current = self.current.write().await;
		if current.state().is_terminal() {
			return Err(TransportError::restart_after_close());
		}

		let old_cfg = self.config.lock().clone();
		let new_cfg = upgrade_config(&old_cfg, target, current.session_id())
			.map_err(|e| TransportError::protocol(e.to_string()))?;
		let next = self
			.factory
			.build(self.name.as_ref(), &new_cfg, Some(self.auth.clone()))
			.map_err(|e| TransportError::protocol(e.to_string()))?;
		if let Some(pv) = current.protocol_version() {
			next.set_protocol_version(pv);
		}
		next.start().await?;

		let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
		self.pump(next.clone(), generation);

		if let Err(e) = current.close().await {
			tracing::warn!(transport = %self.name, error = %e, "failed to close transport during upgrade");
		}
		*current = next;
		*self.config.lock() = new_cfg;
		Ok(())
	}
}

fn upgrade_config(
	cfg: &TransportConfig,
	target: TransportKind,
	session_id: Option<String>,
) -> Result<TransportConfig, InvalidConfig> {
	let (url, timeout_ms, reconnect) = match cfg {
		TransportConfig::StreamableHttp {
			url,
			timeout_ms,
			reconnect,
			..
		} => (url.clone(), *timeout_ms, reconnect.clone()),
		TransportConfig::Sse {
			url,
			timeout_ms,
			reconnect,
		}
		| TransportConfig::Websocket {
			url,
			timeout_ms,
			reconnect,
		} => (url.clone(), *timeout_ms, reconnect.clone()),
		TransportConfig::Stdio { .. } => {
			return Err(InvalidConfig::new("stdio transports cannot be upgraded"));
		},
	};
	let next = match target {
		TransportKind::Sse => TransportConfig::Sse {
			url,
			timeout_ms,
			reconnect,
		},
		TransportKind::Websocket => TransportConfig::Websocket {
			url,
			timeout_ms,
			reconnect,
		},
		TransportKind::StreamableHttp => TransportConfig::StreamableHttp {
			url,
			session_id,
			timeout_ms,
			reconnect,
		},
		TransportKind::Stdio => {
			return Err(InvalidConfig::new("cannot upgrade to a stdio transport"));
		},
	};
	validate(&next)?;
	Ok(next)
}

#[async_trait::async_trait]
impl Transport for UpgradableTransport {
	async fn start(&self) -> Result<(), TransportError> {
		if self.closed.load(Ordering::Acquire) {
			return Err(TransportError::restart_after_close());
		}
		self.current.read().await.start().await
	}

	async fn close(&self) -> Result<(), TransportError> {
		self.closed.store(true, Ordering::Release);
		self.current.read().await.close().await
	}

	async fn send(&self, message: ClientJsonRpcMessage) -> Result<(), TransportError> {
		self.current.read().await.send(message).await
	}

	fn state(&self) -> ConnectionState {
		match self.current.try_read() {
			Ok(t) => t.state(),
			// A writer holds the lock only during an upgrade.
			Err(_) => ConnectionState::Connecting,
		}
	}

	fn session_id(&self) -> Option<String> {
		self.current.try_read().ok().and_then(|t| t.session_id())
	}

	fn protocol_version(&self) -> Option<String> {
		self.current.try_read().ok().and_then(|t| t.protocol_version())
	}

	fn set_protocol_version(&self, version: String) {
		if let Ok(t) = self.current.try_read() {
			t.set_protocol_version(version);
		}
	}

	fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
		self.events_rx.lock().take()
	}

	async fn terminate_session(&self) -> Result<(), TransportError> {
		self.current.read().await.terminate_session().await
	}

	async fn finish_auth(&self, code: &str) -> Result<(), TransportError> {
		self.current.read().await.finish_auth(code).await
	}
}
