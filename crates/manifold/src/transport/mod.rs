//! Client transports for upstream MCP servers.
//!
//! All four transports (stdio, SSE, WebSocket, Streamable HTTP) share a
//! connection state machine:
//!
//! ```text
//! idle ──start──▶ connecting ──ok──▶ connected
//!                    │  fail
//!                    ▼
//!               reconnecting ──attempts exhausted──▶ failed
//!                    │  ok
//!                    ▼
//!                 connected ──close──▶ closing ──▶ closed
//! ```
//!
//! `closed` and `failed` are terminal. Reconnection replays no protocol
//! state; a successful reconnect emits [`TransportEvent::Ready`] and the
//! upstream client re-initializes.

pub mod factory;
pub mod sse;
pub mod stdio;
pub mod streamablehttp;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use rmcp::model::{ClientJsonRpcMessage, ServerJsonRpcMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectConfig;
use crate::strng;
use crate::Strng;

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
pub const JSON_MIME_TYPE: &str = "application/json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
	Idle,
	Connecting,
	Connected,
	Reconnecting,
	Closing,
	Closed,
	Failed,
}

impl ConnectionState {
	pub fn is_terminal(&self) -> bool {
		matches!(self, ConnectionState::Closed | ConnectionState::Failed)
	}
}

impl std::fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			ConnectionState::Idle => "idle",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
			ConnectionState::Reconnecting => "reconnecting",
			ConnectionState::Closing => "closing",
			ConnectionState::Closed => "closed",
			ConnectionState::Failed => "failed",
		};
		write!(f, "{s}")
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
	Connect,
	Protocol,
	Timeout,
	Auth,
	Closed,
}

#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct TransportError {
	pub kind: ErrorKind,
	pub retryable: bool,
	message: String,
}

impl TransportError {
	pub fn connect(message: impl Into<String>) -> Self {
		Self {
			kind: ErrorKind::Connect,
			retryable: true,
			message: message.into(),
		}
	}

	pub fn protocol(message: impl Into<String>) -> Self {
		Self {
			kind: ErrorKind::Protocol,
			retryable: false,
			message: message.into(),
		}
	}

	pub fn timeout(message: impl Into<String>) -> Self {
		Self {
			kind: ErrorKind::Timeout,
			retryable: true,
			message: message.into(),
		}
	}

	pub fn auth(message: impl Into<String>) -> Self {
		Self {
			kind: ErrorKind::Auth,
			retryable: false,
			message: message.into(),
		}
	}

	pub fn closed(message: impl Into<String>) -> Self {
		Self {
			kind: ErrorKind::Closed,
			retryable: false,
			message: message.into(),
		}
	}

	pub fn not_started() -> Self {
		Self::closed("Transport not started")
	}

	pub fn already_closed() -> Self {
		Self::closed("Transport is closed")
	}

	pub fn restart_after_close() -> Self {
		Self::closed("Transport is closed and cannot be restarted")
	}
}

/// Events emitted by a transport towards its owner.
#[derive(Debug)]
pub enum TransportEvent {
	/// A message arrived from the server.
	Message(ServerJsonRpcMessage),
	/// A transport-level error occurred. Retryable errors are followed by
	/// reconnection attempts; non-retryable errors by `Closed`.
	Error(TransportError),
	/// The transport (re)connected. No protocol state is replayed; the
	/// owner must re-initialize.
	Ready,
	/// The transport is done; no further events follow.
	Closed,
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
	/// Starts the transport. Idempotent while not closed; starting a closed
	/// transport is a fatal error.
	async fn start(&self) -> Result<(), TransportError>;

	/// Closes the transport and cancels any pending reconnection timers.
	/// Idempotent.
	async fn close(&self) -> Result<(), TransportError>;

	/// Sends a message. Requires the transport to be connected.
	async fn send(&self, message: ClientJsonRpcMessage) -> Result<(), TransportError>;

	fn state(&self) -> ConnectionState;

	fn session_id(&self) -> Option<String>;

	fn protocol_version(&self) -> Option<String>;

	fn set_protocol_version(&self, version: String);

	/// Takes the event receiver. May only be taken once; subsequent calls
	/// return `None`.
	fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

	/// Ends the server-side session, where the transport has one. A no-op
	/// for transports without session state.
	async fn terminate_session(&self) -> Result<(), TransportError> {
		Ok(())
	}

	/// Completes a pending authorization flow via the attached auth
	/// provider. Only supported by transports carrying such a provider.
	async fn finish_auth(&self, _code: &str) -> Result<(), TransportError> {
		Err(TransportError::auth(
			"this transport has no authorization flow to complete",
		))
	}
}

/// Backoff policy derived from [`ReconnectConfig`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
	pub max_attempts: u32,
	pub initial_delay: Duration,
	pub max_delay: Duration,
	pub multiplier: f64,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			initial_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(30),
			multiplier: 2.0,
		}
	}
}

impl ReconnectPolicy {
	pub fn from_config(cfg: Option<&ReconnectConfig>) -> Self {
		let d = Self::default();
		let Some(cfg) = cfg else {
			return d;
		};
		Self {
			max_attempts: cfg.max_attempts.unwrap_or(d.max_attempts),
			initial_delay: cfg
				.initial_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(d.initial_delay),
			max_delay: cfg
				.max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(d.max_delay),
			multiplier: cfg.backoff_multiplier.unwrap_or(d.multiplier),
		}
	}

	pub fn enabled(&self) -> bool {
		self.max_attempts > 0
	}

	/// Delay before attempt `n` (0-based): `min(max, initial * multiplier^n)`
	/// with ±20% jitter.
	pub fn delay(&self, attempt: u32) -> Duration {
		let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
		let capped = base.min(self.max_delay.as_millis() as f64);
		let jittered = capped * rand::rng().random_range(0.8..1.2);
		Duration::from_millis(jittered as u64)
	}
}

/// State shared between a transport's public handle and its background
/// tasks.
pub(crate) struct Shared {
	pub name: Strng,
	state: parking_lot::Mutex<ConnectionState>,
	events_tx: mpsc::Sender<TransportEvent>,
	events_rx: parking_lot::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
	protocol_version: parking_lot::Mutex<Option<String>>,
	session_id: parking_lot::Mutex<Option<String>>,
	pub cancel: CancellationToken,
	pub reconnect: ReconnectPolicy,
}

impl std::fmt::Debug for Shared {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Shared")
			.field("name", &self.name)
			.field("state", &self.state())
			.finish()
	}
}

impl Shared {
	pub fn new(name: impl AsRef<str>, reconnect: ReconnectPolicy) -> Arc<Self> {
		let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
		Arc::new(Self {
			name: strng::new(name),
			state: parking_lot::Mutex::new(ConnectionState::Idle),
			events_tx,
			events_rx: parking_lot::Mutex::new(Some(events_rx)),
			protocol_version: parking_lot::Mutex::new(None),
			session_id: parking_lot::Mutex::new(None),
			cancel: CancellationToken::new(),
			reconnect,
		})
	}

	pub fn state(&self) -> ConnectionState {
		*self.state.lock()
	}

	pub fn set_state(&self, next: ConnectionState) {
		let mut s = self.state.lock();
		tracing::trace!(transport = %self.name, from = %*s, to = %next, "transport state");
		*s = next;
	}

	/// Checks whether a start is permitted. Returns `Ok(false)` when the
	/// transport is already starting or started (start is idempotent).
	pub fn begin_start(&self) -> Result<bool, TransportError> {
		let mut s = self.state.lock();
		match *s {
			ConnectionState::Closed | ConnectionState::Failed => Err(TransportError::restart_after_close()),
			ConnectionState::Idle => {
				*s = ConnectionState::Connecting;
				Ok(true)
			},
			_ => Ok(false),
		}
	}

	/// Checks whether a close should proceed. Returns `false` when already
	/// closing or closed (close is idempotent).
	pub fn begin_close(&self) -> bool {
		let mut s = self.state.lock();
		match *s {
			ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => false,
			_ => {
				*s = ConnectionState::Closing;
				true
			},
		}
	}

	pub fn ensure_connected(&self) -> Result<(), TransportError> {
		match self.state() {
			ConnectionState::Connected => Ok(()),
			ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
				Err(TransportError::already_closed())
			},
			_ => Err(TransportError::not_started()),
		}
	}

	pub fn closing_or_closed(&self) -> bool {
		matches!(
			self.state(),
			ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed
		)
	}

	pub async fn emit(&self, event: TransportEvent) {
		// The receiver may be gone when the owner shut down first.
		let _ = self.events_tx.send(event).await;
	}

	pub fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
		self.events_rx.lock().take()
	}

	pub fn protocol_version(&self) -> Option<String> {
		self.protocol_version.lock().clone()
	}

	pub fn set_protocol_version(&self, version: String) {
		*self.protocol_version.lock() = Some(version);
	}

	pub fn session_id(&self) -> Option<String> {
		self.session_id.lock().clone()
	}

	pub fn set_session_id(&self, id: Option<String>) {
		*self.session_id.lock() = id;
	}

	/// Marks the transport closed and emits the final `Closed` event.
	pub async fn finish_close(&self) {
		self.cancel.cancel();
		self.set_state(ConnectionState::Closed);
		self.emit(TransportEvent::Closed).await;
	}

	/// Marks the transport failed after reconnection gave up.
	pub async fn fail(&self, err: TransportError) {
		self.set_state(ConnectionState::Failed);
		self.emit(TransportEvent::Error(err)).await;
		self.emit(TransportEvent::Closed).await;
	}
}

/// Drives connect/run/reconnect for the network transports.
///
/// `session` performs one full connection: it connects, transitions the
/// shared state to `Connected`, emits `Ready`, and runs until the
/// connection drops. It returns `Ok(())` for an unsolicited disconnect
/// after a successful connect, and `Err` when the connection attempt itself
/// failed. The attempt counter resets after every successful connect.
pub(crate) async fn run_session_loop<C, Fut>(shared: Arc<Shared>, mut session: C)
where
	C: FnMut() -> Fut + Send,
	Fut: std::future::Future<Output = Result<(), TransportError>> + Send,
{
	let mut attempt: u32 = 0;
	loop {
		if shared.closing_or_closed() {
			return;
		}
		let connected = match session().await {
			Ok(()) => true,
			Err(e) => {
				if shared.closing_or_closed() {
					return;
				}
				let fatal = !e.retryable;
				tracing::warn!(transport = %shared.name, error = %e, "connection attempt failed");
				if fatal {
					shared.fail(e).await;
					return;
				}
				shared.emit(TransportEvent::Error(e)).await;
				false
			},
		};
		if shared.closing_or_closed() {
			return;
		}
		if connected {
			attempt = 0;
		}
		if !shared.reconnect.enabled() || attempt >= shared.reconnect.max_attempts {
			shared
				.fail(TransportError::connect("reconnect attempts exhausted"))
				.await;
			return;
		}
		shared.set_state(ConnectionState::Reconnecting);
		let delay = shared.reconnect.delay(attempt);
		attempt += 1;
		tracing::debug!(transport = %shared.name, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
		tokio::select! {
			_ = shared.cancel.cancelled() => return,
			_ = tokio::time::sleep(delay) => {},
		}
	}
}

pub(crate) fn serialize_message(message: &ClientJsonRpcMessage) -> Result<String, TransportError> {
	serde_json::to_string(message).map_err(|e| TransportError::protocol(format!("serialize: {e}")))
}

pub(crate) fn parse_server_message(data: &str) -> Result<ServerJsonRpcMessage, TransportError> {
	serde_json::from_str(data).map_err(|e| TransportError::protocol(format!("parse: {e}")))
}
