//! Upstream MCP client: wraps a transport with protocol framing.
//!
//! On start the client issues `initialize` followed by `tools/list` and
//! caches the tool descriptors. A `tools/list_changed` notification
//! schedules a non-blocking refresh; the old cache stays usable until a
//! refresh succeeds. Reconnects (transport `Ready` after a drop) repeat
//! the handshake, since transports replay no protocol state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{
	CallToolRequestParam, CallToolResult, ClientCapabilities, ClientInfo, ClientJsonRpcMessage,
	ClientRequest, ErrorData, Implementation, ProtocolVersion, RequestId, ServerJsonRpcMessage,
	ServerNotification, ServerResult, Tool,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::transport::{Transport, TransportError, TransportEvent, DEFAULT_TIMEOUT};
use crate::Strng;

#[cfg(test)]
#[path = "upstream_tests.rs"]
mod tests;

#[derive(Error, Debug)]
pub enum UpstreamError {
	#[error("transport error: {0}")]
	Transport(#[from] TransportError),
	/// The upstream returned a JSON-RPC error; forwarded verbatim.
	#[error("upstream error: {}", .0.message)]
	Rpc(ErrorData),
	#[error("unexpected response to {0}")]
	UnexpectedResult(&'static str),
}

/// Events surfaced to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
	/// The upstream's tool set changed (or became known).
	ToolsChanged(Strng),
	/// The upstream is gone for good.
	Closed(Strng),
}

pub struct UpstreamClient {
	inner: Arc<Inner>,
}

struct Inner {
	name: Strng,
	transport: Arc<dyn Transport>,
	timeout: Duration,
	next_id: AtomicU32,
	pending: parking_lot::Mutex<HashMap<RequestId, oneshot::Sender<Result<ServerResult, ErrorData>>>>,
	tools: parking_lot::Mutex<Option<Vec<Tool>>>,
	closed: AtomicBool,
	events_out: mpsc::Sender<UpstreamEvent>,
	init_done: watch::Sender<bool>,
	// Serializes the initialize handshake across reconnects.
	init_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for UpstreamClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UpstreamClient")
			.field("name", &self.inner.name)
			.field("state", &self.inner.transport.state())
			.finish()
	}
}

impl UpstreamClient {
	pub fn new(
		name: Strng,
		transport: Arc<dyn Transport>,
		events_out: mpsc::Sender<UpstreamEvent>,
	) -> Self {
		let (init_done, _) = watch::channel(false);
		Self {
			inner: Arc::new(Inner {
				name,
				transport,
				timeout: DEFAULT_TIMEOUT,
				next_id: AtomicU32::new(1),
				pending: parking_lot::Mutex::new(HashMap::new()),
				tools: parking_lot::Mutex::new(None),
				closed: AtomicBool::new(false),
				events_out,
				init_done,
				init_lock: tokio::sync::Mutex::new(()),
			}),
		}
	}

	pub fn name(&self) -> &Strng {
		&self.inner.name
	}

	pub fn is_connected(&self) -> bool {
		*self.inner.init_done.borrow() && !self.inner.closed.load(Ordering::Acquire)
	}

	/// Starts the transport and performs the initial handshake. Resolves
	/// once `initialize` and the first `tools/list` completed.
	pub async fn start(&self) -> Result<(), UpstreamError> {
		self.inner.transport.start().await?;
		let Some(mut events) = self.inner.transport.take_events() else {
			// Already started previously; wait for the handshake below.
			return self.await_initialized().await;
		};
		let inner = self.inner.clone();
		tokio::spawn(async move {
			while let Some(event) = events.recv().await {
				inner.clone().handle_event(event).await;
			}
		});
		self.await_initialized().await
	}

	async fn await_initialized(&self) -> Result<(), UpstreamError> {
		let mut rx = self.inner.init_done.subscribe();
		let wait = async {
			loop {
				if *rx.borrow_and_update() {
					return Ok(());
				}
				if rx.changed().await.is_err() {
					return Err(UpstreamError::Transport(TransportError::already_closed()));
				}
			}
		};
		tokio::time::timeout(self.inner.timeout, wait)
			.await
			.map_err(|_| UpstreamError::Transport(TransportError::timeout("initialize timed out")))?
	}

	/// Cached tool descriptors; `None` until the first successful list.
	pub fn tools(&self) -> Option<Vec<Tool>> {
		self.inner.tools.lock().clone()
	}

	pub async fn call_tool(
		&self,
		tool: &str,
		arguments: Option<rmcp::model::JsonObject>,
	) -> Result<CallToolResult, UpstreamError> {
		let mut params = CallToolRequestParam::new(tool.to_string());
		params.arguments = arguments;
		let request = rmcp::model::CallToolRequest::new(params);
		match self.inner.request(request.into()).await? {
			ServerResult::CallToolResult(r) => Ok(r),
			_ => Err(UpstreamError::UnexpectedResult("tools/call")),
		}
	}

	/// Fetches the tool list, updating the cache on success.
	pub async fn list_tools(&self) -> Result<Vec<Tool>, UpstreamError> {
		self.inner.clone().list_tools().await
	}

	pub async fn close(&self) -> Result<(), UpstreamError> {
		self.inner.closed.store(true, Ordering::Release);
		self.inner.transport.close().await?;
		Ok(())
	}

	pub fn transport(&self) -> Arc<dyn Transport> {
		self.inner.transport.clone()
	}
}

impl Inner {
	async fn handle_event(self: Arc<Self>, event: TransportEvent) {
		match event {
			TransportEvent::Ready => {
				// The handshake issues requests whose responses arrive on
				// this very event loop; run it on its own task.
				let inner = self.clone();
				tokio::spawn(async move {
					if let Err(e) = inner.clone().on_ready().await {
						tracing::warn!(upstream = %inner.name, error = %e, "handshake failed");
					}
				});
			},
			TransportEvent::Message(message) => self.route_message(message).await,
			TransportEvent::Error(e) => {
				tracing::debug!(upstream = %self.name, error = %e, "transport error");
			},
			TransportEvent::Closed => {
				self.closed.store(true, Ordering::Release);
				let _ = self.init_done.send(false);
				self.fail_pending(TransportError::already_closed());
				let _ = self.events_out.send(UpstreamEvent::Closed(self.name.clone())).await;
			},
		}
	}

	async fn on_ready(self: Arc<Self>) -> Result<(), UpstreamError> {
		let _guard = self.init_lock.lock().await;
		self.initialize().await?;
		let _ = self.init_done.send(true);
		self.clone().list_tools().await?;
		let _ = self
			.events_out
			.send(UpstreamEvent::ToolsChanged(self.name.clone()))
			.await;
		Ok(())
	}

	async fn initialize(&self) -> Result<(), UpstreamError> {
		let request = rmcp::model::InitializeRequest::new(client_info());
		let result = self.request(request.into()).await?;
		let ServerResult::InitializeResult(init) = result else {
			return Err(UpstreamError::UnexpectedResult("initialize"));
		};
		self
			.transport
			.set_protocol_version(init.protocol_version.to_string());

		let notification = ClientJsonRpcMessage::notification(
			rmcp::model::InitializedNotification {
				method: Default::default(),
				extensions: Default::default(),
			}
			.into(),
		);
		self.transport.send(notification).await?;
		tracing::debug!(upstream = %self.name, server = ?init.server_info.name, "initialized");
		Ok(())
	}

	async fn list_tools(self: Arc<Self>) -> Result<Vec<Tool>, UpstreamError> {
		let request = rmcp::model::ListToolsRequest {
			method: Default::default(),
			params: None,
			extensions: Default::default(),
		};
		match self.request(request.into()).await? {
			ServerResult::ListToolsResult(r) => {
				*self.tools.lock() = Some(r.tools.clone());
				Ok(r.tools)
			},
			_ => Err(UpstreamError::UnexpectedResult("tools/list")),
		}
	}

	async fn request(&self, request: ClientRequest) -> Result<ServerResult, UpstreamError> {
		let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed).into());
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id.clone(), tx);

		let message = ClientJsonRpcMessage::request(request, id.clone());
		if let Err(e) = self.transport.send(message).await {
			self.pending.lock().remove(&id);
			return Err(e.into());
		}

		match tokio::time::timeout(self.timeout, rx).await {
			Err(_) => {
				self.pending.lock().remove(&id);
				Err(UpstreamError::Transport(TransportError::timeout(
					"request timed out",
				)))
			},
			Ok(Err(_)) => Err(UpstreamError::Transport(TransportError::already_closed())),
			Ok(Ok(Ok(result))) => Ok(result),
			Ok(Ok(Err(error))) => Err(UpstreamError::Rpc(error)),
		}
	}

	async fn route_message(self: Arc<Self>, message: ServerJsonRpcMessage) {
		match message {
			ServerJsonRpcMessage::Response(r) => {
				if let Some(tx) = self.pending.lock().remove(&r.id) {
					let _ = tx.send(Ok(r.result));
				} else {
					tracing::debug!(upstream = %self.name, id = ?r.id, "response without a pending request");
				}
			},
			ServerJsonRpcMessage::Error(e) => {
				let removed = e.id.as_ref().and_then(|id| self.pending.lock().remove(id));
				if let Some(tx) = removed {
					let _ = tx.send(Err(e.error));
				} else {
					tracing::debug!(upstream = %self.name, id = ?e.id, "error without a pending request");
				}
			},
			ServerJsonRpcMessage::Notification(n) => {
				if let ServerNotification::ToolListChangedNotification(_) = n.notification {
					tracing::debug!(upstream = %self.name, "tool list changed");
					// Non-blocking refresh; the stale cache stays usable if
					// the refresh fails.
					let inner = self.clone();
					tokio::spawn(async move {
						match inner.clone().list_tools().await {
							Ok(_) => {
								let _ = inner
									.events_out
									.send(UpstreamEvent::ToolsChanged(inner.name.clone()))
									.await;
							},
							Err(e) => {
								tracing::warn!(upstream = %inner.name, error = %e, "tool list refresh failed");
							},
						}
					});
				}
			},
			ServerJsonRpcMessage::Request(r) => {
				tracing::debug!(upstream = %self.name, id = ?r.id, "unsupported server-initiated request");
			},
			_ => {},
		}
	}

	fn fail_pending(&self, error: TransportError) {
		let pending: Vec<_> = self.pending.lock().drain().collect();
		for (_, tx) in pending {
			let _ = tx.send(Err(ErrorData::internal_error(error.to_string(), None)));
		}
	}
}

fn client_info() -> ClientInfo {
	let mut implementation = Implementation::default();
	implementation.name = "manifold".to_string();
	implementation.version = env!("CARGO_PKG_VERSION").to_string();

	let mut info = ClientInfo::default();
	info.protocol_version = ProtocolVersion::V_2025_06_18;
	info.capabilities = ClientCapabilities::default();
	info.client_info = implementation;
	info
}
