//! WebSocket transport. Auth headers are placed on the upgrade request
//! only; after the handshake, frames carry bare JSON-RPC messages.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use rmcp::model::ClientJsonRpcMessage;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{
	run_session_loop, serialize_message, ConnectionState, ReconnectPolicy, Shared, Transport,
	TransportError, TransportEvent,
};
use crate::auth::AuthProvider;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug)]
pub struct WebsocketTransport {
	inner: Arc<Inner>,
}

struct Inner {
	shared: Arc<Shared>,
	/// Already coerced to ws/wss by the factory.
	url: url::Url,
	timeout: Duration,
	auth: Arc<dyn AuthProvider>,
	sink: Mutex<Option<WsSink>>,
}

impl std::fmt::Debug for Inner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WebsocketTransport")
			.field("url", &self.url.as_str())
			.field("state", &self.shared.state())
			.finish()
	}
}

impl WebsocketTransport {
	pub fn new(
		name: impl AsRef<str>,
		url: url::Url,
		timeout: Duration,
		reconnect: ReconnectPolicy,
		auth: Arc<dyn AuthProvider>,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				shared: Shared::new(name, reconnect),
				url,
				timeout,
				auth,
				sink: Mutex::new(None),
			}),
		}
	}
}

impl Inner {
	async fn session(self: Arc<Self>) -> Result<(), TransportError> {
		let mut request = self
			.url
			.as_str()
			.into_client_request()
			.map_err(|e| TransportError::connect(format!("invalid websocket request: {e}")))?;
		let auth_headers = self
			.auth
			.get_headers()
			.await
			.map_err(|e| TransportError::auth(format!("auth failed: {e}")))?;
		for (name, value) in &auth_headers {
			request.headers_mut().insert(name.clone(), value.clone());
		}

		let (ws, _resp) = tokio::time::timeout(self.timeout, connect_async(request))
			.await
			.map_err(|_| TransportError::timeout("websocket connect timed out"))?
			.map_err(|e| TransportError::connect(format!("websocket connect failed: {e}")))?;

		let (sink, mut stream) = ws.split();
		*self.sink.lock().await = Some(sink);
		self.shared.set_state(ConnectionState::Connected);
		self.shared.emit(TransportEvent::Ready).await;

		loop {
			tokio::select! {
				_ = self.shared.cancel.cancelled() => break,
				frame = stream.next() => {
					match frame {
						Some(Ok(Message::Text(text))) => {
							match super::parse_server_message(text.as_str()) {
								Ok(msg) => self.shared.emit(TransportEvent::Message(msg)).await,
								Err(e) => {
									tracing::warn!(transport = %self.shared.name, error = %e, "discarding unparseable frame");
									self.shared.emit(TransportEvent::Error(e)).await;
								},
							}
						},
						// Pings are answered by tungstenite during reads.
						Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {},
						Some(Ok(Message::Close(_))) | None => break,
						Some(Err(e)) => {
							tracing::debug!(transport = %self.shared.name, error = %e, "websocket read error");
							break;
						},
					}
				},
			}
		}
		self.sink.lock().await.take();
		Ok(())
	}
}

#[async_trait::async_trait]
impl Transport for WebsocketTransport {
	async fn start(&self) -> Result<(), TransportError> {
		if !self.inner.shared.begin_start()? {
			return Ok(());
		}
		let inner = self.inner.clone();
		let shared = self.inner.shared.clone();
		tokio::spawn(async move {
			let session_inner = inner.clone();
			run_session_loop(shared, move || {
				let inner = session_inner.clone();
				async move { inner.session().await }
			})
			.await;
		});
		Ok(())
	}

	async fn close(&self) -> Result<(), TransportError> {
		if !self.inner.shared.begin_close() {
			return Ok(());
		}
		if let Some(mut sink) = self.inner.sink.lock().await.take() {
			let _ = sink.send(Message::Close(None)).await;
		}
		self.inner.shared.finish_close().await;
		Ok(())
	}

	async fn send(&self, message: ClientJsonRpcMessage) -> Result<(), TransportError> {
		self.inner.shared.ensure_connected()?;
		let text = serialize_message(&message)?;
		let mut guard = self.inner.sink.lock().await;
		let sink = guard.as_mut().ok_or_else(TransportError::not_started)?;
		tokio::time::timeout(self.inner.timeout, sink.send(Message::Text(text.into())))
			.await
			.map_err(|_| TransportError::timeout("websocket send timed out"))?
			.map_err(|e| TransportError::connect(format!("websocket send failed: {e}")))
	}

	fn state(&self) -> ConnectionState {
		self.inner.shared.state()
	}

	fn session_id(&self) -> Option<String> {
		None
	}

	fn protocol_version(&self) -> Option<String> {
		self.inner.shared.protocol_version()
	}

	fn set_protocol_version(&self, version: String) {
		self.inner.shared.set_protocol_version(version);
	}

	fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
		self.inner.shared.take_events()
	}
}
