//! Streamable HTTP transport. Every outbound message is an HTTP POST; the
//! response is a JSON message, an SSE stream of messages, or 202 Accepted.
//! A standalone GET stream carries server-initiated messages and resumes
//! with `Last-Event-Id`. The session id issued by the server is replayed on
//! every request.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http::header::{ACCEPT, CONTENT_TYPE};
use rmcp::model::ClientJsonRpcMessage;
use sse_stream::SseStream;
use tokio::sync::mpsc;

use super::{
	serialize_message, ConnectionState, ReconnectPolicy, Shared, Transport, TransportError,
	TransportEvent, EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID, JSON_MIME_TYPE,
};
use crate::auth::AuthProvider;

#[derive(Clone, Debug)]
pub struct StreamableHttpTransport {
	inner: Arc<Inner>,
}

struct Inner {
	shared: Arc<Shared>,
	url: url::Url,
	timeout: Duration,
	auth: Arc<dyn AuthProvider>,
	http: reqwest::Client,
	last_event_id: parking_lot::Mutex<Option<String>>,
}

impl std::fmt::Debug for Inner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StreamableHttpTransport")
			.field("url", &self.url.as_str())
			.field("state", &self.shared.state())
			.field("session_id", &self.shared.session_id())
			.finish()
	}
}

impl StreamableHttpTransport {
	pub fn new(
		name: impl AsRef<str>,
		url: url::Url,
		session_id: Option<String>,
		timeout: Duration,
		reconnect: ReconnectPolicy,
		auth: Arc<dyn AuthProvider>,
		http: reqwest::Client,
	) -> Self {
		let shared = Shared::new(name, reconnect);
		shared.set_session_id(session_id);
		Self {
			inner: Arc::new(Inner {
				shared,
				url,
				timeout,
				auth,
				http,
				last_event_id: parking_lot::Mutex::new(None),
			}),
		}
	}

}

impl Inner {
	async fn auth_headers(&self) -> Result<http::HeaderMap, TransportError> {
		self
			.auth
			.get_headers()
			.await
			.map_err(|e| TransportError::auth(format!("auth failed: {e}")))
	}

	fn capture_session_id(&self, resp: &reqwest::Response) {
		if let Some(sid) = resp
			.headers()
			.get(HEADER_SESSION_ID)
			.and_then(|v| v.to_str().ok())
		{
			self.shared.set_session_id(Some(sid.to_string()));
		}
	}

	async fn post_message(&self, body: String) -> Result<reqwest::Response, TransportError> {
		let mut attempt = 0;
		loop {
			let headers = self.auth_headers().await?;
			let mut req = self
				.http
				.post(self.url.clone())
				.headers(headers)
				.header(CONTENT_TYPE, JSON_MIME_TYPE)
				.header(ACCEPT, format!("{JSON_MIME_TYPE}, {EVENT_STREAM_MIME_TYPE}"))
				.body(body.clone());
			if let Some(sid) = self.shared.session_id() {
				req = req.header(HEADER_SESSION_ID, sid);
			}
			let resp = tokio::time::timeout(self.timeout, req.send())
				.await
				.map_err(|_| TransportError::timeout("post timed out"))?
				.map_err(|e| TransportError::connect(format!("post failed: {e}")))?;

			if resp.status() == http::StatusCode::UNAUTHORIZED && attempt == 0 {
				// One forced refresh, one retry.
				attempt += 1;
				self
					.auth
					.refresh()
					.await
					.map_err(|e| TransportError::auth(format!("auth refresh failed: {e}")))?;
				continue;
			}
			return Ok(resp);
		}
	}

	/// Pumps one SSE body until it ends, remembering event ids for
	/// resumption.
	async fn pump_sse(self: Arc<Self>, resp: reqwest::Response) {
		let mut stream = SseStream::from_byte_stream(resp.bytes_stream()).boxed();
		loop {
			tokio::select! {
				_ = self.shared.cancel.cancelled() => return,
				event = stream.next() => {
					match event {
						Some(Ok(sse)) => {
							if let Some(id) = sse.id {
								*self.last_event_id.lock() = Some(id);
							}
							let Some(data) = sse.data else { continue };
							if data.is_empty() {
								continue;
							}
							match super::parse_server_message(&data) {
								Ok(msg) => self.shared.emit(TransportEvent::Message(msg)).await,
								Err(e) => {
									tracing::warn!(transport = %self.shared.name, error = %e, "discarding unparseable event");
									self.shared.emit(TransportEvent::Error(e)).await;
								},
							}
						},
						Some(Err(_)) | None => return,
					}
				},
			}
		}
	}

	/// Maintains the standalone GET stream. Failures here degrade delivery
	/// of server-initiated messages but do not fail the transport; POSTs
	/// keep working on their own.
	async fn maintain_get_stream(self: Arc<Self>) {
		let mut attempt: u32 = 0;
		loop {
			if self.shared.closing_or_closed() {
				return;
			}
			match self.open_get_stream().await {
				Ok(Some(resp)) => {
					attempt = 0;
					self.clone().pump_sse(resp).await;
				},
				// The server offers no standalone stream; nothing to maintain.
				Ok(None) => return,
				Err(e) => {
					tracing::debug!(transport = %self.shared.name, error = %e, "standalone stream unavailable");
				},
			}
			if !self.shared.reconnect.enabled() || attempt >= self.shared.reconnect.max_attempts {
				tracing::debug!(transport = %self.shared.name, "giving up on standalone stream");
				return;
			}
			let delay = self.shared.reconnect.delay(attempt);
			attempt += 1;
			tokio::select! {
				_ = self.shared.cancel.cancelled() => return,
				_ = tokio::time::sleep(delay) => {},
			}
		}
	}

	async fn open_get_stream(&self) -> Result<Option<reqwest::Response>, TransportError> {
		let headers = self.auth_headers().await?;
		let mut req = self
			.http
			.get(self.url.clone())
			.headers(headers)
			.header(ACCEPT, EVENT_STREAM_MIME_TYPE);
		if let Some(sid) = self.shared.session_id() {
			req = req.header(HEADER_SESSION_ID, sid);
		}
		if let Some(last) = self.last_event_id.lock().clone() {
			req = req.header(HEADER_LAST_EVENT_ID, last);
		}
		let resp = tokio::time::timeout(self.timeout, req.send())
			.await
			.map_err(|_| TransportError::timeout("get stream timed out"))?
			.map_err(|e| TransportError::connect(format!("get stream failed: {e}")))?;
		match resp.status() {
			s if s.is_success() => Ok(Some(resp)),
			http::StatusCode::METHOD_NOT_ALLOWED | http::StatusCode::NOT_FOUND => Ok(None),
			s => Err(TransportError::connect(format!("get stream rejected: {s}"))),
		}
	}
}

#[async_trait::async_trait]
impl Transport for StreamableHttpTransport {
	async fn start(&self) -> Result<(), TransportError> {
		if !self.inner.shared.begin_start()? {
			return Ok(());
		}
		// Request/response transport; the connection is per-message. Mark
		// connected and maintain the standalone stream in the background.
		self.inner.shared.set_state(ConnectionState::Connected);
		self.inner.shared.emit(TransportEvent::Ready).await;
		let inner = self.inner.clone();
		tokio::spawn(inner.maintain_get_stream());
		Ok(())
	}

	async fn close(&self) -> Result<(), TransportError> {
		if !self.inner.shared.begin_close() {
			return Ok(());
		}
		self.inner.shared.finish_close().await;
		Ok(())
	}

	async fn send(&self, message: ClientJsonRpcMessage) -> Result<(), TransportError> {
		self.inner.shared.ensure_connected()?;
		let body = serialize_message(&message)?;
		let resp = self.inner.post_message(body).await?;
		self.inner.capture_session_id(&resp);

		match resp.status() {
			http::StatusCode::ACCEPTED => Ok(()),
			http::StatusCode::NOT_FOUND if self.inner.shared.session_id().is_some() => {
				// Session expired server-side; the next initialize starts a
				// fresh one.
				self.inner.shared.set_session_id(None);
				Err(TransportError::protocol("session expired"))
			},
			http::StatusCode::UNAUTHORIZED | http::StatusCode::FORBIDDEN => Err(TransportError::auth(
				format!("post rejected: {}", resp.status()),
			)),
			s if !s.is_success() => Err(TransportError::protocol(format!("post rejected: {s}"))),
			_ => {
				let content_type = resp
					.headers()
					.get(CONTENT_TYPE)
					.and_then(|v| v.to_str().ok())
					.unwrap_or("")
					.to_string();
				if content_type.starts_with(EVENT_STREAM_MIME_TYPE) {
					let inner = self.inner.clone();
					tokio::spawn(inner.pump_sse(resp));
					Ok(())
				} else if content_type.starts_with(JSON_MIME_TYPE) {
					let body = resp
						.bytes()
						.await
						.map_err(|e| TransportError::connect(format!("response read failed: {e}")))?;
					let msg = serde_json::from_slice(&body)
						.map_err(|e| TransportError::protocol(format!("parse: {e}")))?;
					self.inner.shared.emit(TransportEvent::Message(msg)).await;
					Ok(())
				} else {
					Err(TransportError::protocol(format!(
						"unexpected content type: {content_type:?}"
					)))
				}
			},
		}
	}

	fn state(&self) -> ConnectionState {
		self.inner.shared.state()
	}

	fn session_id(&self) -> Option<String> {
		self.inner.shared.session_id()
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

	/// Ends the server-side session with a DELETE and forgets the session
	/// id locally.
	async fn terminate_session(&self) -> Result<(), TransportError> {
		let inner = &self.inner;
		if inner.shared.session_id().is_none() {
			return Ok(());
		}
		let headers = inner.auth_headers().await?;
		let mut req = inner.http.delete(inner.url.clone()).headers(headers);
		if let Some(sid) = inner.shared.session_id() {
			req = req.header(HEADER_SESSION_ID, sid);
		}
		let resp = tokio::time::timeout(inner.timeout, req.send())
			.await
			.map_err(|_| TransportError::timeout("session delete timed out"))?
			.map_err(|e| TransportError::connect(format!("session delete failed: {e}")))?;
		inner.shared.set_session_id(None);
		*inner.last_event_id.lock() = None;
		if !resp.status().is_success() && resp.status() != http::StatusCode::METHOD_NOT_ALLOWED {
			return Err(TransportError::protocol(format!(
				"session delete rejected: {}",
				resp.status()
			)));
		}
		Ok(())
	}

	/// Completes a pending authorization-code flow on the attached auth
	/// provider.
	async fn finish_auth(&self, code: &str) -> Result<(), TransportError> {
		self
			.inner
			.auth
			.finish_auth(code)
			.await
			.map_err(|e| TransportError::auth(format!("finish auth failed: {e}")))
	}
}
