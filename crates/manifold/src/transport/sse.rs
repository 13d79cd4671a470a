//! Server-Sent Events transport. Inbound messages arrive as `data:` lines
//! on a long-lived GET stream; outbound messages are POSTed to the same
//! URL. Auth headers are attached to both the GET and every POST.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http::header::{ACCEPT, CONTENT_TYPE};
use rmcp::model::ClientJsonRpcMessage;
use sse_stream::SseStream;
use tokio::sync::mpsc;

use super::{
	run_session_loop, serialize_message, ConnectionState, ReconnectPolicy, Shared, Transport,
	TransportError, TransportEvent, EVENT_STREAM_MIME_TYPE, JSON_MIME_TYPE,
};
use crate::auth::AuthProvider;

#[derive(Debug)]
pub struct SseTransport {
	inner: Arc<Inner>,
}

struct Inner {
	shared: Arc<Shared>,
	url: url::Url,
	timeout: Duration,
	auth: Arc<dyn AuthProvider>,
	http: reqwest::Client,
}

impl std::fmt::Debug for Inner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SseTransport")
			.field("url", &self.url.as_str())
			.field("state", &self.shared.state())
			.finish()
	}
}

impl SseTransport {
	pub fn new(
		name: impl AsRef<str>,
		url: url::Url,
		timeout: Duration,
		reconnect: ReconnectPolicy,
		auth: Arc<dyn AuthProvider>,
		http: reqwest::Client,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				shared: Shared::new(name, reconnect),
				url,
				timeout,
				auth,
				http,
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

	/// One connection: open the event stream, then pump messages until it
	/// ends.
	async fn session(self: Arc<Self>) -> Result<(), TransportError> {
		let resp = self.open_stream().await?;
		self.shared.set_state(ConnectionState::Connected);
		self.shared.emit(TransportEvent::Ready).await;

		let mut stream = SseStream::from_byte_stream(resp.bytes_stream()).boxed();
		loop {
			tokio::select! {
				_ = self.shared.cancel.cancelled() => return Ok(()),
				event = stream.next() => {
					match event {
						Some(Ok(sse)) => {
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
						Some(Err(e)) => {
							tracing::debug!(transport = %self.shared.name, error = %e, "event stream error");
							return Ok(());
						},
						None => return Ok(()),
					}
				},
			}
		}
	}

	async fn open_stream(&self) -> Result<reqwest::Response, TransportError> {
		let mut headers = self.auth_headers().await?;
		let connect = async {
			let resp = self
				.http
				.get(self.url.clone())
				.headers(headers.clone())
				.header(ACCEPT, EVENT_STREAM_MIME_TYPE)
				.send()
				.await
				.map_err(|e| TransportError::connect(format!("SSE connect failed: {e}")))?;
			if resp.status() == http::StatusCode::UNAUTHORIZED {
				// One forced refresh, one retry.
				self
					.auth
					.refresh()
					.await
					.map_err(|e| TransportError::auth(format!("auth refresh failed: {e}")))?;
				headers = self.auth_headers().await?;
				let retry = self
					.http
					.get(self.url.clone())
					.headers(headers.clone())
					.header(ACCEPT, EVENT_STREAM_MIME_TYPE)
					.send()
					.await
					.map_err(|e| TransportError::connect(format!("SSE connect failed: {e}")))?;
				return Ok(retry);
			}
			Ok(resp)
		};
		let resp = tokio::time::timeout(self.timeout, connect)
			.await
			.map_err(|_| TransportError::timeout("SSE connect timed out"))??;
		match resp.status() {
			s if s.is_success() => Ok(resp),
			http::StatusCode::UNAUTHORIZED | http::StatusCode::FORBIDDEN => {
				Err(TransportError::auth(format!("SSE connect rejected: {}", resp.status())))
			},
			s => Err(TransportError::connect(format!("SSE connect failed: {s}"))),
		}
	}
}

#[async_trait::async_trait]
impl Transport for SseTransport {
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
		self.inner.shared.finish_close().await;
		Ok(())
	}

	async fn send(&self, message: ClientJsonRpcMessage) -> Result<(), TransportError> {
		self.inner.shared.ensure_connected()?;
		let body = serialize_message(&message)?;
		let headers = self.inner.auth_headers().await?;
		let send = async {
			let resp = self
				.inner
				.http
				.post(self.inner.url.clone())
				.headers(headers)
				.header(CONTENT_TYPE, JSON_MIME_TYPE)
				.body(body.clone())
				.send()
				.await
				.map_err(|e| TransportError::connect(format!("SSE post failed: {e}")))?;
			if resp.status() == http::StatusCode::UNAUTHORIZED {
				self
					.inner
					.auth
					.refresh()
					.await
					.map_err(|e| TransportError::auth(format!("auth refresh failed: {e}")))?;
				let headers = self.inner.auth_headers().await?;
				let retry = self
					.inner
					.http
					.post(self.inner.url.clone())
					.headers(headers)
					.header(CONTENT_TYPE, JSON_MIME_TYPE)
					.body(body)
					.send()
					.await
					.map_err(|e| TransportError::connect(format!("SSE post failed: {e}")))?;
				return Ok(retry);
			}
			Ok(resp)
		};
		let resp = tokio::time::timeout(self.inner.timeout, send)
			.await
			.map_err(|_| TransportError::timeout("SSE post timed out"))??;
		if !resp.status().is_success() {
			return Err(TransportError::protocol(format!(
				"SSE post rejected: {}",
				resp.status()
			)));
		}
		Ok(())
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
