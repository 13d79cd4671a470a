//! The streamable HTTP surface served to the downstream client.
//!
//! POST carries JSON-RPC requests; the first `initialize` creates a
//! session whose id is returned in the `mcp-session-id` header and
//! required on subsequent requests. GET with `Accept: text/event-stream`
//! opens the notification stream; DELETE ends the session.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::Stream;
use http::{HeaderMap, StatusCode};
use rmcp::model::{ClientJsonRpcMessage, ClientRequest, ServerJsonRpcMessage};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::{AppState, Error};
use crate::proxy::ProxyNotification;
use crate::transport::{EVENT_STREAM_MIME_TYPE, HEADER_SESSION_ID, JSON_MIME_TYPE};

#[derive(Debug, Default)]
pub struct SessionManager {
	sessions: parking_lot::RwLock<HashMap<String, Arc<Session>>>,
}

#[derive(Debug)]
struct Session {
	id: Arc<str>,
}

impl SessionManager {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	fn create(&self) -> Arc<Session> {
		let id: Arc<str> = uuid::Uuid::new_v4().to_string().into();
		let session = Arc::new(Session { id: id.clone() });
		self
			.sessions
			.write()
			.insert(id.to_string(), session.clone());
		session
	}

	fn get(&self, id: &str) -> Option<Arc<Session>> {
		self.sessions.read().get(id).cloned()
	}

	fn remove(&self, id: &str) -> Option<Arc<Session>> {
		self.sessions.write().remove(id)
	}
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
	headers.get(HEADER_SESSION_ID).and_then(|v| v.to_str().ok())
}

pub async fn post(
	State(state): State<AppState>,
	headers: HeaderMap,
	body: Bytes,
) -> Result<Response, Error> {
	// The client must be able to take both a JSON response and a stream.
	let accept = headers
		.get(http::header::ACCEPT)
		.and_then(|h| h.to_str().ok())
		.unwrap_or("");
	if !(accept.contains(JSON_MIME_TYPE) && accept.contains(EVENT_STREAM_MIME_TYPE)) {
		return Err(Error::InvalidAccept);
	}
	let content_type = headers
		.get(http::header::CONTENT_TYPE)
		.and_then(|h| h.to_str().ok())
		.unwrap_or("");
	if !content_type.starts_with(JSON_MIME_TYPE) {
		return Err(Error::InvalidContentType);
	}

	let message: ClientJsonRpcMessage =
		serde_json::from_slice(&body).map_err(|e| Error::Deserialize(e.to_string()))?;

	let session_id = session_header(&headers);
	if let ClientJsonRpcMessage::Request(r) = &message {
		tracing::debug!(
			method = %r.request.method(),
			session_id = session_id.unwrap_or(""),
			"mcp request"
		);
	}
	let new_session = match session_id {
		Some(id) => {
			if state.sessions.get(id).is_none() {
				return Err(Error::UnknownSession);
			}
			None
		},
		None => {
			// Only an initialize request may open a session.
			let is_init = matches!(&message, ClientJsonRpcMessage::Request(r) if matches!(&r.request, &ClientRequest::InitializeRequest(_)));
			if !is_init {
				return Err(Error::MissingSessionHeader);
			}
			Some(state.sessions.create())
		},
	};

	let response = state.proxy.handle_message(message).await;
	let mut resp = match response {
		Some(msg) => json_response(&msg)?,
		None => StatusCode::ACCEPTED.into_response(),
	};
	if let Some(session) = new_session {
		let value = session
			.id
			.parse()
			.map_err(|_| Error::Internal("invalid session id".to_string()))?;
		resp.headers_mut().insert(HEADER_SESSION_ID, value);
	}
	Ok(resp)
}

pub async fn get_stream(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Error> {
	let accept = headers
		.get(http::header::ACCEPT)
		.and_then(|h| h.to_str().ok())
		.unwrap_or("");
	if !accept.contains(EVENT_STREAM_MIME_TYPE) {
		return Err(Error::InvalidAccept);
	}
	let Some(session_id) = session_header(&headers) else {
		return Err(Error::SessionIdRequired);
	};
	if state.sessions.get(session_id).is_none() {
		return Err(Error::UnknownSession);
	}

	let notifications = BroadcastStream::new(state.proxy.subscribe());
	let stream = notifications.filter_map(|item| match item {
		Ok(ProxyNotification::ToolListChanged) => {
			let message = tools_changed_message();
			match serde_json::to_string(&message) {
				Ok(data) => Some(Ok(Event::default().data(data))),
				Err(_) => None,
			}
		},
		// Lagged receivers skip; the client recovers on the next change.
		Err(_) => None,
	});
	Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn delete(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, Error> {
	let Some(session_id) = session_header(&headers) else {
		return Err(Error::SessionIdRequired);
	};
	state.sessions.remove(session_id);
	Ok(StatusCode::ACCEPTED.into_response())
}

pub(crate) fn tools_changed_message() -> ServerJsonRpcMessage {
	ServerJsonRpcMessage::notification(
		rmcp::model::ToolListChangedNotification {
			method: Default::default(),
			extensions: Default::default(),
		}
		.into(),
	)
}

fn json_response(message: &ServerJsonRpcMessage) -> Result<Response, Error> {
	let body = serde_json::to_vec(message).map_err(|e| Error::Internal(e.to_string()))?;
	Ok(
		(
			StatusCode::OK,
			[(http::header::CONTENT_TYPE, JSON_MIME_TYPE)],
			body,
		)
			.into_response(),
	)
}
