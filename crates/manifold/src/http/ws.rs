//! WebSocket surface: JSON-RPC messages as text frames, with proxy
//! notifications pushed onto the same socket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use rmcp::model::ClientJsonRpcMessage;

use super::AppState;
use crate::proxy::ProxyNotification;

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
	ws.on_upgrade(move |socket| serve(socket, state))
}

async fn serve(mut socket: WebSocket, state: AppState) {
	let mut notifications = state.proxy.subscribe();
	loop {
		tokio::select! {
			frame = socket.recv() => {
				let Some(Ok(frame)) = frame else {
					break;
				};
				match frame {
					Message::Text(text) => {
						let message: ClientJsonRpcMessage = match serde_json::from_str(text.as_str()) {
							Ok(m) => m,
							Err(e) => {
								tracing::debug!(error = %e, "discarding unparseable websocket frame");
								continue;
							},
						};
						if let Some(response) = state.proxy.handle_message(message).await {
							let Ok(body) = serde_json::to_string(&response) else {
								continue;
							};
							if socket.send(Message::Text(body.into())).await.is_err() {
								break;
							}
						}
					},
					Message::Close(_) => break,
					_ => {},
				}
			},
			notification = notifications.recv() => {
				match notification {
					Ok(ProxyNotification::ToolListChanged) => {
						let message = super::streamable::tools_changed_message();
						let Ok(body) = serde_json::to_string(&message) else {
							continue;
						};
						if socket.send(Message::Text(body.into())).await.is_err() {
							break;
						}
					},
					// Lagged; the next notification catches the client up.
					Err(_) => {},
				}
			},
		}
	}
}
