//! Shared fixtures for unit tests: an in-process transport with a
//! scriptable server side.

use std::sync::Arc;

use parking_lot::Mutex;
use rmcp::model::{
	ClientJsonRpcMessage, ClientRequest, Implementation, InitializeResult, JsonRpcResponse,
	JsonRpcVersion2_0, ListToolsResult, ProtocolVersion, RequestId, ServerCapabilities,
	ServerJsonRpcMessage, ServerResult, Tool, ToolsCapability,
};
use tokio::sync::mpsc;

use crate::transport::{ConnectionState, Transport, TransportError, TransportEvent};

pub fn tool(name: &str) -> Tool {
	Tool::new(
		name.to_string(),
		format!("test tool {name}"),
		crate::commands::empty_object_schema(),
	)
}

type Responder =
	Arc<dyn Fn(&ClientRequest) -> Option<ServerResult> + Send + Sync + 'static>;

/// A transport whose "server" is a closure. Requests are answered through
/// `responder`; everything sent is recorded.
pub struct MockTransport {
	state: Mutex<ConnectionState>,
	events_tx: mpsc::Sender<TransportEvent>,
	events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
	protocol_version: Mutex<Option<String>>,
	pub sent: Mutex<Vec<ClientJsonRpcMessage>>,
	responder: Responder,
}

impl std::fmt::Debug for MockTransport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MockTransport").finish()
	}
}

impl MockTransport {
	pub fn new(responder: Responder) -> Arc<Self> {
		let (events_tx, events_rx) = mpsc::channel(64);
		Arc::new(Self {
			state: Mutex::new(ConnectionState::Idle),
			events_tx,
			events_rx: Mutex::new(Some(events_rx)),
			protocol_version: Mutex::new(None),
			sent: Mutex::new(Vec::new()),
			responder,
		})
	}

	/// A transport serving `tools` with default initialize/call behavior.
	pub fn with_tools(tools: Vec<Tool>) -> Arc<Self> {
		let tools = Arc::new(Mutex::new(tools));
		Self::new(Arc::new(move |request| match request {
			ClientRequest::InitializeRequest(_) => {
				Some(ServerResult::InitializeResult(test_server_info()))
			},
			ClientRequest::ListToolsRequest(_) => Some(ServerResult::ListToolsResult(ListToolsResult {
				tools: tools.lock().clone(),
				next_cursor: None,
				meta: None,
			})),
			ClientRequest::CallToolRequest(r) => Some(ServerResult::CallToolResult(
				rmcp::model::CallToolResult::success(vec![rmcp::model::Content::text(format!(
					"called {}",
					r.params.name
				))]),
			)),
			_ => None,
		}))
	}

	/// Pushes a server-initiated message at the owner.
	pub async fn push(&self, message: ServerJsonRpcMessage) {
		let _ = self.events_tx.send(TransportEvent::Message(message)).await;
	}

	pub async fn push_tools_changed(&self) {
		self
			.push(ServerJsonRpcMessage::notification(
				rmcp::model::ToolListChangedNotification {
					method: Default::default(),
					extensions: Default::default(),
				}
				.into(),
			))
			.await;
	}
}

pub fn test_server_info() -> InitializeResult {
	InitializeResult {
		protocol_version: ProtocolVersion::V_2025_06_18,
		capabilities: ServerCapabilities {
			completions: None,
			experimental: None,
			logging: None,
			prompts: None,
			resources: None,
			tools: Some(ToolsCapability {
				list_changed: Some(true),
			}),
		},
		server_info: Implementation {
			name: "mock".to_string(),
			version: "0.0.0".to_string(),
			..Default::default()
		},
		instructions: None,
	}
}

#[async_trait::async_trait]
impl Transport for MockTransport {
	async fn start(&self) -> Result<(), TransportError> {
		{
			let mut state = self.state.lock();
			if matches!(*state, ConnectionState::Closed | ConnectionState::Failed) {
				return Err(TransportError::restart_after_close());
			}
			*state = ConnectionState::Connected;
		}
		let _ = self.events_tx.send(TransportEvent::Ready).await;
		Ok(())
	}

	async fn close(&self) -> Result<(), TransportError> {
		{
			let mut state = self.state.lock();
			if matches!(*state, ConnectionState::Closed) {
				return Ok(());
			}
			*state = ConnectionState::Closed;
		}
		let _ = self.events_tx.send(TransportEvent::Closed).await;
		Ok(())
	}

	async fn send(&self, message: ClientJsonRpcMessage) -> Result<(), TransportError> {
		if !matches!(*self.state.lock(), ConnectionState::Connected) {
			return Err(TransportError::not_started());
		}
		self.sent.lock().push(message.clone());
		if let ClientJsonRpcMessage::Request(r) = &message
			&& let Some(result) = (self.responder)(&r.request)
		{
			let response = ServerJsonRpcMessage::Response(JsonRpcResponse {
				jsonrpc: JsonRpcVersion2_0,
				id: r.id.clone(),
				result,
			});
			let _ = self.events_tx.send(TransportEvent::Message(response)).await;
		}
		Ok(())
	}

	fn state(&self) -> ConnectionState {
		*self.state.lock()
	}

	fn session_id(&self) -> Option<String> {
		None
	}

	fn protocol_version(&self) -> Option<String> {
		self.protocol_version.lock().clone()
	}

	fn set_protocol_version(&self, version: String) {
		*self.protocol_version.lock() = Some(version);
	}

	fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
		self.events_rx.lock().take()
	}
}

/// A request id for hand-built messages.
pub fn rid(n: u32) -> RequestId {
	RequestId::Number(n.into())
}
