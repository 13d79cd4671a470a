use std::sync::Arc;

use assert_matches::assert_matches;
use rmcp::model::{ClientJsonRpcMessage, ClientRequest};
use tokio::sync::mpsc;

use super::*;
use crate::test_helpers::{tool, MockTransport};

fn client_with(
	transport: Arc<MockTransport>,
) -> (UpstreamClient, mpsc::Receiver<UpstreamEvent>) {
	let (tx, rx) = mpsc::channel(16);
	(
		UpstreamClient::new("mock".into(), transport, tx),
		rx,
	)
}

#[tokio::test]
async fn test_start_initializes_and_caches_tools() {
	let transport = MockTransport::with_tools(vec![tool("echo"), tool("sum")]);
	let (client, mut events) = client_with(transport.clone());

	client.start().await.expect("start should complete the handshake");
	assert!(client.is_connected());

	let tools = client.tools().expect("tools should be cached");
	assert_eq!(tools.len(), 2);
	assert_eq!(tools[0].name, "echo");

	// The handshake announces the protocol version to the transport and
	// follows up with notifications/initialized.
	assert!(transport.protocol_version().is_some());
	let sent = transport.sent.lock();
	assert!(sent.iter().any(|m| matches!(
		m,
		ClientJsonRpcMessage::Request(r) if matches!(r.request, ClientRequest::InitializeRequest(_))
	)));
	assert!(sent
		.iter()
		.any(|m| matches!(m, ClientJsonRpcMessage::Notification(_))));
	drop(sent);

	assert_eq!(
		events.recv().await,
		Some(UpstreamEvent::ToolsChanged("mock".into()))
	);
}

#[tokio::test]
async fn test_call_tool_forwards_result_verbatim() {
	let transport = MockTransport::with_tools(vec![tool("echo")]);
	let (client, _events) = client_with(transport);
	client.start().await.expect("start");

	let result = client
		.call_tool("echo", None)
		.await
		.expect("call should succeed");
	let rmcp::model::RawContent::Text(text) = &result.content[0].raw else {
		panic!("expected text content");
	};
	assert_eq!(text.text, "called echo");
}

#[tokio::test]
async fn test_rpc_error_is_surfaced() {
	let transport = MockTransport::new(Arc::new(|request| match request {
		ClientRequest::InitializeRequest(_) => Some(rmcp::model::ServerResult::InitializeResult(
			crate::test_helpers::test_server_info(),
		)),
		ClientRequest::ListToolsRequest(_) => Some(rmcp::model::ServerResult::ListToolsResult(
			rmcp::model::ListToolsResult {
				tools: vec![],
				next_cursor: None,
				meta: None,
			},
		)),
		_ => None,
	}));
	let (client, _events) = client_with(transport.clone());
	client.start().await.expect("start");

	// The call request gets an explicit error back.
	let inner = transport.clone();
	let call = client.call_tool("missing", None);
	let respond = async move {
		// Wait for the request to be recorded, then answer it with an
		// error envelope.
		loop {
			tokio::time::sleep(std::time::Duration::from_millis(5)).await;
			let id = {
				let sent = inner.sent.lock();
				sent.iter().rev().find_map(|m| match m {
					ClientJsonRpcMessage::Request(r)
						if matches!(r.request, ClientRequest::CallToolRequest(_)) =>
					{
						Some(r.id.clone())
					},
					_ => None,
				})
			};
			if let Some(id) = id {
				inner
					.push(rmcp::model::ServerJsonRpcMessage::Error(
						rmcp::model::JsonRpcError {
							jsonrpc: rmcp::model::JsonRpcVersion2_0,
							id,
							error: rmcp::model::ErrorData::new(
								rmcp::model::ErrorCode::METHOD_NOT_FOUND,
								"no such tool",
								None,
							),
						},
					))
					.await;
				return;
			}
		}
	};
	let (result, ()) = tokio::join!(call, respond);
	assert_matches!(result, Err(UpstreamError::Rpc(e)) if e.message.contains("no such tool"));
}

#[tokio::test]
async fn test_list_changed_refreshes_cache_without_poisoning() {
	let tools = Arc::new(parking_lot::Mutex::new(vec![tool("one")]));
	let tools_for_responder = tools.clone();
	let transport = MockTransport::new(Arc::new(move |request| match request {
		ClientRequest::InitializeRequest(_) => Some(rmcp::model::ServerResult::InitializeResult(
			crate::test_helpers::test_server_info(),
		)),
		ClientRequest::ListToolsRequest(_) => Some(rmcp::model::ServerResult::ListToolsResult(
			rmcp::model::ListToolsResult {
				tools: tools_for_responder.lock().clone(),
				next_cursor: None,
				meta: None,
			},
		)),
		_ => None,
	}));
	let (client, mut events) = client_with(transport.clone());
	client.start().await.expect("start");
	assert_eq!(
		events.recv().await,
		Some(UpstreamEvent::ToolsChanged("mock".into()))
	);
	assert_eq!(client.tools().expect("cache").len(), 1);

	// The server grows a tool and announces the change.
	tools.lock().push(tool("two"));
	transport.push_tools_changed().await;

	assert_eq!(
		events.recv().await,
		Some(UpstreamEvent::ToolsChanged("mock".into())),
		"a refresh after list_changed notifies the proxy"
	);
	assert_eq!(client.tools().expect("cache").len(), 2);
}

#[tokio::test]
async fn test_close_surfaces_closed_event() {
	let transport = MockTransport::with_tools(vec![]);
	let (client, mut events) = client_with(transport.clone());
	client.start().await.expect("start");
	let _ = events.recv().await;

	transport.close().await.expect("close");
	assert_eq!(
		events.recv().await,
		Some(UpstreamEvent::Closed("mock".into()))
	);
	assert!(!client.is_connected());
}
