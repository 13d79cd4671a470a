use std::sync::Arc;

use axum::body::Body;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use secrecy::SecretString;
use tower::ServiceExt;

use super::*;
use crate::commands::CommandRegistry;
use crate::config::{InboundAuth, ProxyConfig};
use crate::transport::HEADER_SESSION_ID;

fn state(inbound: InboundAuth) -> AppState {
	let proxy = crate::proxy::Proxy::new(ProxyConfig::default(), CommandRegistry::new());
	AppState {
		proxy,
		sessions: SessionManager::new(),
		gate: Arc::new(AuthGate::new(&inbound)),
		oauth: oauth::MemoryAuthServerStore::new(),
	}
}

fn bearer(tokens: &[&str]) -> InboundAuth {
	InboundAuth::Bearer(
		tokens
			.iter()
			.map(|t| SecretString::from(t.to_string()))
			.collect(),
	)
}

async fn body_string(response: axum::response::Response) -> String {
	let bytes = response
		.into_body()
		.collect()
		.await
		.expect("body collects")
		.to_bytes();
	String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn test_health_is_unauthenticated() {
	let router = build_router(state(bearer(&["tok"])));
	let response = router
		.oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
		.await
		.expect("request");
	assert_eq!(response.status(), StatusCode::OK);
	assert!(body_string(response).await.contains("ok"));
}

#[tokio::test]
async fn test_streamable_health_requires_bearer() {
	let router = build_router(state(bearer(&["tok"])));

	let response = router
		.clone()
		.oneshot(
			Request::builder()
				.uri("/api/streamable/health")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.expect("request");
	assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
	assert!(response.headers().contains_key(http::header::WWW_AUTHENTICATE));

	let response = router
		.clone()
		.oneshot(
			Request::builder()
				.uri("/api/streamable/health")
				.header(http::header::AUTHORIZATION, "Bearer tok")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.expect("request");
	assert_eq!(response.status(), StatusCode::OK);

	let response = router
		.oneshot(
			Request::builder()
				.uri("/api/streamable/health")
				.header(http::header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.expect("request");
	assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
	assert!(
		body_string(response)
			.await
			.contains("Invalid Authorization header format. Expected: Bearer <token>")
	);
}

fn initialize_body() -> String {
	serde_json::json!({
		"jsonrpc": "2.0",
		"id": 1,
		"method": "initialize",
		"params": {
			"protocolVersion": "2025-06-18",
			"capabilities": {},
			"clientInfo": {"name": "test-host", "version": "0"}
		}
	})
	.to_string()
}

fn mcp_post(body: String, session: Option<&str>) -> Request<Body> {
	let mut builder = Request::builder()
		.method("POST")
		.uri("/api/streamable/mcp")
		.header(http::header::ACCEPT, "application/json, text/event-stream")
		.header(http::header::CONTENT_TYPE, "application/json");
	if let Some(session) = session {
		builder = builder.header(HEADER_SESSION_ID, session);
	}
	builder.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn test_initialize_creates_session() {
	let router = build_router(state(InboundAuth::None));
	let response = router
		.oneshot(mcp_post(initialize_body(), None))
		.await
		.expect("request");
	assert_eq!(response.status(), StatusCode::OK);
	assert!(
		response.headers().contains_key(HEADER_SESSION_ID),
		"initialize must mint a session id"
	);
	let body = body_string(response).await;
	assert!(body.contains("serverInfo"));
}

#[tokio::test]
async fn test_non_initialize_without_session_rejected() {
	let router = build_router(state(InboundAuth::None));
	let body = serde_json::json!({
		"jsonrpc": "2.0",
		"id": 2,
		"method": "tools/list"
	})
	.to_string();
	let response = router.oneshot(mcp_post(body, None)).await.expect("request");
	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_session_rejected() {
	let router = build_router(state(InboundAuth::None));
	let body = serde_json::json!({
		"jsonrpc": "2.0",
		"id": 2,
		"method": "tools/list"
	})
	.to_string();
	let response = router
		.oneshot(mcp_post(body, Some("not-a-session")))
		.await
		.expect("request");
	assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_post_requires_accept_header() {
	let router = build_router(state(InboundAuth::None));
	let request = Request::builder()
		.method("POST")
		.uri("/api/streamable/mcp")
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Body::from(initialize_body()))
		.unwrap();
	let response = router.oneshot(request).await.expect("request");
	assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
}

#[tokio::test]
async fn test_session_lifecycle_via_delete() {
	let router = build_router(state(InboundAuth::None));
	let response = router
		.clone()
		.oneshot(mcp_post(initialize_body(), None))
		.await
		.expect("request");
	let session = response
		.headers()
		.get(HEADER_SESSION_ID)
		.and_then(|v| v.to_str().ok())
		.expect("session id")
		.to_string();

	// Follow-up request on the session works.
	let body = serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}).to_string();
	let response = router
		.clone()
		.oneshot(mcp_post(body.clone(), Some(&session)))
		.await
		.expect("request");
	assert_eq!(response.status(), StatusCode::OK);

	// DELETE ends it.
	let response = router
		.clone()
		.oneshot(
			Request::builder()
				.method("DELETE")
				.uri("/api/streamable/mcp")
				.header(HEADER_SESSION_ID, session.clone())
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.expect("request");
	assert_eq!(response.status(), StatusCode::ACCEPTED);

	let response = router
		.oneshot(mcp_post(body, Some(&session)))
		.await
		.expect("request");
	assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_oauth_callback_requires_state_and_code() {
	let router = build_router(state(InboundAuth::None));
	let response = router
		.oneshot(
			Request::builder()
				.uri("/api/oauth/callback")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.expect("request");
	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rotate_secret_round_trips_through_store() {
	let router = build_router(state(InboundAuth::None));
	let response = router
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/api/oauth/client/my-client/rotate-secret")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.expect("request");
	assert_eq!(response.status(), StatusCode::OK);
	assert!(body_string(response).await.contains("clientSecret"));
}
