use assert_matches::assert_matches;

use super::*;

fn parse(json: &str) -> RawProxyConfig {
	RawProxyConfig::from_json(json).expect("config should parse")
}

#[test]
fn test_round_trip_is_identity() {
	let raw = parse(
		r#"{
			"servers": [
				{"name": "github", "command": "gh-mcp", "args": ["--stdio"]},
				{"name": "search", "transport": {"type": "sse", "url": "https://search.example/sse", "timeoutMs": 5000}},
				{"name": "notes", "transport": {"type": "streamable-http", "url": "http://notes.example/mcp", "reconnect": {"maxAttempts": 3, "backoffMultiplier": 1.5}}}
			],
			"hideTools": ["github__*_admin"],
			"alwaysVisibleTools": ["github__get_me"],
			"defaultPassthroughEnv": ["PATH"],
			"inboundAuth": {"type": "bearer", "tokens": ["secret-token"]}
		}"#,
	);
	let serialized = serde_json::to_string(&raw).expect("config should serialize");
	let reparsed = parse(&serialized);
	assert_eq!(raw, reparsed);
}

#[test]
fn test_unknown_fields_rejected() {
	let result = RawProxyConfig::from_json(r#"{"servers": [], "bogus": true}"#);
	assert!(result.is_err(), "unknown fields must be rejected");
}

#[test]
fn test_unknown_transport_variant_rejected() {
	let result = RawProxyConfig::from_json(
		r#"{"servers": [{"name": "x", "transport": {"type": "carrier-pigeon", "url": "coop://x"}}]}"#,
	);
	assert!(result.is_err(), "unknown transport types must be rejected at parse time");
}

#[test]
fn test_duplicate_server_names_rejected() {
	let raw = parse(r#"{"servers": [{"name": "a", "command": "x"}, {"name": "a", "command": "y"}]}"#);
	assert_matches!(raw.validate(), Err(ConfigError::Invalid(_)));
}

#[test]
fn test_server_requires_command_or_transport() {
	let raw = parse(r#"{"servers": [{"name": "a"}]}"#);
	assert_matches!(raw.validate(), Err(ConfigError::Invalid(_)));
}

#[test]
fn test_server_rejects_command_and_transport() {
	let raw = parse(
		r#"{"servers": [{"name": "a", "command": "x", "transport": {"type": "sse", "url": "https://x.example"}}]}"#,
	);
	assert_matches!(raw.validate(), Err(ConfigError::Invalid(_)));
}

#[test]
fn test_command_shorthand_becomes_stdio_transport() {
	let cfg = parse(r#"{"servers": [{"name": "a", "command": "server-bin", "args": ["--flag"]}]}"#)
		.validate()
		.expect("config should validate");
	let spec = cfg.servers.get("a").expect("server a");
	assert_matches!(
		&spec.transport,
		TransportConfig::Stdio { command, args, .. } if command == "server-bin" && args == &vec!["--flag".to_string()]
	);
}

#[test]
fn test_invalid_timeout_rejected() {
	let raw = parse(
		r#"{"servers": [{"name": "a", "transport": {"type": "sse", "url": "https://x.example", "timeoutMs": 0}}]}"#,
	);
	assert_matches!(raw.validate(), Err(ConfigError::Invalid(_)));
}

#[test]
fn test_backoff_multiplier_must_exceed_one() {
	let raw = parse(
		r#"{"servers": [{"name": "a", "transport": {"type": "websocket", "url": "wss://x.example", "reconnect": {"backoffMultiplier": 1.0}}}]}"#,
	);
	assert_matches!(raw.validate(), Err(ConfigError::Invalid(_)));
}

#[test]
fn test_streamable_http_rejects_non_http_scheme() {
	let raw = parse(
		r#"{"servers": [{"name": "a", "transport": {"type": "streamable-http", "url": "ws://x.example"}}]}"#,
	);
	assert_matches!(raw.validate(), Err(ConfigError::Invalid(_)));
}

#[test]
fn test_bearer_inbound_auth_requires_tokens() {
	let raw = parse(r#"{"inboundAuth": {"type": "bearer", "tokens": []}}"#);
	assert_matches!(raw.validate(), Err(ConfigError::InboundAuth(_)));
}

#[test]
fn test_inbound_auth_unresolved_var_is_fatal() {
	let raw = parse(
		r#"{"inboundAuth": {"type": "bearer", "tokens": ["${MANIFOLD_TEST_THIS_VAR_DOES_NOT_EXIST}"]}}"#,
	);
	assert_matches!(raw.validate(), Err(ConfigError::InboundAuth(_)));
}

#[test]
fn test_auth_endpoint_must_be_absolute_url() {
	let raw = parse(
		r#"{"servers": [{"name": "a", "transport": {"type": "sse", "url": "https://x.example"},
			"auth": {"type": "oauth2-client", "clientId": "id", "clientSecret": "sec", "tokenEndpoint": "/token"}}]}"#,
	);
	assert_matches!(raw.validate(), Err(ConfigError::Invalid(_)));
}

#[test]
fn test_auth_unresolved_var_is_fatal() {
	let raw = parse(
		r#"{"servers": [{"name": "a", "transport": {"type": "sse", "url": "https://x.example"},
			"auth": {"type": "bearer", "token": "${MANIFOLD_TEST_THIS_VAR_DOES_NOT_EXIST}"}}]}"#,
	);
	assert_matches!(raw.validate(), Err(ConfigError::UnresolvedEnv(_)));
}

#[test]
fn test_env_expansion() {
	let vars = std::collections::HashMap::from([("HOME".to_string(), "/home/u".to_string())]);
	assert_eq!(
		env::expand_map("${HOME}/bin", &vars).expect("expansion should succeed"),
		"/home/u/bin"
	);
	assert_eq!(
		env::expand_map("no refs here", &vars).expect("expansion should succeed"),
		"no refs here"
	);
	// An unterminated reference is kept literally.
	assert_eq!(
		env::expand_map("${HOME", &vars).expect("expansion should succeed"),
		"${HOME"
	);
	assert_matches!(
		env::expand_map("${MISSING}", &vars),
		Err(ConfigError::UnresolvedEnv(name)) if name == "MISSING"
	);
}
