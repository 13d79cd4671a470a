use std::sync::Arc;

use super::*;
use rmcp::model::CallToolResult;

struct FakeCommand;

#[async_trait::async_trait]
impl Command for FakeCommand {
	fn name(&self) -> &str {
		"fake"
	}

	fn description(&self) -> &str {
		"a test command"
	}

	fn mcp_definitions(&self) -> Vec<Tool> {
		vec![
			Tool::new("fake_one", "first fake tool", empty_object_schema()),
			Tool::new("fake_two", "second fake tool", empty_object_schema()),
		]
	}

	async fn execute_tool_via_mcp(
		&self,
		tool: &str,
		_arguments: Option<JsonObject>,
		_ctx: &CommandContext,
	) -> Result<CallToolResult, ErrorData> {
		Ok(CallToolResult::success(vec![Content::text(format!(
			"ran {tool}"
		))]))
	}

	async fn execute_via_cli(&self, _args: Vec<String>, _ctx: &CommandContext) -> anyhow::Result<()> {
		Ok(())
	}

	fn server_dependencies(&self) -> Vec<ServerDependency> {
		vec![ServerDependency {
			aliases: vec!["backend".to_string()],
			ensure_tools_exposed: true,
		}]
	}
}

fn registry() -> CommandRegistry {
	let mut registry = CommandRegistry::new();
	registry.register(Arc::new(StatusCommand));
	registry.register(Arc::new(FakeCommand));
	registry
}

#[test]
fn test_definitions_compose_in_registration_order() {
	let registry = registry();
	let names: Vec<_> = registry
		.definitions()
		.iter()
		.map(|t| t.name.to_string())
		.collect();
	assert_eq!(names, vec!["status", "fake_one", "fake_two"]);
}

#[test]
fn test_tool_ownership() {
	let registry = registry();
	assert!(registry.owns_tool("fake_one"));
	assert!(registry.owns_tool("status"));
	assert!(!registry.owns_tool("github__echo"));
}

#[tokio::test]
async fn test_execute_routes_to_owning_command() {
	let registry = registry();
	let ctx = CommandContext::default();
	let result = registry
		.execute("fake_two", None, &ctx)
		.await
		.expect("execution should succeed");
	let rmcp::model::RawContent::Text(text) = &result.content[0].raw else {
		panic!("expected text content");
	};
	assert_eq!(text.text, "ran fake_two");
}

#[tokio::test]
async fn test_execute_unknown_tool_fails() {
	let registry = registry();
	let ctx = CommandContext::default();
	let err = registry
		.execute("missing", None, &ctx)
		.await
		.expect_err("unknown tools must be rejected");
	assert_eq!(err.code, rmcp::model::ErrorCode::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_status_without_proxy_context() {
	let registry = registry();
	let ctx = CommandContext::default();
	let result = registry
		.execute(STATUS_TOOL, None, &ctx)
		.await
		.expect("status should run without a proxy");
	let rmcp::model::RawContent::Text(text) = &result.content[0].raw else {
		panic!("expected text content");
	};
	assert!(text.text.contains("no proxy context"));
}

#[tokio::test]
async fn test_execute_via_cli_runs_without_proxy() {
	let ctx = CommandContext::default();
	StatusCommand
		.execute_via_cli(Vec::new(), &ctx)
		.await
		.expect("cli execution should succeed");
}

#[tokio::test]
async fn test_dependency_queries_absent_without_proxy() {
	let ctx = CommandContext::default();
	let dep = ServerDependency {
		aliases: vec!["backend".to_string()],
		ensure_tools_exposed: false,
	};
	assert!(ctx.require_server_configured(&dep).is_none());
	assert!(ctx.require_server_connected(&dep).await.is_none());
}
