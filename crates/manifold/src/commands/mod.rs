//! First-party "commands": in-process tool providers hosted by the proxy.
//!
//! A command contributes tools to the core tool set (gated by
//! `exposeCoreTools`), can be invoked from the CLI, and may declare
//! dependencies on configured upstream servers which it checks at
//! tool-invocation time through [`CommandContext`].

use std::sync::Arc;

use indexmap::IndexMap;
use rmcp::model::{CallToolResult, Content, ErrorData, JsonObject, Tool};

use crate::Strng;

#[cfg(test)]
#[path = "commands_tests.rs"]
mod tests;

/// A dependency on an upstream server, matched by any of `aliases`.
/// Aliases are compared case-sensitively.
#[derive(Clone, Debug, Default)]
pub struct ServerDependency {
	pub aliases: Vec<String>,
	/// When true and a matching upstream is connected, the pattern
	/// `{alias}__*` is added to the dynamic enable set.
	pub ensure_tools_exposed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DependencyStatus {
	pub configured: bool,
}

#[derive(Clone, Debug)]
pub struct UpstreamStatus {
	pub name: Strng,
	pub state: String,
	pub tool_count: Option<usize>,
}

/// The proxy-side queries available to commands.
#[async_trait::async_trait]
pub trait ProxyContext: Send + Sync {
	/// True when any alias names an upstream present in the configuration.
	fn require_server_configured(&self, dep: &ServerDependency) -> DependencyStatus;

	/// True when any alias names a currently connected upstream. Applies
	/// the `ensure_tools_exposed` side effect on a match.
	async fn require_server_connected(&self, dep: &ServerDependency) -> DependencyStatus;

	fn upstream_summary(&self) -> Vec<UpstreamStatus>;
}

/// Carried into every command execution. `proxy` is absent when the
/// command runs outside a proxy (e.g. standalone CLI use).
#[derive(Clone, Default)]
pub struct CommandContext {
	pub proxy: Option<Arc<dyn ProxyContext>>,
}

impl CommandContext {
	pub fn require_server_configured(&self, dep: &ServerDependency) -> Option<DependencyStatus> {
		self.proxy.as_ref().map(|p| p.require_server_configured(dep))
	}

	pub async fn require_server_connected(&self, dep: &ServerDependency) -> Option<DependencyStatus> {
		match self.proxy.as_ref() {
			Some(p) => Some(p.require_server_connected(dep).await),
			None => None,
		}
	}
}

#[async_trait::async_trait]
pub trait Command: Send + Sync {
	fn name(&self) -> &str;

	fn description(&self) -> &str;

	/// The tools this command contributes to the core tool set.
	fn mcp_definitions(&self) -> Vec<Tool>;

	async fn execute_tool_via_mcp(
		&self,
		tool: &str,
		arguments: Option<JsonObject>,
		ctx: &CommandContext,
	) -> Result<CallToolResult, ErrorData>;

	async fn execute_via_cli(&self, args: Vec<String>, ctx: &CommandContext) -> anyhow::Result<()>;

	fn server_dependencies(&self) -> Vec<ServerDependency> {
		Vec::new()
	}
}

/// Hosts commands and routes core tool calls to their owners.
#[derive(Default)]
pub struct CommandRegistry {
	commands: IndexMap<Strng, Arc<dyn Command>>,
	tool_owners: IndexMap<String, Strng>,
}

impl std::fmt::Debug for CommandRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CommandRegistry")
			.field("commands", &self.commands.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl CommandRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, command: Arc<dyn Command>) {
		let name = crate::strng::new(command.name());
		for tool in command.mcp_definitions() {
			self.tool_owners.insert(tool.name.to_string(), name.clone());
		}
		self.commands.insert(name, command);
	}

	pub fn get(&self, name: &str) -> Option<&Arc<dyn Command>> {
		self.commands.get(name)
	}

	/// All core tool definitions, in registration order.
	pub fn definitions(&self) -> Vec<Tool> {
		self
			.commands
			.values()
			.flat_map(|c| c.mcp_definitions())
			.collect()
	}

	pub fn owns_tool(&self, tool: &str) -> bool {
		self.tool_owners.contains_key(tool)
	}

	pub async fn execute(
		&self,
		tool: &str,
		arguments: Option<JsonObject>,
		ctx: &CommandContext,
	) -> Result<CallToolResult, ErrorData> {
		let command = self
			.tool_owners
			.get(tool)
			.and_then(|name| self.commands.get(name))
			.ok_or_else(|| {
				ErrorData::new(
					rmcp::model::ErrorCode::METHOD_NOT_FOUND,
					format!("unknown tool: {tool}"),
					None,
				)
			})?;
		command.execute_tool_via_mcp(tool, arguments, ctx).await
	}
}

/// Built-in command reporting the configured upstreams and their
/// connection state.
#[derive(Debug, Default)]
pub struct StatusCommand;

pub const STATUS_TOOL: &str = "status";

#[async_trait::async_trait]
impl Command for StatusCommand {
	fn name(&self) -> &str {
		"status"
	}

	fn description(&self) -> &str {
		"Report configured upstream servers and their connection state"
	}

	fn mcp_definitions(&self) -> Vec<Tool> {
		vec![Tool::new(
			STATUS_TOOL,
			self.description().to_string(),
			empty_object_schema(),
		)]
	}

	async fn execute_tool_via_mcp(
		&self,
		tool: &str,
		_arguments: Option<JsonObject>,
		ctx: &CommandContext,
	) -> Result<CallToolResult, ErrorData> {
		if tool != STATUS_TOOL {
			return Err(ErrorData::new(
				rmcp::model::ErrorCode::METHOD_NOT_FOUND,
				format!("unknown tool: {tool}"),
				None,
			));
		}
		let summary = self.render(ctx);
		Ok(CallToolResult::success(vec![Content::text(summary)]))
	}

	async fn execute_via_cli(&self, _args: Vec<String>, ctx: &CommandContext) -> anyhow::Result<()> {
		println!("{}", self.render(ctx));
		Ok(())
	}
}

impl StatusCommand {
	fn render(&self, ctx: &CommandContext) -> String {
		let Some(proxy) = ctx.proxy.as_ref() else {
			return "no proxy context available".to_string();
		};
		let statuses = proxy.upstream_summary();
		if statuses.is_empty() {
			return "no upstream servers configured".to_string();
		}
		statuses
			.iter()
			.map(|s| {
				let tools = s
					.tool_count
					.map(|n| format!(", {n} tools"))
					.unwrap_or_default();
				format!("{}: {}{}", s.name, s.state, tools)
			})
			.collect::<Vec<_>>()
			.join("\n")
	}
}

pub(crate) fn empty_object_schema() -> Arc<JsonObject> {
	let serde_json::Value::Object(map) = serde_json::json!({
		"type": "object",
		"properties": {},
	}) else {
		unreachable!("literal is an object")
	};
	Arc::new(map)
}
