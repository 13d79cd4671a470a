pub mod auth;
#[cfg(test)]
pub(crate) mod test_helpers;
pub mod commands;
pub mod config;
pub mod http;
pub mod proxy;
pub mod secrets;
pub mod strng;
pub mod transport;
pub mod upstream;

pub use strng::Strng;

/// Delimiter between the upstream name and the tool name in the
/// externally visible tool fingerprint, e.g. `github__create_issue`.
pub const TOOL_DELIMITER: &str = "__";

/// Splits a namespaced tool name into `(upstream, tool)`.
pub fn split_tool_name(name: &str) -> Option<(&str, &str)> {
	name.split_once(TOOL_DELIMITER)
}

/// Joins an upstream name and a tool name into the namespaced form.
pub fn join_tool_name(upstream: &str, tool: &str) -> String {
	format!("{upstream}{TOOL_DELIMITER}{tool}")
}
