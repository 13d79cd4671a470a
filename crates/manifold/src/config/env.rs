//! `${VAR}` expansion for configuration values.
//!
//! Both the auth construction path and the inbound token list resolve
//! environment references through this single entry point, so a missing
//! variable fails the load instead of surfacing later as a bad credential.

use std::collections::HashMap;

use super::ConfigError;

/// Expands `${VAR}` references in `input` against `lookup`.
/// An unresolved reference is fatal.
pub fn expand(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
	let mut out = String::with_capacity(input.len());
	let mut rest = input;
	while let Some(start) = rest.find("${") {
		out.push_str(&rest[..start]);
		let after = &rest[start + 2..];
		let Some(end) = after.find('}') else {
			// No closing brace; keep the literal text.
			out.push_str(&rest[start..]);
			return Ok(out);
		};
		let name = &after[..end];
		match lookup(name) {
			Some(v) => out.push_str(&v),
			None => return Err(ConfigError::UnresolvedEnv(name.to_string())),
		}
		rest = &after[end + 1..];
	}
	out.push_str(rest);
	Ok(out)
}

/// Expands `${VAR}` against the ambient process environment.
pub fn expand_process(input: &str) -> Result<String, ConfigError> {
	expand(input, &|name| std::env::var(name).ok())
}

/// Expands `${VAR}` against an explicit map. Used by tests and by callers
/// that already resolved an environment snapshot.
pub fn expand_map(input: &str, vars: &HashMap<String, String>) -> Result<String, ConfigError> {
	expand(input, &|name| vars.get(name).cloned())
}
