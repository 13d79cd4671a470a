//! Tool visibility: static expose/hide/always-visible patterns plus the
//! runtime-mutable dynamic enable set.
//!
//! Patterns support a `*` wildcard and match against the namespaced tool
//! name (`server__tool`). Decision order for a namespaced name:
//! 1. in the dynamic enable set -> visible
//! 2. matches `alwaysVisibleTools` -> visible (overrides expose and hide)
//! 3. `exposeTools` defined -> visible iff it matches (it wins over
//!    `hideTools`); otherwise visible unless `hideTools` matches

use crate::config::ProxyConfig;
use crate::Strng;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolMatcher {
	pattern: String,
	segments: Vec<String>,
}

impl ToolMatcher {
	pub fn new(pattern: impl Into<String>) -> Self {
		let pattern = pattern.into();
		let segments = pattern.split('*').map(str::to_string).collect();
		Self { pattern, segments }
	}

	pub fn pattern(&self) -> &str {
		&self.pattern
	}

	pub fn matches(&self, name: &str) -> bool {
		match self.segments.as_slice() {
			[] => name.is_empty(),
			[exact] => name == exact,
			[first, middle @ .., last] => {
				let Some(mut rest) = name.strip_prefix(first.as_str()) else {
					return false;
				};
				let Some(tail) = rest.strip_suffix(last.as_str()) else {
					return false;
				};
				rest = tail;
				for segment in middle {
					match rest.find(segment.as_str()) {
						Some(idx) => rest = &rest[idx + segment.len()..],
						None => return false,
					}
				}
				true
			},
		}
	}
}

pub fn matches_any(patterns: &[ToolMatcher], name: &str) -> bool {
	patterns.iter().any(|p| p.matches(name))
}

/// Runtime-mutable set of patterns that are visible regardless of the
/// static rules. Each entry records the source that enabled it.
#[derive(Debug, Default)]
pub struct DynamicEnableSet {
	entries: Vec<(ToolMatcher, Strng)>,
}

impl DynamicEnableSet {
	pub fn add(&mut self, pattern: &str, source: impl AsRef<str>) {
		let source = crate::strng::new(source);
		if self
			.entries
			.iter()
			.any(|(m, s)| m.pattern() == pattern && *s == source)
		{
			return;
		}
		tracing::debug!(pattern = %pattern, source = %source, "dynamically enabling tools");
		self.entries.push((ToolMatcher::new(pattern), source));
	}

	pub fn remove_source(&mut self, source: &str) {
		self.entries.retain(|(_, s)| s.as_str() != source);
	}

	pub fn contains(&self, name: &str) -> bool {
		self.entries.iter().any(|(m, _)| m.matches(name))
	}
}

#[derive(Debug, Default)]
pub struct VisibilityPolicy {
	expose: Option<Vec<ToolMatcher>>,
	hide: Vec<ToolMatcher>,
	always: Vec<ToolMatcher>,
	expose_core: Option<Vec<ToolMatcher>>,
}

impl VisibilityPolicy {
	pub fn from_config(cfg: &ProxyConfig) -> Self {
		let compile = |patterns: &[String]| patterns.iter().map(ToolMatcher::new).collect::<Vec<_>>();
		Self {
			expose: cfg.expose_tools.as_deref().map(compile),
			hide: compile(&cfg.hide_tools),
			always: compile(&cfg.always_visible_tools),
			expose_core: cfg.expose_core_tools.as_deref().map(compile),
		}
	}

	pub fn is_visible(&self, name: &str, dynamic: &DynamicEnableSet) -> bool {
		if dynamic.contains(name) {
			return true;
		}
		if matches_any(&self.always, name) {
			return true;
		}
		match &self.expose {
			Some(expose) => matches_any(expose, name),
			None => !matches_any(&self.hide, name),
		}
	}

	/// Core (first-party) tools are gated separately: an undefined list
	/// exposes all of them, an empty list none.
	pub fn core_tool_visible(&self, name: &str) -> bool {
		match &self.expose_core {
			None => true,
			Some(patterns) => matches_any(patterns, name),
		}
	}
}
