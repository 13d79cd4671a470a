//! Dotenv file parsing with `$VAR` / `${VAR}` interpolation.
//!
//! Values are resolved against the union of the file's own entries and the
//! environment accumulated from earlier providers. References to undefined
//! variables resolve to the empty string; circular references terminate
//! with empty values rather than looping.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

/// Parses dotenv `contents` and resolves interpolation. `accumulated` holds
/// the values merged from earlier providers; file entries shadow it.
pub fn parse(contents: &str, accumulated: &IndexMap<String, String>) -> IndexMap<String, String> {
	let mut raw: IndexMap<String, RawValue> = IndexMap::new();
	for line in contents.lines() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		let line = line.strip_prefix("export ").unwrap_or(line);
		let Some((key, value)) = line.split_once('=') else {
			continue;
		};
		let key = key.trim();
		if key.is_empty() {
			continue;
		}
		raw.insert(key.to_string(), parse_value(value.trim()));
	}

	let mut resolved: HashMap<String, String> = HashMap::new();
	let keys: Vec<String> = raw.keys().cloned().collect();
	for key in &keys {
		let mut visiting = HashSet::new();
		let value = resolve(key, &raw, accumulated, &mut resolved, &mut visiting);
		resolved.insert(key.clone(), value);
	}

	keys
		.into_iter()
		.map(|k| {
			let v = resolved.get(&k).cloned().unwrap_or_default();
			(k, v)
		})
		.collect()
}

enum RawValue {
	/// Unquoted or double-quoted: interpolation applies.
	Interpolated(String),
	/// Single-quoted: taken literally.
	Literal(String),
}

fn parse_value(value: &str) -> RawValue {
	if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
		return RawValue::Interpolated(unescape(&value[1..value.len() - 1]));
	}
	if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
		return RawValue::Literal(value[1..value.len() - 1].to_string());
	}
	// Unquoted values lose trailing comments.
	let value = match value.find(" #") {
		Some(idx) => value[..idx].trim_end(),
		None => value,
	};
	RawValue::Interpolated(value.to_string())
}

fn unescape(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	let mut chars = value.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some('n') => out.push('\n'),
			Some('t') => out.push('\t'),
			Some('r') => out.push('\r'),
			Some('"') => out.push('"'),
			Some('\\') => out.push('\\'),
			Some(other) => {
				out.push('\\');
				out.push(other);
			},
			None => out.push('\\'),
		}
	}
	out
}

fn resolve(
	key: &str,
	raw: &IndexMap<String, RawValue>,
	accumulated: &IndexMap<String, String>,
	resolved: &mut HashMap<String, String>,
	visiting: &mut HashSet<String>,
) -> String {
	if let Some(done) = resolved.get(key) {
		return done.clone();
	}
	if !visiting.insert(key.to_string()) {
		// Circular reference; cut it off with an empty value.
		return String::new();
	}
	let value = match raw.get(key) {
		Some(RawValue::Literal(v)) => v.clone(),
		Some(RawValue::Interpolated(v)) => interpolate(v, raw, accumulated, resolved, visiting),
		None => accumulated.get(key).cloned().unwrap_or_default(),
	};
	visiting.remove(key);
	value
}

fn interpolate(
	value: &str,
	raw: &IndexMap<String, RawValue>,
	accumulated: &IndexMap<String, String>,
	resolved: &mut HashMap<String, String>,
	visiting: &mut HashSet<String>,
) -> String {
	let mut out = String::with_capacity(value.len());
	let mut rest = value;
	while let Some(dollar) = rest.find('$') {
		out.push_str(&rest[..dollar]);
		let after = &rest[dollar + 1..];
		// ${NAME} form
		if let Some(braced) = after.strip_prefix('{') {
			if let Some(end) = braced.find('}') {
				let name = &braced[..end];
				out.push_str(&resolve(name, raw, accumulated, resolved, visiting));
				rest = &braced[end + 1..];
				continue;
			}
			out.push('$');
			rest = after;
			continue;
		}
		// $NAME form
		let end = after
			.find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
			.unwrap_or(after.len());
		if end == 0 {
			out.push('$');
			rest = after;
			continue;
		}
		let name = &after[..end];
		out.push_str(&resolve(name, raw, accumulated, resolved, visiting));
		rest = &after[end..];
	}
	out.push_str(rest);
	out
}
