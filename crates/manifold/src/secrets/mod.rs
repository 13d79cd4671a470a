//! Secret resolution: merges an ordered provider chain into the
//! environment injected into each upstream.
//!
//! Precedence is strictly later-wins:
//! 1. `defaultPassthroughEnv` read from the ambient process environment
//! 2. `defaultSecretProviders` in declared order
//! 3. the upstream's own `secretProviders` in declared order
//! 4. the upstream's inline `env`

pub mod dotenv;

use indexmap::IndexMap;

use crate::config::{ProxyConfig, SecretProviderConfig, UpstreamServerSpec};

#[cfg(test)]
#[path = "secrets_tests.rs"]
mod tests;

/// Resolves the environment for one upstream.
pub async fn resolve(
	spec: &UpstreamServerSpec,
	config: &ProxyConfig,
) -> IndexMap<String, String> {
	let mut merged: IndexMap<String, String> = IndexMap::new();

	for name in &config.default_passthrough_env {
		if let Ok(value) = std::env::var(name) {
			merged.insert(name.clone(), value);
		}
	}

	for provider in &config.default_secret_providers {
		apply_provider(provider, &mut merged).await;
	}
	for provider in &spec.secret_providers {
		apply_provider(provider, &mut merged).await;
	}

	for (k, v) in &spec.env {
		merged.insert(k.clone(), v.clone());
	}

	merged
}

async fn apply_provider(provider: &SecretProviderConfig, merged: &mut IndexMap<String, String>) {
	match provider {
		SecretProviderConfig::Dotenv { path, encoding } => {
			let contents = match tokio::fs::read(path).await {
				Ok(bytes) => decode(bytes, encoding.as_deref()),
				Err(e) => {
					// A missing dotenv file is not fatal; the provider
					// contributes nothing.
					tracing::warn!(path = %path, error = %e, "dotenv file not readable; skipping");
					return;
				},
			};
			let parsed = dotenv::parse(&contents, merged);
			merged.extend(parsed);
		},
		SecretProviderConfig::Process {
			prefix,
			allowlist,
			blocklist,
		} => {
			for (name, value) in std::env::vars() {
				if let Some(prefix) = prefix
					&& !name.starts_with(prefix.as_str())
				{
					continue;
				}
				if let Some(allow) = allowlist
					&& !allow.iter().any(|a| a == &name)
				{
					continue;
				}
				// The blocklist wins over the allowlist.
				if let Some(block) = blocklist
					&& block.iter().any(|b| b == &name)
				{
					continue;
				}
				// The full variable name is preserved; a prefix filter does
				// not strip the prefix from the emitted key.
				merged.insert(name, value);
			}
		},
		SecretProviderConfig::Inline { values } => {
			for (k, v) in values {
				merged.insert(k.clone(), v.clone());
			}
		},
	}
}

fn decode(bytes: Vec<u8>, encoding: Option<&str>) -> String {
	match encoding {
		None | Some("utf-8") | Some("utf8") => String::from_utf8_lossy(&bytes).into_owned(),
		Some(other) => {
			tracing::warn!(encoding = %other, "unsupported dotenv encoding; decoding as utf-8");
			String::from_utf8_lossy(&bytes).into_owned()
		},
	}
}
