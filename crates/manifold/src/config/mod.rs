//! Proxy configuration model.
//!
//! `RawProxyConfig` represents the JSON a user can pass in; `ProxyConfig` is
//! the validated internal representation. Validation happens once, at load:
//! schema shape via serde (`deny_unknown_fields`, tagged unions that refuse
//! unknown variants), transport rules via the transport factory, and `${VAR}`
//! resolution via [`env::expand`].

pub mod env;

use std::path::Path;

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Strng;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_json::Error),
	#[error("invalid configuration: {0}")]
	Invalid(String),
	#[error("unresolved environment variable: ${{{0}}}")]
	UnresolvedEnv(String),
	#[error("inbound auth misconfigured: {0}")]
	InboundAuth(String),
}

/// Reconnection policy for network transports.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReconnectConfig {
	/// Maximum number of reconnection attempts. 0 disables reconnection.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_attempts: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub initial_delay_ms: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_delay_ms: Option<u64>,
	/// Must be strictly greater than 1.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub backoff_multiplier: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportConfig {
	#[serde(rename_all = "camelCase")]
	Stdio {
		command: String,
		#[serde(default, skip_serializing_if = "Vec::is_empty")]
		args: Vec<String>,
		#[serde(default, skip_serializing_if = "IndexMap::is_empty")]
		env: IndexMap<String, String>,
	},
	#[serde(rename_all = "camelCase")]
	Sse {
		url: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		timeout_ms: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		reconnect: Option<ReconnectConfig>,
	},
	#[serde(rename_all = "camelCase")]
	Websocket {
		url: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		timeout_ms: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		reconnect: Option<ReconnectConfig>,
	},
	#[serde(rename_all = "camelCase")]
	StreamableHttp {
		url: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		session_id: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		timeout_ms: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		reconnect: Option<ReconnectConfig>,
	},
}

impl TransportConfig {
	pub fn kind(&self) -> TransportKind {
		match self {
			TransportConfig::Stdio { .. } => TransportKind::Stdio,
			TransportConfig::Sse { .. } => TransportKind::Sse,
			TransportConfig::Websocket { .. } => TransportKind::Websocket,
			TransportConfig::StreamableHttp { .. } => TransportKind::StreamableHttp,
		}
	}
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
	Stdio,
	Sse,
	Websocket,
	StreamableHttp,
}

impl std::fmt::Display for TransportKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			TransportKind::Stdio => write!(f, "stdio"),
			TransportKind::Sse => write!(f, "sse"),
			TransportKind::Websocket => write!(f, "websocket"),
			TransportKind::StreamableHttp => write!(f, "streamable-http"),
		}
	}
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthProviderConfig {
	None {},
	#[serde(rename_all = "camelCase")]
	Bearer { token: String },
	#[serde(rename_all = "camelCase")]
	Oauth2Client {
		client_id: String,
		client_secret: String,
		token_endpoint: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		scope: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		audience: Option<String>,
	},
	#[serde(rename_all = "camelCase")]
	Oauth2Code {
		client_id: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		client_secret: Option<String>,
		authorization_endpoint: String,
		token_endpoint: String,
		redirect_uri: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		scope: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		audience: Option<String>,
	},
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SecretProviderConfig {
	#[serde(rename_all = "camelCase")]
	Dotenv {
		path: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		encoding: Option<String>,
	},
	#[serde(rename_all = "camelCase")]
	Process {
		/// Filters variables by prefix. The prefix is NOT stripped from the
		/// emitted key; the full variable name is preserved.
		#[serde(skip_serializing_if = "Option::is_none")]
		prefix: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		allowlist: Option<Vec<String>>,
		#[serde(skip_serializing_if = "Option::is_none")]
		blocklist: Option<Vec<String>>,
	},
	#[serde(rename_all = "camelCase")]
	Inline { values: IndexMap<String, String> },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawUpstreamServer {
	pub name: String,
	/// Shorthand for a stdio transport running this command.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub command: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub args: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transport: Option<TransportConfig>,
	#[serde(default, skip_serializing_if = "IndexMap::is_empty")]
	pub env: IndexMap<String, String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub auth: Option<AuthProviderConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub secret_providers: Option<Vec<SecretProviderConfig>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RawInboundAuth {
	None {},
	#[serde(rename_all = "camelCase")]
	Bearer {
		#[serde(default)]
		tokens: Vec<String>,
	},
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawProxyConfig {
	#[serde(default)]
	pub servers: Vec<RawUpstreamServer>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub expose_tools: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub hide_tools: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub always_visible_tools: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub expose_core_tools: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub default_secret_providers: Option<Vec<SecretProviderConfig>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub default_passthrough_env: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub inbound_auth: Option<RawInboundAuth>,
}

impl RawProxyConfig {
	pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let contents = tokio::fs::read_to_string(path)
			.await
			.map_err(|source| ConfigError::Io {
				path: path.display().to_string(),
				source,
			})?;
		Ok(serde_json::from_str(&contents)?)
	}

	pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
		Ok(serde_json::from_str(contents)?)
	}

	/// Validates the raw config into the internal representation.
	pub fn validate(self) -> Result<ProxyConfig, ConfigError> {
		let mut servers: IndexMap<Strng, UpstreamServerSpec> = IndexMap::new();
		for raw in self.servers {
			let name: Strng = raw.name.as_str().into();
			if name.is_empty() {
				return Err(ConfigError::Invalid("server name must be non-empty".into()));
			}
			if servers.contains_key(&name) {
				return Err(ConfigError::Invalid(format!("duplicate server name: {name}")));
			}
			let transport = match (raw.command, raw.transport) {
				(Some(command), None) => TransportConfig::Stdio {
					command,
					args: raw.args,
					env: IndexMap::new(),
				},
				(None, Some(t)) => t,
				(Some(_), Some(_)) => {
					return Err(ConfigError::Invalid(format!(
						"server {name}: specify either command or transport, not both"
					)));
				},
				(None, None) => {
					return Err(ConfigError::Invalid(format!(
						"server {name}: one of command or transport is required"
					)));
				},
			};
			crate::transport::factory::validate(&transport)
				.map_err(|e| ConfigError::Invalid(format!("server {name}: {e}")))?;
			let auth = raw.auth.map(|a| resolve_auth(&name, a)).transpose()?;
			servers.insert(
				name.clone(),
				UpstreamServerSpec {
					name,
					transport,
					env: raw.env,
					auth,
					secret_providers: raw.secret_providers.unwrap_or_default(),
				},
			);
		}

		let inbound_auth = match self.inbound_auth {
			None | Some(RawInboundAuth::None {}) => InboundAuth::None,
			Some(RawInboundAuth::Bearer { tokens }) => {
				if tokens.is_empty() {
					return Err(ConfigError::InboundAuth(
						"bearer inbound auth requires at least one token".into(),
					));
				}
				let resolved = tokens
					.iter()
					.map(|t| env::expand_process(t))
					.collect::<Result<Vec<_>, _>>()
					.map_err(|e| ConfigError::InboundAuth(e.to_string()))?;
				if resolved.iter().any(|t| t.trim().is_empty()) {
					return Err(ConfigError::InboundAuth(
						"bearer inbound auth tokens must be non-empty".into(),
					));
				}
				InboundAuth::Bearer(resolved.into_iter().map(SecretString::from).collect())
			},
		};

		Ok(ProxyConfig {
			servers,
			expose_tools: self.expose_tools,
			hide_tools: self.hide_tools.unwrap_or_default(),
			always_visible_tools: self.always_visible_tools.unwrap_or_default(),
			expose_core_tools: self.expose_core_tools,
			default_secret_providers: self.default_secret_providers.unwrap_or_default(),
			default_passthrough_env: self.default_passthrough_env.unwrap_or_default(),
			inbound_auth,
		})
	}
}

/// Resolves `${VAR}` references inside an auth provider config and checks
/// that endpoints parse as absolute URLs.
fn resolve_auth(
	server: &Strng,
	auth: AuthProviderConfig,
) -> Result<AuthProviderConfig, ConfigError> {
	let expand = |v: String| env::expand_process(&v);
	let check_url = |field: &str, v: String| -> Result<String, ConfigError> {
		url::Url::parse(&v).map_err(|e| {
			ConfigError::Invalid(format!("server {server}: {field} is not an absolute URL: {e}"))
		})?;
		Ok(v)
	};
	Ok(match auth {
		AuthProviderConfig::None {} => AuthProviderConfig::None {},
		AuthProviderConfig::Bearer { token } => AuthProviderConfig::Bearer {
			token: expand(token)?,
		},
		AuthProviderConfig::Oauth2Client {
			client_id,
			client_secret,
			token_endpoint,
			scope,
			audience,
		} => AuthProviderConfig::Oauth2Client {
			client_id: expand(client_id)?,
			client_secret: expand(client_secret)?,
			token_endpoint: check_url("tokenEndpoint", expand(token_endpoint)?)?,
			scope,
			audience,
		},
		AuthProviderConfig::Oauth2Code {
			client_id,
			client_secret,
			authorization_endpoint,
			token_endpoint,
			redirect_uri,
			scope,
			audience,
		} => AuthProviderConfig::Oauth2Code {
			client_id: expand(client_id)?,
			client_secret: client_secret.map(expand).transpose()?,
			authorization_endpoint: check_url("authorizationEndpoint", expand(authorization_endpoint)?)?,
			token_endpoint: check_url("tokenEndpoint", expand(token_endpoint)?)?,
			redirect_uri: check_url("redirectUri", expand(redirect_uri)?)?,
			scope,
			audience,
		},
	})
}

/// A validated upstream server entry.
#[derive(Clone, Debug)]
pub struct UpstreamServerSpec {
	pub name: Strng,
	pub transport: TransportConfig,
	pub env: IndexMap<String, String>,
	pub auth: Option<AuthProviderConfig>,
	pub secret_providers: Vec<SecretProviderConfig>,
}

#[derive(Clone, Debug, Default)]
pub enum InboundAuth {
	#[default]
	None,
	Bearer(Vec<SecretString>),
}

/// The validated internal configuration.
#[derive(Clone, Debug, Default)]
pub struct ProxyConfig {
	pub servers: IndexMap<Strng, UpstreamServerSpec>,
	pub expose_tools: Option<Vec<String>>,
	pub hide_tools: Vec<String>,
	pub always_visible_tools: Vec<String>,
	pub expose_core_tools: Option<Vec<String>>,
	pub default_secret_providers: Vec<SecretProviderConfig>,
	pub default_passthrough_env: Vec<String>,
	pub inbound_auth: InboundAuth,
}
