//! The proxy multiplexer: owns the upstream set, namespaces tools,
//! applies visibility, dispatches calls, and fans out
//! `tools/list_changed` notifications to downstream sessions.

pub mod visibility;

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use rmcp::model::{
	CallToolResult, ClientJsonRpcMessage, ClientRequest, Content, ErrorCode, ErrorData,
	Implementation, InitializeResult, JsonObject, ProtocolVersion, RequestId, ServerCapabilities,
	ServerJsonRpcMessage, ServerResult, Tool, ToolsCapability,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::auth::flow::FlowRegistry;
use crate::auth::store::TokenStore;
use crate::auth::{AuthError, AuthProvider};
use crate::commands::{
	CommandContext, CommandRegistry, DependencyStatus, ProxyContext, ServerDependency,
	UpstreamStatus,
};
use crate::config::{ProxyConfig, TransportConfig, TransportKind, UpstreamServerSpec};
use crate::secrets;
use crate::transport::factory::{TransportFactory, UpgradableTransport};
use crate::transport::Transport;
use crate::upstream::{UpstreamClient, UpstreamError, UpstreamEvent};
use crate::{join_tool_name, split_tool_name, strng, Strng};
use visibility::{DynamicEnableSet, VisibilityPolicy};

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;

/// Burst window for coalescing upstream list_changed notifications.
const NOTIFY_COALESCE_WINDOW: Duration = Duration::from_millis(50);

/// Attribution for dynamic-enable entries added by dependency checks.
const SERVER_DEPENDENCY_SOURCE: Strng = strng::literal!("server-dependency");

#[derive(Error, Debug)]
pub enum ProxyError {
	#[error("unknown upstream: {0}")]
	UnknownUpstream(String),
	#[error(transparent)]
	Upstream(#[from] UpstreamError),
	#[error("invalid transport config: {0}")]
	InvalidTransport(String),
	#[error(transparent)]
	Auth(#[from] AuthError),
}

/// Notifications pushed to downstream sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyNotification {
	ToolListChanged,
}

pub struct Proxy {
	inner: Arc<Inner>,
}

struct Inner {
	config: ProxyConfig,
	visibility: VisibilityPolicy,
	dynamic: parking_lot::RwLock<DynamicEnableSet>,
	factory: Arc<TransportFactory>,
	flows: Arc<FlowRegistry>,
	registry: CommandRegistry,
	http: reqwest::Client,
	upstreams: tokio::sync::Mutex<IndexMap<Strng, Arc<UpstreamClient>>>,
	auth_cache: parking_lot::Mutex<IndexMap<Strng, (Arc<dyn AuthProvider>, Arc<TokenStore>)>>,
	events_tx: mpsc::Sender<UpstreamEvent>,
	notify: broadcast::Sender<ProxyNotification>,
}

impl std::fmt::Debug for Proxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Proxy")
			.field("servers", &self.inner.config.servers.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl Proxy {
	pub fn new(config: ProxyConfig, registry: CommandRegistry) -> Arc<Self> {
		let http = reqwest::Client::new();
		let (events_tx, events_rx) = mpsc::channel(64);
		let (notify, _) = broadcast::channel(16);
		let visibility = VisibilityPolicy::from_config(&config);
		let inner = Arc::new(Inner {
			config,
			visibility,
			dynamic: parking_lot::RwLock::new(DynamicEnableSet::default()),
			factory: Arc::new(TransportFactory::new(http.clone())),
			flows: FlowRegistry::new(),
			registry,
			http,
			upstreams: tokio::sync::Mutex::new(IndexMap::new()),
			auth_cache: parking_lot::Mutex::new(IndexMap::new()),
			events_tx,
			notify: notify.clone(),
		});
		tokio::spawn(coalesce_notifications(events_rx, notify));
		Arc::new(Self { inner })
	}

	/// The OAuth flow registry backing the HTTP callback route.
	pub fn flows(&self) -> Arc<FlowRegistry> {
		self.inner.flows.clone()
	}

	/// Subscribe to downstream-facing notifications.
	pub fn subscribe(&self) -> broadcast::Receiver<ProxyNotification> {
		self.inner.notify.subscribe()
	}

	pub fn context(&self) -> Arc<dyn ProxyContext> {
		self.inner.clone()
	}

	/// Connects every configured upstream. Individual failures are logged;
	/// the proxy serves whatever connected.
	pub async fn connect_all(&self) {
		let names: Vec<Strng> = self.inner.config.servers.keys().cloned().collect();
		for name in names {
			if let Err(e) = self.inner.ensure_connected(&name).await {
				tracing::warn!(upstream = %name, error = %e, "failed to connect upstream");
			}
		}
	}

	/// Closes everything, leaves-first: transports, then auth state.
	pub async fn shutdown(&self) {
		let upstreams: Vec<_> = {
			let mut map = self.inner.upstreams.lock().await;
			map.drain(..).map(|(_, v)| v).collect()
		};
		for upstream in upstreams {
			if let Err(e) = upstream.close().await {
				tracing::debug!(upstream = %upstream.name(), error = %e, "close failed");
			}
		}
		let auth: Vec<_> = {
			let mut cache = self.inner.auth_cache.lock();
			cache.drain(..).map(|(_, v)| v).collect()
		};
		for (_, store) in auth {
			store.clear();
		}
	}

	/// Handles one downstream JSON-RPC message. Returns the response to
	/// deliver, or `None` for notifications.
	pub async fn handle_message(&self, message: ClientJsonRpcMessage) -> Option<ServerJsonRpcMessage> {
		match message {
			ClientJsonRpcMessage::Request(r) => {
				let id = r.id.clone();
				Some(self.handle_request(r.request, id).await)
			},
			ClientJsonRpcMessage::Notification(_) => None,
			_ => None,
		}
	}

	async fn handle_request(&self, request: ClientRequest, id: RequestId) -> ServerJsonRpcMessage {
		match request {
			ClientRequest::InitializeRequest(ir) => {
				let result = self.inner.server_info(ir.params.protocol_version.clone());
				response(ServerResult::InitializeResult(result), id)
			},
			ClientRequest::PingRequest(_) => response(ServerResult::empty(()), id),
			ClientRequest::ListToolsRequest(_) => {
				let tools = self.inner.list_visible_tools().await;
				response(
					ServerResult::ListToolsResult(rmcp::model::ListToolsResult {
						tools,
						next_cursor: None,
						meta: None,
					}),
					id,
				)
			},
			ClientRequest::CallToolRequest(ctr) => {
				let name = ctr.params.name.to_string();
				match self.inner.dispatch_call(&name, ctr.params.arguments).await {
					Ok(result) => response(ServerResult::CallToolResult(result), id),
					Err(e) => ServerJsonRpcMessage::error(e, Some(id)),
				}
			},
			other => ServerJsonRpcMessage::error(
				ErrorData::new(
					ErrorCode::METHOD_NOT_FOUND,
					format!("unsupported method: {}", other.method()),
					None,
				),
				Some(id),
			),
		}
	}
}

#[cfg(test)]
impl Proxy {
	/// Installs a pre-built upstream client, bypassing transport setup.
	pub(crate) async fn insert_upstream(&self, client: Arc<UpstreamClient>) {
		self
			.inner
			.upstreams
			.lock()
			.await
			.insert(client.name().clone(), client);
	}

	pub(crate) fn events_tx(&self) -> mpsc::Sender<UpstreamEvent> {
		self.inner.events_tx.clone()
	}
}

fn response(result: ServerResult, id: RequestId) -> ServerJsonRpcMessage {
	ServerJsonRpcMessage::Response(rmcp::model::JsonRpcResponse {
		jsonrpc: rmcp::model::JsonRpcVersion2_0,
		id,
		result,
	})
}

impl Inner {
	fn server_info(&self, client_protocol_version: ProtocolVersion) -> InitializeResult {
		let mut capabilities = ServerCapabilities::default();
		capabilities.tools = Some(ToolsCapability {
			list_changed: Some(true),
		});

		let mut server_info = Implementation::default();
		server_info.name = "manifold".to_string();
		server_info.version = env!("CARGO_PKG_VERSION").to_string();

		let mut result = InitializeResult::new(capabilities);
		result.protocol_version = client_protocol_version;
		result.server_info = server_info;
		result.instructions = Some(
			"This server aggregates a set of MCP servers, routing tool calls to the correct one."
				.to_string(),
		);
		result
	}

	/// The downstream-visible tool set: namespaced upstream tools filtered
	/// by the visibility rules, plus core tools gated by exposeCoreTools.
	async fn list_visible_tools(&self) -> Vec<Tool> {
		let mut tools = Vec::new();
		{
			let upstreams = self.upstreams.lock().await;
			let dynamic = self.dynamic.read();
			for (name, upstream) in upstreams.iter() {
				let Some(cached) = upstream.tools() else {
					continue;
				};
				for tool in cached {
					let namespaced = join_tool_name(name, &tool.name);
					if !self.visibility.is_visible(&namespaced, &dynamic) {
						continue;
					}
					let mut namespaced_tool = tool;
					namespaced_tool.name = namespaced.into();
					tools.push(namespaced_tool);
				}
			}
		}
		for tool in self.registry.definitions() {
			if self.visibility.core_tool_visible(&tool.name) {
				tools.push(tool);
			}
		}
		tools
	}

	async fn dispatch_call(
		self: &Arc<Self>,
		name: &str,
		arguments: Option<JsonObject>,
	) -> Result<CallToolResult, ErrorData> {
		// Core tools are not namespaced and take precedence.
		if self.registry.owns_tool(name) {
			if !self.visibility.core_tool_visible(name) {
				return Err(unknown_tool(name));
			}
			let proxy: Arc<dyn ProxyContext> = self.clone();
			let ctx = CommandContext { proxy: Some(proxy) };
			return self.registry.execute(name, arguments, &ctx).await;
		}

		let Some((server, tool)) = split_tool_name(name) else {
			return Err(unknown_tool(name));
		};
		{
			let dynamic = self.dynamic.read();
			if !self.visibility.is_visible(name, &dynamic) {
				// Hidden tools do not exist as far as the downstream knows.
				return Err(unknown_tool(name));
			}
		}

		let upstream = match self.ensure_connected(&strng::new(server)).await {
			Ok(u) => u,
			Err(ProxyError::UnknownUpstream(_)) => return Err(unknown_tool(name)),
			Err(e) => {
				// Connection problems surface as MCP error results rather
				// than protocol errors.
				return Ok(CallToolResult::error(vec![Content::text(format!(
					"failed to connect to upstream {server}: {e}"
				))]));
			},
		};

		match upstream.call_tool(tool, arguments).await {
			Ok(result) => Ok(result),
			// The upstream's error result is forwarded unchanged.
			Err(UpstreamError::Rpc(error)) => Err(error),
			Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
				"upstream {server} failed: {e}"
			))])),
		}
	}

	/// Returns a connected client for `name`, connecting on demand.
	async fn ensure_connected(self: &Arc<Self>, name: &Strng) -> Result<Arc<UpstreamClient>, ProxyError> {
		let mut upstreams = self.upstreams.lock().await;
		if let Some(existing) = upstreams.get(name) {
			if existing.is_connected() {
				return Ok(existing.clone());
			}
			// A dead client is replaced below.
			upstreams.shift_remove(name);
		}

		let spec = self
			.config
			.servers
			.get(name)
			.ok_or_else(|| ProxyError::UnknownUpstream(name.to_string()))?;

		let (auth, store) = self.auth_for(name, spec)?;
		let transport = self.build_transport(name, spec, auth, store).await?;
		let client = Arc::new(UpstreamClient::new(
			name.clone(),
			transport,
			self.events_tx.clone(),
		));
		client.start().await?;
		upstreams.insert(name.clone(), client.clone());
		tracing::info!(upstream = %name, "upstream connected");
		Ok(client)
	}

	fn auth_for(
		&self,
		name: &Strng,
		spec: &UpstreamServerSpec,
	) -> Result<(Option<Arc<dyn AuthProvider>>, Option<Arc<TokenStore>>), ProxyError> {
		let Some(auth_cfg) = spec.auth.as_ref() else {
			return Ok((None, None));
		};
		if let Some((provider, store)) = self.auth_cache.lock().get(name) {
			return Ok((Some(provider.clone()), Some(store.clone())));
		}
		let store = Arc::new(TokenStore::default());
		let provider = crate::auth::build(
			auth_cfg,
			store.clone(),
			self.http.clone(),
			Some(self.flows.clone()),
		)?;
		self
			.auth_cache
			.lock()
			.insert(name.clone(), (provider.clone(), store.clone()));
		Ok((Some(provider), Some(store)))
	}

	async fn build_transport(
		&self,
		name: &Strng,
		spec: &UpstreamServerSpec,
		auth: Option<Arc<dyn AuthProvider>>,
		store: Option<Arc<TokenStore>>,
	) -> Result<Arc<dyn Transport>, ProxyError> {
		let mut cfg = spec.transport.clone();
		if let TransportConfig::Stdio { env, .. } = &mut cfg {
			// The child's environment comes from the secret provider chain;
			// inline transport env participates as the final layer.
			let mut resolved = secrets::resolve(spec, &self.config).await;
			for (k, v) in env.iter() {
				resolved.insert(k.clone(), v.clone());
			}
			*env = resolved;
		}

		if cfg.kind() == TransportKind::StreamableHttp {
			let auth = auth.unwrap_or_else(|| Arc::new(crate::auth::NoneProvider));
			let upgradable: Arc<dyn Transport> =
				UpgradableTransport::new(name.as_str(), self.factory.clone(), cfg, auth, store)
					.map_err(|e| ProxyError::InvalidTransport(e.to_string()))?;
			return Ok(upgradable);
		}

		self
			.factory
			.create(name.as_str(), &cfg, auth, store)
			.map_err(|e| ProxyError::InvalidTransport(e.to_string()))
	}

	fn notify_tools_changed(&self) {
		let _ = self.notify.send(ProxyNotification::ToolListChanged);
	}
}

#[async_trait::async_trait]
impl ProxyContext for Inner {
	fn require_server_configured(&self, dep: &ServerDependency) -> DependencyStatus {
		let configured = dep
			.aliases
			.iter()
			.any(|alias| self.config.servers.contains_key(alias.as_str()));
		DependencyStatus { configured }
	}

	async fn require_server_connected(&self, dep: &ServerDependency) -> DependencyStatus {
		if dep.aliases.is_empty() {
			return DependencyStatus { configured: false };
		}
		let connected_alias = {
			let upstreams = self.upstreams.lock().await;
			dep
				.aliases
				.iter()
				.find(|alias| {
					upstreams
						.get(alias.as_str())
						.is_some_and(|u| u.is_connected())
				})
				.cloned()
		};
		let Some(alias) = connected_alias else {
			return DependencyStatus { configured: false };
		};
		if dep.ensure_tools_exposed {
			let pattern = join_tool_name(&alias, "*");
			self.dynamic.write().add(&pattern, SERVER_DEPENDENCY_SOURCE);
			self.notify_tools_changed();
		}
		DependencyStatus { configured: true }
	}

	fn upstream_summary(&self) -> Vec<UpstreamStatus> {
		let connected: IndexMap<Strng, (String, Option<usize>)> = match self.upstreams.try_lock() {
			Ok(upstreams) => upstreams
				.iter()
				.map(|(name, u)| {
					(
						name.clone(),
						(
							u.transport().state().to_string(),
							u.tools().map(|t| t.len()),
						),
					)
				})
				.collect(),
			Err(_) => IndexMap::new(),
		};
		self
			.config
			.servers
			.keys()
			.map(|name| match connected.get(name) {
				Some((state, tools)) => UpstreamStatus {
					name: name.clone(),
					state: state.clone(),
					tool_count: *tools,
				},
				None => UpstreamStatus {
					name: name.clone(),
					state: "idle".to_string(),
					tool_count: None,
				},
			})
			.collect()
	}
}

fn unknown_tool(name: &str) -> ErrorData {
	// Intentionally does not say "not authorized"; hidden tools should be
	// indistinguishable from missing ones.
	ErrorData::new(
		ErrorCode::METHOD_NOT_FOUND,
		format!("Unknown tool: {name}"),
		None,
	)
}

/// Coalesces bursts of upstream change events into a single downstream
/// notification per window.
async fn coalesce_notifications(
	mut events: mpsc::Receiver<UpstreamEvent>,
	notify: broadcast::Sender<ProxyNotification>,
) {
	while let Some(_first) = events.recv().await {
		let window = tokio::time::sleep(NOTIFY_COALESCE_WINDOW);
		tokio::pin!(window);
		loop {
			tokio::select! {
				_ = &mut window => break,
				more = events.recv() => {
					if more.is_none() {
						break;
					}
				},
			}
		}
		let _ = notify.send(ProxyNotification::ToolListChanged);
	}
}
