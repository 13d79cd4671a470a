//! Child process transport: JSON-RPC messages are exchanged as
//! newline-delimited JSON over the child's stdin/stdout. Stderr is captured
//! for diagnostics and surfaced when the child exits abnormally.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use super::{
	serialize_message, ConnectionState, Shared, Transport, TransportError, TransportEvent,
};
use rmcp::model::ClientJsonRpcMessage;

const STDERR_TAIL_LINES: usize = 40;

#[derive(Debug)]
pub struct StdioTransport {
	shared: Arc<Shared>,
	command: String,
	args: Vec<String>,
	env: IndexMap<String, String>,
	stdin: Mutex<Option<ChildStdin>>,
	child: Mutex<Option<Child>>,
	stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
}

impl StdioTransport {
	pub fn new(
		name: impl AsRef<str>,
		command: String,
		args: Vec<String>,
		env: IndexMap<String, String>,
	) -> Self {
		Self {
			// stdio children are not reconnected; a dead process does not
			// come back with its state intact.
			shared: Shared::new(name, super::ReconnectPolicy {
				max_attempts: 0,
				..Default::default()
			}),
			command,
			args,
			env,
			stdin: Mutex::new(None),
			child: Mutex::new(None),
			stderr_tail: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
		}
	}

	fn spawn(&self) -> Result<Child, TransportError> {
		let mut c = Command::new(&self.command);
		c.args(&self.args);
		for (k, v) in &self.env {
			c.env(k, v);
		}
		c.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		c.spawn()
			.map_err(|e| TransportError::connect(format!("failed to spawn '{}': {e}", self.command)))
	}

	pub fn stderr_tail(&self) -> Vec<String> {
		self.stderr_tail.lock().iter().cloned().collect()
	}
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
	async fn start(&self) -> Result<(), TransportError> {
		if !self.shared.begin_start()? {
			return Ok(());
		}

		let spawned = self.spawn().and_then(|mut child| {
			let stdout = child
				.stdout
				.take()
				.ok_or_else(|| TransportError::connect("child stdout not captured"))?;
			let stderr = child
				.stderr
				.take()
				.ok_or_else(|| TransportError::connect("child stderr not captured"))?;
			let stdin = child
				.stdin
				.take()
				.ok_or_else(|| TransportError::connect("child stdin not captured"))?;
			Ok((child, stdin, stdout, stderr))
		});
		let (child, stdin, stdout, stderr) = match spawned {
			Ok(io) => io,
			Err(e) => {
				// There is no process to retry against; a failed spawn is
				// terminal.
				self.shared.set_state(ConnectionState::Failed);
				return Err(e);
			},
		};
		*self.stdin.lock().await = Some(stdin);
		*self.child.lock().await = Some(child);

		let tail = self.stderr_tail.clone();
		let name = self.shared.name.clone();
		tokio::spawn(async move {
			let mut lines = BufReader::new(stderr).lines();
			while let Ok(Some(line)) = lines.next_line().await {
				tracing::debug!(transport = %name, "stderr: {line}");
				let mut t = tail.lock();
				if t.len() == STDERR_TAIL_LINES {
					t.pop_front();
				}
				t.push_back(line);
			}
		});

		let shared = self.shared.clone();
		let tail = self.stderr_tail.clone();
		tokio::spawn(async move {
			let mut lines = BufReader::new(stdout).lines();
			loop {
				tokio::select! {
					_ = shared.cancel.cancelled() => return,
					line = lines.next_line() => {
						match line {
							Ok(Some(line)) => {
								if line.trim().is_empty() {
									continue;
								}
								match super::parse_server_message(&line) {
									Ok(msg) => shared.emit(TransportEvent::Message(msg)).await,
									Err(e) => {
										tracing::warn!(transport = %shared.name, error = %e, "discarding unparseable frame");
										shared.emit(TransportEvent::Error(e)).await;
									},
								}
							},
							Ok(None) | Err(_) => break,
						}
					},
				}
			}
			// Child exited (or its stdout closed) without close() being
			// called first.
			if !shared.closing_or_closed() {
				let stderr_tail = {
					let t = tail.lock();
					t.iter().cloned().collect::<Vec<_>>().join("\n")
				};
				let msg = if stderr_tail.is_empty() {
					"child process exited".to_string()
				} else {
					format!("child process exited; stderr:\n{stderr_tail}")
				};
				tracing::warn!(transport = %shared.name, "{msg}");
				shared.emit(TransportEvent::Error(TransportError::closed(msg))).await;
				shared.set_state(ConnectionState::Closed);
				shared.emit(TransportEvent::Closed).await;
			}
		});

		self.shared.set_state(ConnectionState::Connected);
		self.shared.emit(TransportEvent::Ready).await;
		Ok(())
	}

	async fn close(&self) -> Result<(), TransportError> {
		if !self.shared.begin_close() {
			return Ok(());
		}
		// Dropping stdin lets a well-behaved child exit on its own; the kill
		// below covers the rest.
		self.stdin.lock().await.take();
		if let Some(mut child) = self.child.lock().await.take() {
			let _ = child.kill().await;
		}
		self.shared.finish_close().await;
		Ok(())
	}

	async fn send(&self, message: ClientJsonRpcMessage) -> Result<(), TransportError> {
		self.shared.ensure_connected()?;
		let mut line = serialize_message(&message)?;
		line.push('\n');
		let mut guard = self.stdin.lock().await;
		let stdin = guard.as_mut().ok_or_else(TransportError::not_started)?;
		stdin
			.write_all(line.as_bytes())
			.await
			.map_err(|e| TransportError::connect(format!("write to child failed: {e}")))?;
		stdin
			.flush()
			.await
			.map_err(|e| TransportError::connect(format!("flush to child failed: {e}")))?;
		Ok(())
	}

	fn state(&self) -> ConnectionState {
		self.shared.state()
	}

	fn session_id(&self) -> Option<String> {
		None
	}

	fn protocol_version(&self) -> Option<String> {
		self.shared.protocol_version()
	}

	fn set_protocol_version(&self, version: String) {
		self.shared.set_protocol_version(version);
	}

	fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
		self.shared.take_events()
	}
}
