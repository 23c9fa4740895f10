//! Tool-channel sessions: one logical connection to one tool server.
//!
//! A session exclusively owns its subprocess handle and protocol transport;
//! nothing else reads the raw stdio. The [`ToolChannel`] trait is the seam
//! the registry dispatches through, so tests can register in-memory channels.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{InitializeResult, ServerConfig, ToolContent, ToolDescriptor};

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ─── Connection State ────────────────────────────────────────────────────────

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Unhealthy,
}

// ─── ToolChannel ─────────────────────────────────────────────────────────────

/// Operations the registry needs from a live session.
#[async_trait]
pub trait ToolChannel: Send + Sync {
    /// Server name this channel belongs to.
    fn name(&self) -> &str;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Fetch the server's tool listing.
    async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>, McpError>;

    /// Invoke a tool by name.
    async fn call_tool(
        &self,
        tool: &str,
        args: &serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolContent, McpError>;

    /// Liveness probe: a lightweight protocol round trip plus a process
    /// aliveness check. Returns false (and flips the state to `Unhealthy`)
    /// when the session is no longer usable.
    async fn probe(&self, timeout: Duration) -> bool;

    /// Tear the session down. Never fails; escalates from graceful
    /// termination to a forced kill.
    async fn shutdown(&self);
}

// ─── StdioSession ────────────────────────────────────────────────────────────

/// Production [`ToolChannel`] over a spawned subprocess.
#[derive(Debug)]
pub struct StdioSession {
    name: String,
    child: Mutex<Child>,
    transport: StdioTransport,
    state: StdMutex<ConnectionState>,
}

impl StdioSession {
    /// Spawn the subprocess, perform the initialization handshake, and run
    /// an initial tool listing. Partial state is torn down on any failure.
    pub async fn connect(
        name: &str,
        config: &ServerConfig,
        init_timeout: Duration,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr_handle = child.stderr.take();

        let transport = StdioTransport::new(name, stdin, stdout);

        let session = Self {
            name: name.to_string(),
            child: Mutex::new(child),
            transport,
            state: StdMutex::new(ConnectionState::Connecting),
        };

        match tokio::time::timeout(init_timeout, session.handshake()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let stderr_ctx = read_stderr_on_failure(stderr_handle).await;
                session.kill_quietly().await;
                return Err(McpError::InitFailed {
                    name: name.to_string(),
                    reason: format!("{e}{}", format_stderr_suffix(&stderr_ctx)),
                });
            }
            Err(_) => {
                let stderr_ctx = read_stderr_on_failure(stderr_handle).await;
                session.kill_quietly().await;
                return Err(McpError::InitFailed {
                    name: name.to_string(),
                    reason: format!(
                        "initialization timed out after {}s{}",
                        init_timeout.as_secs(),
                        format_stderr_suffix(&stderr_ctx)
                    ),
                });
            }
        }

        session.set_state(ConnectionState::Connected);
        Ok(session)
    }

    /// Initialize handshake followed by an initial tool listing, so a
    /// server that starts but exposes nothing is rejected up front.
    async fn handshake(&self) -> Result<(), McpError> {
        let response = self.transport.request("initialize", None).await?;
        let result = extract_result(response)?;

        let _init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        let tools = self.fetch_tools().await?;
        tracing::info!(
            server = %self.name,
            tool_count = tools.len(),
            "session initialized"
        );
        Ok(())
    }

    async fn fetch_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let response = self.transport.request("tools/list", None).await?;
        let result = extract_result(response)?;

        // Accept both `{"tools": [...]}` and a bare array.
        let tools_value = result.get("tools").cloned().unwrap_or(result);
        serde_json::from_value(tools_value).map_err(|e| McpError::Transport {
            server: self.name.clone(),
            reason: format!("failed to parse tool listing: {e}"),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    async fn process_exited(&self) -> bool {
        let mut child = self.child.lock().await;
        !matches!(child.try_wait(), Ok(None))
    }

    async fn kill_quietly(&self) {
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

#[async_trait]
impl ToolChannel for StdioSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(ConnectionState::Unhealthy)
    }

    async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>, McpError> {
        tokio::time::timeout(timeout, self.fetch_tools())
            .await
            .map_err(|_| McpError::Timeout {
                operation: format!("tools/list on '{}'", self.name),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: &serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolContent, McpError> {
        let params = serde_json::json!({
            "name": tool,
            "arguments": args,
        });

        let response = tokio::time::timeout(
            timeout,
            self.transport.request("tools/call", Some(params)),
        )
        .await
        .map_err(|_| McpError::Timeout {
            operation: format!("tool '{tool}' on '{}'", self.name),
            timeout_ms: timeout.as_millis() as u64,
        })??;

        let result = extract_result(response)?;
        serde_json::from_value(result).map_err(|e| McpError::Transport {
            server: self.name.clone(),
            reason: format!("failed to parse tool result: {e}"),
        })
    }

    async fn probe(&self, timeout: Duration) -> bool {
        if self.process_exited().await {
            tracing::warn!(server = %self.name, "process exited");
            self.set_state(ConnectionState::Unhealthy);
            return false;
        }

        match self.list_tools(timeout).await {
            Ok(_) => {
                self.set_state(ConnectionState::Connected);
                true
            }
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "liveness probe failed");
                self.set_state(ConnectionState::Unhealthy);
                false
            }
        }
    }

    async fn shutdown(&self) {
        // Best-effort shutdown notification before terminating.
        let _ = self.transport.notify("shutdown", None).await;

        let mut child = self.child.lock().await;
        let graceful = tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await;
        if !matches!(graceful, Ok(Ok(_))) {
            if let Err(e) = child.kill().await {
                tracing::warn!(server = %self.name, error = %e, "force kill failed");
            }
        }
        drop(child);
        self.set_state(ConnectionState::Disconnected);
    }
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Read any stderr the failed process produced, truncated for log hygiene.
async fn read_stderr_on_failure(stderr_handle: Option<tokio::process::ChildStderr>) -> String {
    use tokio::io::AsyncReadExt;

    let Some(mut stderr) = stderr_handle else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => {
            if buf.len() > 2000 {
                buf.truncate(2000);
                buf.push_str("...(truncated)");
            }
            buf
        }
        _ => String::new(),
    }
}

fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Test Support ────────────────────────────────────────────────────────────


// ─── Tests ───────────────────────────────────────────────────────────────────
