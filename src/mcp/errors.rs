//! MCP layer error types.

use thiserror::Error;

/// Errors from server sessions and the registry.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// Stdio framing or I/O error while talking to a server.
    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A protocol round trip exceeded its deadline.
    #[error("'{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A server failed its health probe or could not be (re)connected.
    #[error("server '{server}' unavailable: {reason}")]
    Connection { server: String, reason: String },

    /// Invalid or missing server configuration.
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl McpError {
    /// Whether this error indicates the session itself is unusable
    /// (as opposed to a per-call failure the session may recover from).
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            McpError::Transport { .. } | McpError::SpawnFailed { .. } | McpError::Connection { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_server_name() {
        let err = McpError::Connection {
            server: "files".into(),
            reason: "probe timed out".into(),
        };
        assert!(err.to_string().contains("files"));
        assert!(err.to_string().contains("probe timed out"));
    }

    #[test]
    fn test_transport_level_classification() {
        let transport = McpError::Transport {
            server: "files".into(),
            reason: "stdout closed".into(),
        };
        assert!(transport.is_transport_level());

        let server_err = McpError::Server {
            code: -32602,
            message: "invalid params".into(),
            data: None,
        };
        assert!(!server_err.is_transport_level());
    }
}
