//! Shared types for the MCP layer.
//!
//! JSON-RPC 2.0 message types, tool descriptors, and server configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

// ─── Protocol Types ──────────────────────────────────────────────────────────

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

/// A callable tool exposed by one server.
///
/// Descriptors are ephemeral: every discovery call re-fetches them, and they
/// are never held across orchestration iterations. Names are unique within
/// one server's listing but not across servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema", alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// One piece of a tool-call result (`{type, text}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPiece {
    #[serde(rename = "type", default = "default_piece_type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

fn default_piece_type() -> String {
    "text".to_string()
}

/// Result payload returned by `tools/call`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(default)]
    pub content: Vec<ContentPiece>,
}

impl ToolContent {
    /// Concatenate all text pieces into one string.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter(|piece| piece.kind == "text")
            .map(|piece| piece.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Payload of the `initialize` response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server identity returned during initialization.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Launch configuration for one tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Top-level server declarations, loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServersConfig {
    #[serde(alias = "mcpServers")]
    pub servers: HashMap<String, ServerConfig>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_omits_empty_params() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_request_with_params() {
        let params = serde_json::json!({"name": "echo", "arguments": {"text": "hi"}});
        let req = JsonRpcRequest::new(7, "tools/call", Some(params));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("tools/call"));
    }

    #[test]
    fn test_error_response_deserialization() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "result": null,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32601);
        assert!(resp.result.is_none());
    }

    #[test]
    fn test_tool_descriptor_defaults_schema() {
        let json = r#"{"name": "echo", "description": "Echo text back"}"#;
        let tool: ToolDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn test_tool_descriptor_camel_case_alias() {
        let json = r#"{"name": "echo", "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}}"#;
        let tool: ToolDescriptor = serde_json::from_str(json).unwrap();
        assert!(tool.input_schema["properties"]["text"].is_object());
    }

    #[test]
    fn test_tool_content_joined_text() {
        let content = ToolContent {
            content: vec![
                ContentPiece {
                    kind: "text".into(),
                    text: "line one".into(),
                },
                ContentPiece {
                    kind: "image".into(),
                    text: "ignored".into(),
                },
                ContentPiece {
                    kind: "text".into(),
                    text: "line two".into(),
                },
            ],
        };
        assert_eq!(content.joined_text(), "line one\nline two");
    }

    #[test]
    fn test_servers_config_accepts_legacy_key() {
        let json = r#"{"mcpServers": {"echo": {"command": "echo-server"}}}"#;
        let config: ServersConfig = serde_json::from_str(json).unwrap();
        assert!(config.servers.contains_key("echo"));
        assert!(config.servers["echo"].args.is_empty());
    }
}
