//! Request and response types for the completion API.
//!
//! These mirror the provider's messages endpoint. Every shape the provider
//! may return is normalized into the tagged [`ContentBlock`] union
//! immediately on receipt; nothing downstream touches raw JSON.

use serde::{Deserialize, Serialize};

use crate::mcp::ToolDescriptor;

// ─── Cache Markers ───────────────────────────────────────────────────────────

/// Marks a request block as a cache boundary for the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            kind: "ephemeral".to_string(),
        }
    }
}

// ─── Content Blocks ──────────────────────────────────────────────────────────

/// One block of message content: free text or a tool invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    pub fn cached_text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: Some(CacheControl::ephemeral()),
        }
    }

    /// Normalize one provider block. Unknown block types (e.g. future
    /// thinking variants) degrade to their `text` field, or to the raw JSON
    /// when no text is present, so a response never fails wholesale.
    pub fn from_value(value: &serde_json::Value) -> Self {
        match value.get("type").and_then(|t| t.as_str()) {
            Some("text") => Self::Text {
                text: value
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                cache_control: None,
            },
            Some("tool_use") => Self::ToolUse {
                id: value
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: value
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                input: value.get("input").cloned().unwrap_or(serde_json::json!({})),
            },
            _ => Self::Text {
                text: value
                    .get("text")
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| value.to_string()),
                cache_control: None,
            },
        }
    }
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// Role of one conversation message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in the request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageParam {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl MessageParam {
    pub fn user(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: blocks,
        }
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: blocks,
        }
    }
}

/// One system-prompt block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl SystemBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
            cache_control: None,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cache_control.is_some()
    }
}

/// One tool definition in the request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl ToolDefinition {
    pub fn is_cached(&self) -> bool {
        self.cache_control.is_some()
    }
}

impl From<ToolDescriptor> for ToolDefinition {
    fn from(descriptor: ToolDescriptor) -> Self {
        Self {
            name: descriptor.name,
            description: descriptor.description,
            input_schema: descriptor.input_schema,
            cache_control: None,
        }
    }
}

/// Request body for the messages endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CreateMessageRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<MessageParam>,
    pub tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Vec<SystemBlock>>,
}

// ─── Responses ───────────────────────────────────────────────────────────────

/// Token accounting for one call. All fields default to zero so providers
/// that omit cache accounting don't fail deserialization.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// A completion response, normalized at the boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelResponse {
    #[serde(deserialize_with = "normalize_content")]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

fn normalize_content<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
    Ok(raw.iter().map(ContentBlock::from_value).collect())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
