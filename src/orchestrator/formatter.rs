//! Message formatting and context preparation.
//!
//! Turns the caller-supplied conversation context into the system-block /
//! message split the gateway expects, augments the new query with ambient
//! environment details, and bounds history growth with a recency window
//! plus cache-marked chunks.

use chrono::Local;

use crate::gateway::types::{CacheControl, ContentBlock, MessageParam, Role, SystemBlock};

// ─── Conversation Turns ──────────────────────────────────────────────────────

/// Role of a caller-supplied conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

/// One turn of caller-supplied conversation context.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: TurnRole,
    pub content: Vec<ContentBlock>,
}

impl Turn {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Bounds on conversation-context growth. These interact directly with the
/// cache-block ceiling: each history chunk spends one marker.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// How many recent turns survive into the request.
    pub recency_limit: usize,
    /// Max turns folded into one history chunk.
    pub chunk_messages: usize,
    /// Approximate token budget per chunk.
    pub chunk_max_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            recency_limit: 10,
            chunk_messages: 5,
            chunk_max_tokens: 2000,
        }
    }
}

// ─── Preparation ─────────────────────────────────────────────────────────────

/// Build the (messages, system blocks) pair for the first model call of a
/// query. The query always lands last, so the final element before the
/// call is the newest user turn.
pub fn prepare_messages(
    query: &str,
    context: &[Turn],
    config: &ContextConfig,
) -> (Vec<MessageParam>, Vec<SystemBlock>) {
    let mut system_blocks: Vec<SystemBlock> = Vec::new();
    for turn in context.iter().filter(|t| t.role == TurnRole::System) {
        for block in &turn.content {
            if let ContentBlock::Text {
                text,
                cache_control,
            } = block
            {
                system_blocks.push(SystemBlock {
                    kind: "text".to_string(),
                    text: text.clone(),
                    cache_control: cache_control.clone(),
                });
            }
        }
    }

    if let Some(first) = system_blocks.first_mut() {
        first.text.push_str(&format!(
            "\n\nCurrent time and date: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
    }
    if let Some(last) = system_blocks.last_mut() {
        last.cache_control = Some(CacheControl::ephemeral());
    }

    let history: Vec<MessageParam> = context
        .iter()
        .filter(|t| t.role != TurnRole::System)
        .map(|turn| MessageParam {
            role: match turn.role {
                TurnRole::Assistant => Role::Assistant,
                _ => Role::User,
            },
            content: turn.content.clone(),
        })
        .collect();

    let mut messages = chunk_history(history, config);
    messages.push(MessageParam::user(format_query(query)));

    (messages, system_blocks)
}

/// Augment a query with ambient environment details.
pub fn format_query(query: &str) -> Vec<ContentBlock> {
    let env_details = std::env::var("ENVIRONMENT_DETAILS").unwrap_or_default();
    vec![ContentBlock::text(format!(
        "{query}\n\nEnvironment Details:\n{env_details}"
    ))]
}

/// Synthetic assistant turn recording a tool invocation.
pub fn format_tool_call(tool_name: &str, tool_args: &serde_json::Value) -> Vec<ContentBlock> {
    vec![ContentBlock::text(format!(
        "Using tool: {tool_name} with arguments: {tool_args}"
    ))]
}

/// Synthetic user turn carrying a tool result back to the model.
pub fn format_tool_result(result: &str) -> Vec<ContentBlock> {
    vec![ContentBlock::text(format!("Tool result: {result}"))]
}

// ─── History Chunking ────────────────────────────────────────────────────────

/// Rough token estimate — whitespace-separated words.
fn estimate_tokens(message: &MessageParam) -> usize {
    message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text, .. } => text.split_whitespace().count(),
            ContentBlock::ToolUse { input, .. } => input.to_string().split_whitespace().count(),
        })
        .sum()
}

/// Bound history to the recency window and fold older turns into
/// cache-marked chunks, keeping the most recent turn separate.
///
/// Each chunk becomes one user-role message whose header block carries the
/// cache marker; turn roles inside a chunk are folded away.
pub fn chunk_history(history: Vec<MessageParam>, config: &ContextConfig) -> Vec<MessageParam> {
    let start = history.len().saturating_sub(config.recency_limit);
    let recent: Vec<MessageParam> = history.into_iter().skip(start).collect();

    if recent.len() <= 2 {
        return recent;
    }

    let mut older = recent;
    let Some(last) = older.pop() else {
        return older;
    };

    let mut chunks: Vec<Vec<MessageParam>> = Vec::new();
    let mut current: Vec<MessageParam> = Vec::new();
    let mut current_tokens = 0usize;

    for message in older {
        let tokens = estimate_tokens(&message);
        let chunk_full = !current.is_empty()
            && (current.len() >= config.chunk_messages
                || current_tokens + tokens > config.chunk_max_tokens);
        if chunk_full {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(message);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let total = chunks.len();
    let mut out = Vec::with_capacity(total + 1);
    for (i, chunk) in chunks.into_iter().enumerate() {
        let mut blocks = vec![ContentBlock::cached_text(format!(
            "Conversation history (part {}/{total}):",
            i + 1
        ))];
        for message in chunk {
            blocks.extend(message.content);
        }
        out.push(MessageParam::user(blocks));
    }
    out.push(last);
    out
}

/// Cache markers already spent on message blocks (history chunk headers).
pub fn count_cached_message_blocks(messages: &[MessageParam]) -> usize {
    messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter(|block| {
            matches!(
                block,
                ContentBlock::Text {
                    cache_control: Some(_),
                    ..
                }
            )
        })
        .count()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
