//! Completion API client.
//!
//! Single point of contact with the model provider: one `create_message`
//! call per orchestration iteration, under a fixed timeout, with usage
//! fields read into [`CacheMetrics`] (absent fields count as zero).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::errors::GatewayError;
use super::types::{
    ContentBlock, CreateMessageRequest, MessageParam, ModelResponse, SystemBlock, ToolDefinition,
};
use crate::cache::CacheMetrics;

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Configuration ───────────────────────────────────────────────────────────

/// Gateway tunables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    /// Environment variable holding the API key.
    pub api_key_var: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            max_tokens: 2000,
            request_timeout: Duration::from_secs(30),
            api_key_var: "ANTHROPIC_API_KEY".to_string(),
        }
    }
}

// ─── CompletionApi ───────────────────────────────────────────────────────────

/// The orchestrator's seam to the completion API.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn create_message(
        &self,
        messages: &[MessageParam],
        tools: &[ToolDefinition],
        system: &[SystemBlock],
    ) -> Result<(ModelResponse, CacheMetrics), GatewayError>;
}

// ─── ModelGateway ────────────────────────────────────────────────────────────

/// Production [`CompletionApi`] over HTTP.
#[derive(Debug)]
pub struct ModelGateway {
    http: HttpClient,
    api_key: String,
    config: GatewayConfig,
}

impl ModelGateway {
    /// Build a gateway, reading the API key from the configured environment
    /// variable. Key absence is a construction-time error, not a surprise
    /// on the first call.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let api_key =
            std::env::var(&config.api_key_var).map_err(|_| GatewayError::MissingApiKey {
                var: config.api_key_var.clone(),
            })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: GatewayConfig, api_key: String) -> Result<Self, GatewayError> {
        if api_key.trim().is_empty() {
            return Err(GatewayError::MissingApiKey {
                var: config.api_key_var.clone(),
            });
        }

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Transport {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            api_key,
            config,
        })
    }

    async fn send_request(
        &self,
        request: &CreateMessageRequest,
    ) -> Result<ModelResponse, GatewayError> {
        let response = self
            .http
            .post(&self.config.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(request)
            .send()
            .await
            .map_err(|e| GatewayError::Transport {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::classify_http(status.as_u16(), body));
        }

        response
            .json::<ModelResponse>()
            .await
            .map_err(|e| GatewayError::MalformedResponse {
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl CompletionApi for ModelGateway {
    async fn create_message(
        &self,
        messages: &[MessageParam],
        tools: &[ToolDefinition],
        system: &[SystemBlock],
    ) -> Result<(ModelResponse, CacheMetrics), GatewayError> {
        let request = CreateMessageRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            system: if system.is_empty() {
                None
            } else {
                Some(system.to_vec())
            },
        };

        let response = tokio::time::timeout(
            self.config.request_timeout,
            self.send_request(&request),
        )
        .await
        .map_err(|_| GatewayError::Timeout {
            duration_secs: self.config.request_timeout.as_secs(),
        })??;

        let metrics = CacheMetrics::from_usage(&response.usage);
        tracing::debug!(
            model = %self.config.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "completion call finished"
        );

        Ok((response, metrics))
    }
}

// ─── Response Processing ─────────────────────────────────────────────────────

/// Classified view of one response.
#[derive(Debug, Clone, Default)]
pub struct ResponseSummary {
    /// Display fragments in block order.
    pub fragments: Vec<String>,
    /// The first tool invocation request, if any. Later tool-use blocks in
    /// the same response are resolved on subsequent iterations.
    pub tool_call: Option<(String, serde_json::Value)>,
}

/// Classify a response's blocks into display fragments and at most one
/// tool call.
pub fn process_response(response: &ModelResponse) -> ResponseSummary {
    let mut summary = ResponseSummary::default();

    for block in &response.content {
        match block {
            ContentBlock::Text { text, .. } => {
                if !text.is_empty() {
                    summary.fragments.push(format!("\n[Thinking]\n{text}"));
                }
            }
            ContentBlock::ToolUse { name, input, .. } => {
                if summary.tool_call.is_none() {
                    summary.tool_call = Some((name.clone(), input.clone()));
                }
            }
        }
    }

    summary
}

// ─── Tests ───────────────────────────────────────────────────────────────────
