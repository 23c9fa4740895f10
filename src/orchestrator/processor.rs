//! Query orchestration — the iterative model/tool loop.
//!
//! One `process_query` call drives: prepare messages and tools, call the
//! model, execute at most one requested tool per iteration, feed the result
//! back, and repeat until the model answers in plain text or a bound trips.
//! The returned transcript carries bracketed fragments (`[Thinking]`,
//! `[Tool Call]`, `[Error]`, ...) so a reader can see exactly where and why
//! something failed, even though the call itself returns normally.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::{
    assign_cache_markers_bounded, recover_from_overflow, CacheMetrics, CacheStats,
    MAX_CACHE_BLOCKS,
};
use crate::gateway::client::{process_response, CompletionApi};
use crate::gateway::errors::GatewayError;
use crate::gateway::types::{MessageParam, ModelResponse, SystemBlock, ToolDefinition};
use crate::mcp::errors::McpError;
use crate::mcp::registry::ServerRegistry;
use crate::mcp::ToolContent;
use crate::orchestrator::formatter::{
    count_cached_message_blocks, format_tool_call, format_tool_result, prepare_messages,
    ContextConfig, Turn,
};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Orchestration tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Cap on model-call/tool-call cycles per query.
    pub max_iterations: u32,
    /// Retry budget for a failing model call or tool call.
    pub max_retries: u32,
    /// Base delay for retry backoff.
    pub retry_base_delay: Duration,
    /// Upper bound on a single retry delay.
    pub retry_delay_cap: Duration,
    /// Deadline for one tool execution attempt.
    pub tool_timeout: Duration,
    /// Wall-clock budget for the entire query.
    pub query_timeout: Duration,
    /// Sessions probed within this window are trusted without re-probing.
    pub health_interval: Duration,
    /// Conversation-context bounds.
    pub context: ContextConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_delay_cap: Duration::from_secs(10),
            tool_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(300),
            health_interval: Duration::from_secs(30),
            context: ContextConfig::default(),
        }
    }
}

// ─── Query State ─────────────────────────────────────────────────────────────

/// Processing state of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Preparing,
    Processing,
    ExecutingTool,
    Completed,
    Failed,
}

/// Per-query bookkeeping; created at the start of `process_query` and
/// dropped at the end, never shared across queries.
struct QueryContext {
    id: Uuid,
    state: QueryState,
    started_at: Instant,
    iteration: u32,
    tool_executions: u32,
    last_error: Option<String>,
}

impl QueryContext {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: QueryState::Preparing,
            started_at: Instant::now(),
            iteration: 0,
            tool_executions: 0,
            last_error: None,
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Terminal failures of one query. These surface in the transcript as an
/// `[Error]` fragment; the process keeps running.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("API call failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
}

// ─── QueryOrchestrator ───────────────────────────────────────────────────────

/// Drives the model/tool loop for one query at a time. Safe to share
/// across concurrent queries; all per-query state lives on the stack.
pub struct QueryOrchestrator {
    registry: Arc<ServerRegistry>,
    gateway: Arc<dyn CompletionApi>,
    config: OrchestratorConfig,
    stats: StdMutex<CacheStats>,
}

impl QueryOrchestrator {
    pub fn new(
        registry: Arc<ServerRegistry>,
        gateway: Arc<dyn CompletionApi>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            gateway,
            config,
            stats: StdMutex::new(CacheStats::default()),
        }
    }

    /// Accumulated cache statistics across all queries on this orchestrator.
    pub fn cache_stats(&self) -> CacheStats {
        self.stats.lock().map(|guard| *guard).unwrap_or_default()
    }

    /// Process one query against the supplied conversation context.
    ///
    /// Always returns a transcript string; failures and the overall
    /// timeout are embedded as `[Error]` fragments after whatever output
    /// was gathered before the failure.
    pub async fn process_query(&self, query: &str, context: &[Turn]) -> String {
        let mut qctx = QueryContext::new();
        let fragments: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        tracing::info!(query_id = %qctx.id, "processing query");

        let outcome = tokio::time::timeout(
            self.config.query_timeout,
            self.run(query, context, &mut qctx, &fragments),
        )
        .await;

        let mut collected = fragments
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();

        match outcome {
            Ok(Ok(())) => {
                qctx.state = QueryState::Completed;
            }
            Ok(Err(e)) => {
                qctx.state = QueryState::Failed;
                qctx.last_error = Some(e.to_string());
                collected.push(format!("\n[Error]\nError processing query: {e}"));
            }
            Err(_) => {
                qctx.state = QueryState::Failed;
                let secs = self.config.query_timeout.as_secs();
                qctx.last_error = Some(format!("timed out after {secs}s"));
                collected.push(format!(
                    "\n[Error]\nQuery processing timed out after {secs}s"
                ));
            }
        }

        tracing::info!(
            query_id = %qctx.id,
            state = ?qctx.state,
            iterations = qctx.iteration,
            tool_executions = qctx.tool_executions,
            elapsed_ms = qctx.started_at.elapsed().as_millis() as u64,
            last_error = qctx.last_error.as_deref().unwrap_or(""),
            "query finished"
        );

        collected.join("\n")
    }

    async fn run(
        &self,
        query: &str,
        context: &[Turn],
        qctx: &mut QueryContext,
        fragments: &Arc<StdMutex<Vec<String>>>,
    ) -> Result<(), OrchestratorError> {
        let push = |lines: Vec<String>| {
            if let Ok(mut guard) = fragments.lock() {
                guard.extend(lines);
            }
        };

        qctx.state = QueryState::Preparing;
        self.registry
            .check_all_health(self.config.health_interval)
            .await?;

        let descriptors = self.registry.list_all_tools().await;
        let known_tools: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        tracing::info!(query_id = %qctx.id, tool_count = known_tools.len(), "prepared tools");

        let (mut messages, system) = prepare_messages(query, context, &self.config.context);
        let tools: Vec<ToolDefinition> = descriptors.into_iter().map(Into::into).collect();

        // History chunk headers already spend part of the marker ceiling.
        let spent = count_cached_message_blocks(&messages);
        let (mut system, mut tools) =
            assign_cache_markers_bounded(system, tools, MAX_CACHE_BLOCKS.saturating_sub(spent));

        qctx.state = QueryState::Processing;

        while qctx.iteration < self.config.max_iterations {
            qctx.iteration += 1;

            let (response, metrics) = self
                .call_model_with_retry(&messages, &mut system, &mut tools)
                .await?;

            if let Ok(mut stats) = self.stats.lock() {
                stats.record(&metrics);
            }
            metrics.log();
            push(metrics.format_display());
            push(vec![format!("\n[Iteration {}]", qctx.iteration)]);

            let summary = process_response(&response);
            push(summary.fragments);

            let Some((tool_name, tool_args)) = summary.tool_call else {
                qctx.state = QueryState::Completed;
                return Ok(());
            };

            qctx.state = QueryState::ExecutingTool;
            qctx.tool_executions += 1;
            let pretty_args = serde_json::to_string_pretty(&tool_args)
                .unwrap_or_else(|_| tool_args.to_string());
            push(vec![format!(
                "\n[Tool Call]\nTool: {tool_name}\nArguments: {pretty_args}"
            )]);

            match self
                .execute_tool_with_retry(&tool_name, &tool_args, &known_tools)
                .await
            {
                Ok(result_text) => {
                    push(vec![format!("\n[Tool Result]\n{result_text}")]);
                    messages.push(MessageParam::assistant(format_tool_call(
                        &tool_name, &tool_args,
                    )));
                    messages.push(MessageParam::user(format_tool_result(&result_text)));
                }
                Err(error_text) => {
                    tracing::error!(
                        query_id = %qctx.id,
                        tool = %tool_name,
                        error = %error_text,
                        "tool execution failed"
                    );
                    qctx.last_error = Some(error_text.clone());
                    push(vec![format!("\n[Error]\n{error_text}")]);
                    // The conversation is left untouched; the model gets
                    // another iteration to choose a different path.
                }
            }

            qctx.state = QueryState::Processing;
        }

        push(vec![
            "\n[Warning]\nReached maximum number of tool call iterations.".to_string(),
        ]);
        Ok(())
    }

    // ─── Model Calls ─────────────────────────────────────────────────────

    /// One model call with bounded backoff retry. A cache overflow diverts
    /// into the budgeter's recovery path; the reduced block sets it settles
    /// on replace `system`/`tools` for the rest of the query.
    async fn call_model_with_retry(
        &self,
        messages: &[MessageParam],
        system: &mut Vec<SystemBlock>,
        tools: &mut Vec<ToolDefinition>,
    ) -> Result<(ModelResponse, CacheMetrics), OrchestratorError> {
        let mut last_reason = String::new();

        for attempt in 1..=self.config.max_retries {
            match self.gateway.create_message(messages, tools, system).await {
                Ok(pair) => return Ok(pair),
                Err(e) if e.is_cache_overflow() => {
                    tracing::warn!("cache block ceiling exceeded, attempting recovery");

                    let gateway = Arc::clone(&self.gateway);
                    let retry_messages = messages.to_vec();
                    let outcome = recover_from_overflow(system, tools, move |sys, tls| {
                        let gateway = Arc::clone(&gateway);
                        let retry_messages = retry_messages.clone();
                        async move { gateway.create_message(&retry_messages, &tls, &sys).await }
                    })
                    .await?;

                    return match outcome {
                        Some(outcome) => {
                            *system = outcome.system;
                            *tools = outcome.tools;
                            Ok((outcome.response, outcome.metrics))
                        }
                        None => Err(OrchestratorError::Gateway(GatewayError::CacheOverflow)),
                    };
                }
                Err(e) => {
                    last_reason = e.to_string();
                    tracing::warn!(attempt, error = %e, "completion call failed");
                    if attempt < self.config.max_retries {
                        let delay = crate::mcp::registry::backoff_delay(
                            attempt,
                            self.config.retry_base_delay,
                            self.config.retry_delay_cap,
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(OrchestratorError::RetriesExhausted {
            attempts: self.config.max_retries,
            reason: last_reason,
        })
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute one tool call, retrying the same call with backoff on
    /// timeout or dispatch failure. A tool absent from the prepared
    /// listing is reported as not found without burning retries.
    async fn execute_tool_with_retry(
        &self,
        tool_name: &str,
        tool_args: &serde_json::Value,
        known_tools: &[String],
    ) -> Result<String, String> {
        if !known_tools.iter().any(|name| name == tool_name) {
            return Err(format!("Tool '{tool_name}' not found on any server"));
        }

        let mut last_error = String::new();

        for attempt in 1..=self.config.max_retries {
            match tokio::time::timeout(
                self.config.tool_timeout,
                self.registry.dispatch(tool_name, tool_args),
            )
            .await
            {
                Ok(Some(content)) => return Ok(render_tool_content(&content)),
                Ok(None) => {
                    last_error = format!("Tool '{tool_name}' failed on all available servers");
                    tracing::warn!(tool = %tool_name, attempt, "dispatch returned no result");
                }
                Err(_) => {
                    last_error = format!(
                        "Tool '{tool_name}' timed out after {}s",
                        self.config.tool_timeout.as_secs()
                    );
                    tracing::warn!(tool = %tool_name, attempt, "tool call timed out");
                }
            }

            if attempt < self.config.max_retries {
                let delay = crate::mcp::registry::backoff_delay(
                    attempt,
                    self.config.retry_base_delay,
                    self.config.retry_delay_cap,
                );
                tracing::info!(delay_secs = delay.as_secs(), "retrying tool execution");
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_error)
    }
}

fn render_tool_content(content: &ToolContent) -> String {
    serde_json::to_string_pretty(content).unwrap_or_else(|_| content.joined_text())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
