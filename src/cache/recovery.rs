//! Overflow recovery: ordered fallback strategies for the cache ceiling.
//!
//! Because the loop appends tool turns across iterations, the set of
//! cache-worthy blocks only grows; once the provider rejects a request for
//! carrying too many markers, each strategy strips markers more
//! aggressively than the last until a call goes through.

use std::future::Future;

use crate::cache::metrics::CacheMetrics;
use crate::gateway::errors::GatewayError;
use crate::gateway::types::{CacheControl, ModelResponse, SystemBlock, ToolDefinition};

// ─── Strategies ──────────────────────────────────────────────────────────────

type BlockSets = (Vec<SystemBlock>, Vec<ToolDefinition>);

/// Strategy 1: keep only the two most recent system blocks marked.
fn keep_recent_system(mut system: Vec<SystemBlock>, tools: Vec<ToolDefinition>) -> BlockSets {
    let keep_from = system.len().saturating_sub(2);
    for (i, block) in system.iter_mut().enumerate() {
        if i < keep_from {
            block.cache_control = None;
        }
    }
    (system, tools)
}

/// Strategy 2: keep one system block and one tool marked.
fn minimal_cache(mut system: Vec<SystemBlock>, mut tools: Vec<ToolDefinition>) -> BlockSets {
    let last = system.len().saturating_sub(1);
    for (i, block) in system.iter_mut().enumerate() {
        block.cache_control = if i == last {
            Some(CacheControl::ephemeral())
        } else {
            None
        };
    }
    for (i, tool) in tools.iter_mut().enumerate() {
        tool.cache_control = if i == 0 {
            Some(CacheControl::ephemeral())
        } else {
            None
        };
    }
    (system, tools)
}

/// Strategy 3: strip all markers.
fn strip_all(mut system: Vec<SystemBlock>, mut tools: Vec<ToolDefinition>) -> BlockSets {
    for block in system.iter_mut() {
        block.cache_control = None;
    }
    for tool in tools.iter_mut() {
        tool.cache_control = None;
    }
    (system, tools)
}

fn strategies() -> [fn(Vec<SystemBlock>, Vec<ToolDefinition>) -> BlockSets; 3] {
    [keep_recent_system, minimal_cache, strip_all]
}

// ─── Recovery Driver ─────────────────────────────────────────────────────────

/// A successful recovery: the response plus the reduced block sets that
/// produced it, so the caller keeps using them for later iterations.
#[derive(Debug)]
pub struct RecoveryOutcome {
    pub response: ModelResponse,
    pub metrics: CacheMetrics,
    pub system: Vec<SystemBlock>,
    pub tools: Vec<ToolDefinition>,
}

/// Apply the fallback strategies in order, retrying through `retry_fn`
/// until one succeeds.
///
/// A recurring [`GatewayError::CacheOverflow`] moves on to the next
/// strategy; any other error aborts recovery and is returned to the
/// caller. `Ok(None)` means every strategy still overflowed.
pub async fn recover_from_overflow<F, Fut>(
    system: &[SystemBlock],
    tools: &[ToolDefinition],
    mut retry_fn: F,
) -> Result<Option<RecoveryOutcome>, GatewayError>
where
    F: FnMut(Vec<SystemBlock>, Vec<ToolDefinition>) -> Fut,
    Fut: Future<Output = Result<(ModelResponse, CacheMetrics), GatewayError>>,
{
    for (number, strategy) in strategies().iter().enumerate() {
        let (reduced_system, reduced_tools) = strategy(system.to_vec(), tools.to_vec());
        tracing::info!(strategy = number + 1, "trying cache reduction strategy");

        match retry_fn(reduced_system.clone(), reduced_tools.clone()).await {
            Ok((response, metrics)) => {
                tracing::info!(strategy = number + 1, "cache reduction strategy succeeded");
                return Ok(Some(RecoveryOutcome {
                    response,
                    metrics,
                    system: reduced_system,
                    tools: reduced_tools,
                }));
            }
            Err(e) if e.is_cache_overflow() => {
                tracing::warn!(strategy = number + 1, "strategy still overflowed, trying next");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(None)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::cache::budget::marked_block_count;
    use crate::gateway::types::Usage;

    fn cached_system(n: usize) -> Vec<SystemBlock> {
        (0..n)
            .map(|i| {
                let mut block = SystemBlock::text(format!("block {i}"));
                block.cache_control = Some(CacheControl::ephemeral());
                block
            })
            .collect()
    }

    fn cached_tools(n: usize) -> Vec<ToolDefinition> {
        (0..n)
            .map(|i| ToolDefinition {
                name: format!("tool{i}"),
                description: String::new(),
                input_schema: serde_json::json!({"type": "object"}),
                cache_control: Some(CacheControl::ephemeral()),
            })
            .collect()
    }

    fn ok_response() -> (ModelResponse, CacheMetrics) {
        (
            ModelResponse {
                content: vec![],
                usage: Usage::default(),
                stop_reason: None,
            },
            CacheMetrics::default(),
        )
    }

    #[test]
    fn test_keep_recent_system_unmarks_older_blocks() {
        let (system, tools) = keep_recent_system(cached_system(5), cached_tools(2));
        assert!(!system[0].is_cached());
        assert!(!system[1].is_cached());
        assert!(!system[2].is_cached());
        assert!(system[3].is_cached());
        assert!(system[4].is_cached());
        // Tools untouched by strategy 1.
        assert!(tools[0].is_cached());
    }

    #[test]
    fn test_minimal_cache_keeps_one_of_each() {
        let (system, tools) = minimal_cache(cached_system(4), cached_tools(3));
        assert_eq!(marked_block_count(&system, &tools), 2);
        assert!(system[3].is_cached());
        assert!(tools[0].is_cached());
    }

    #[test]
    fn test_strip_all_removes_everything() {
        let (system, tools) = strip_all(cached_system(3), cached_tools(3));
        assert_eq!(marked_block_count(&system, &tools), 0);
    }

    #[tokio::test]
    async fn test_first_strategy_success_returns_reduced_blocks() {
        let calls = AtomicU32::new(0);
        let outcome = recover_from_overflow(&cached_system(5), &cached_tools(2), |system, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            // Strategy 1 output: only the last two system blocks marked.
            assert_eq!(system.iter().filter(|b| b.is_cached()).count(), 2);
            async { Ok(ok_response()) }
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcome.system.iter().filter(|b| b.is_cached()).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_overflow_recurrence_moves_to_next_strategy() {
        let calls = AtomicU32::new(0);
        let outcome = recover_from_overflow(&cached_system(5), &cached_tools(2), |_, _| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Err(GatewayError::CacheOverflow)
                } else {
                    Ok(ok_response())
                }
            }
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Strategy 2 output was adopted: one system block, one tool marked.
        assert_eq!(marked_block_count(&outcome.system, &outcome.tools), 2);
    }

    #[tokio::test]
    async fn test_other_error_aborts_recovery() {
        let calls = AtomicU32::new(0);
        let err = recover_from_overflow(&cached_system(2), &cached_tools(1), |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(ModelResponse, CacheMetrics), _>(GatewayError::Http {
                    status: 500,
                    body: "overloaded".into(),
                })
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, GatewayError::Http { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_strategies_exhausted() {
        let calls = AtomicU32::new(0);
        let outcome = recover_from_overflow(&cached_system(2), &cached_tools(1), |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(ModelResponse, CacheMetrics), _>(GatewayError::CacheOverflow) }
        })
        .await
        .unwrap();

        assert!(outcome.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
