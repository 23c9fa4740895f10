//! Cache-marker assignment under the provider's per-request ceiling.
//!
//! The provider accepts at most four cache-marked blocks per request, so
//! markers go to the blocks most worth caching: the tool-definition prefix
//! first, then the longest and most reference-heavy system blocks.

use crate::gateway::types::{CacheControl, SystemBlock, ToolDefinition};

/// Hard provider-side ceiling on cache-marked blocks per request.
pub const MAX_CACHE_BLOCKS: usize = 4;

/// Keywords marking system content that pays off most when cached.
const HIGH_VALUE_KEYWORDS: [&str; 3] = ["documentation", "persona", "context"];

/// Score bonus per keyword hit.
const KEYWORD_BONUS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    /// The first tool definition; marking it anchors the whole
    /// definitions prefix in the provider cache.
    ToolPrefix,
    System { index: usize, score: usize },
}

impl Candidate {
    fn priority(&self) -> usize {
        match self {
            // Tool definitions always outrank system content.
            Candidate::ToolPrefix => usize::MAX,
            Candidate::System { score, .. } => *score,
        }
    }
}

fn score_system_block(block: &SystemBlock) -> usize {
    let lower = block.text.to_lowercase();
    let keyword_hits = HIGH_VALUE_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .count();
    block.text.len() + keyword_hits * KEYWORD_BONUS
}

/// Assign cache markers to the highest-priority blocks, never exceeding
/// [`MAX_CACHE_BLOCKS`] in total and always marking the tool prefix when
/// any tools are present. Previously set markers are cleared first so the
/// result is a function of the inputs alone.
pub fn assign_cache_markers(
    system: Vec<SystemBlock>,
    tools: Vec<ToolDefinition>,
) -> (Vec<SystemBlock>, Vec<ToolDefinition>) {
    assign_cache_markers_bounded(system, tools, MAX_CACHE_BLOCKS)
}

/// Like [`assign_cache_markers`], but with part of the ceiling already
/// spent elsewhere in the request (conversation-history chunk markers).
pub fn assign_cache_markers_bounded(
    system: Vec<SystemBlock>,
    tools: Vec<ToolDefinition>,
    budget: usize,
) -> (Vec<SystemBlock>, Vec<ToolDefinition>) {
    let mut system: Vec<SystemBlock> = system
        .into_iter()
        .map(|mut block| {
            block.cache_control = None;
            block
        })
        .collect();
    let mut tools: Vec<ToolDefinition> = tools
        .into_iter()
        .map(|mut tool| {
            tool.cache_control = None;
            tool
        })
        .collect();

    let mut candidates: Vec<Candidate> = Vec::with_capacity(system.len() + 1);
    if !tools.is_empty() {
        candidates.push(Candidate::ToolPrefix);
    }
    for (index, block) in system.iter().enumerate() {
        candidates.push(Candidate::System {
            index,
            score: score_system_block(block),
        });
    }

    candidates.sort_by(|a, b| b.priority().cmp(&a.priority()));

    for candidate in candidates.into_iter().take(budget.min(MAX_CACHE_BLOCKS)) {
        match candidate {
            Candidate::ToolPrefix => {
                tools[0].cache_control = Some(CacheControl::ephemeral());
            }
            Candidate::System { index, .. } => {
                system[index].cache_control = Some(CacheControl::ephemeral());
            }
        }
    }

    (system, tools)
}

/// Total cache-marked blocks across both sets.
pub fn marked_block_count(system: &[SystemBlock], tools: &[ToolDefinition]) -> usize {
    system.iter().filter(|b| b.is_cached()).count()
        + tools.iter().filter(|t| t.is_cached()).count()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
