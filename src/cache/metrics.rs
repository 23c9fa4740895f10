//! Cache performance metrics.
//!
//! One [`CacheMetrics`] per completion call, read off the provider's usage
//! fields; [`CacheStats`] accumulates them across a session for reporting.

use serde::Serialize;

use crate::gateway::types::Usage;

// ─── Per-call Metrics ────────────────────────────────────────────────────────

/// Token accounting for a single completion call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub uncached_input_tokens: u64,
    pub output_tokens: u64,
}

impl CacheMetrics {
    pub fn from_usage(usage: &Usage) -> Self {
        Self {
            cache_creation_tokens: usage.cache_creation_input_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            uncached_input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        }
    }

    fn total_input(&self) -> u64 {
        self.cache_creation_tokens + self.cache_read_tokens + self.uncached_input_tokens
    }

    /// Fraction of input tokens served from cache, as a percentage.
    /// `None` when the call carried no input tokens at all.
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.total_input();
        if total == 0 {
            None
        } else {
            Some(self.cache_read_tokens as f64 / total as f64 * 100.0)
        }
    }

    /// Transcript fragment lines for this call.
    pub fn format_display(&self) -> Vec<String> {
        let mut display = vec![
            "\n[Cache Performance]".to_string(),
            format!("Cache Creation Tokens: {}", self.cache_creation_tokens),
            format!("Cache Read Tokens: {}", self.cache_read_tokens),
            format!("Uncached Input Tokens: {}", self.uncached_input_tokens),
            format!("Output Tokens: {}", self.output_tokens),
        ];
        if let Some(rate) = self.hit_rate() {
            display.push(format!("Cache Hit Rate: {rate:.1}%"));
        }
        display
    }

    pub fn log(&self) {
        tracing::info!(
            cache_creation_tokens = self.cache_creation_tokens,
            cache_read_tokens = self.cache_read_tokens,
            uncached_input_tokens = self.uncached_input_tokens,
            output_tokens = self.output_tokens,
            "cache performance"
        );
    }
}

// ─── Accumulated Statistics ──────────────────────────────────────────────────

/// Running cache statistics across many calls.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub total_cache_creation_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_uncached_tokens: u64,
    pub total_output_tokens: u64,
    pub cache_hits: u64,
    pub total_requests: u64,
}

impl CacheStats {
    pub fn record(&mut self, metrics: &CacheMetrics) {
        self.total_cache_creation_tokens += metrics.cache_creation_tokens;
        self.total_cache_read_tokens += metrics.cache_read_tokens;
        self.total_uncached_tokens += metrics.uncached_input_tokens;
        self.total_output_tokens += metrics.output_tokens;
        self.total_requests += 1;
        if metrics.cache_read_tokens > 0 {
            self.cache_hits += 1;
        }
    }

    fn total_input(&self) -> u64 {
        self.total_cache_creation_tokens + self.total_cache_read_tokens + self.total_uncached_tokens
    }

    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.total_input();
        if total == 0 {
            None
        } else {
            Some(self.total_cache_read_tokens as f64 / total as f64 * 100.0)
        }
    }

    /// Estimated token savings from cache reads (cached input bills at a
    /// tenth of the uncached rate).
    pub fn token_savings(&self) -> Option<f64> {
        let total = self.total_input();
        if total == 0 {
            None
        } else {
            Some(self.total_cache_read_tokens as f64 * 0.9 / total as f64 * 100.0)
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(creation: u64, read: u64, uncached: u64, output: u64) -> CacheMetrics {
        CacheMetrics {
            cache_creation_tokens: creation,
            cache_read_tokens: read,
            uncached_input_tokens: uncached,
            output_tokens: output,
        }
    }

    #[test]
    fn test_from_usage() {
        let usage = Usage {
            input_tokens: 100,
            output_tokens: 20,
            cache_creation_input_tokens: 500,
            cache_read_input_tokens: 400,
        };
        let m = CacheMetrics::from_usage(&usage);
        assert_eq!(m.uncached_input_tokens, 100);
        assert_eq!(m.cache_creation_tokens, 500);
        assert_eq!(m.cache_read_tokens, 400);
    }

    #[test]
    fn test_hit_rate() {
        let m = metrics(0, 75, 25, 10);
        assert_eq!(m.hit_rate(), Some(75.0));
        assert_eq!(metrics(0, 0, 0, 5).hit_rate(), None);
    }

    #[test]
    fn test_format_display_contains_all_fields() {
        let lines = metrics(500, 400, 100, 20).format_display();
        assert_eq!(lines[0], "\n[Cache Performance]");
        assert!(lines.iter().any(|l| l == "Cache Creation Tokens: 500"));
        assert!(lines.iter().any(|l| l == "Cache Read Tokens: 400"));
        assert!(lines.iter().any(|l| l == "Uncached Input Tokens: 100"));
        assert!(lines.iter().any(|l| l == "Output Tokens: 20"));
        assert!(lines.iter().any(|l| l.starts_with("Cache Hit Rate: 40.0")));
    }

    #[test]
    fn test_format_display_omits_hit_rate_without_input() {
        let lines = metrics(0, 0, 0, 20).format_display();
        assert!(!lines.iter().any(|l| l.contains("Hit Rate")));
    }

    #[test]
    fn test_stats_accumulation() {
        let mut stats = CacheStats::default();
        stats.record(&metrics(500, 0, 100, 20));
        stats.record(&metrics(0, 500, 100, 30));

        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.total_cache_read_tokens, 500);
        assert_eq!(stats.total_output_tokens, 50);

        let rate = stats.hit_rate().unwrap();
        assert!((rate - 500.0 / 1200.0 * 100.0).abs() < 1e-9);
        let savings = stats.token_savings().unwrap();
        assert!((savings - 450.0 / 1200.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_empty() {
        let stats = CacheStats::default();
        assert!(stats.hit_rate().is_none());
        assert!(stats.token_savings().is_none());
    }
}
