//! Dispatcher configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tiered_core::TierKind;

/// Per-tier budgets and cascade limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Budget for invoking loaded code
    pub code_timeout_ms: u64,
    /// Budget for a generative call
    pub generative_timeout_ms: u64,
    /// Budget for an agentic loop
    pub agentic_timeout_ms: u64,
    /// Budget for creating a human task (not for the human answering it)
    pub human_timeout_ms: u64,
    /// Lifetime of a synthesised human task
    pub human_task_ttl_secs: u64,
    /// Maximum nesting of cascades
    pub max_cascade_depth: usize,
}

impl DispatchConfig {
    /// Create a config with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one tier's budget; cascades have no budget of their own
    #[must_use]
    pub fn with_timeout(mut self, tier: TierKind, timeout_ms: u64) -> Self {
        match tier {
            TierKind::Code => self.code_timeout_ms = timeout_ms,
            TierKind::Generative => self.generative_timeout_ms = timeout_ms,
            TierKind::Agentic => self.agentic_timeout_ms = timeout_ms,
            TierKind::Human => self.human_timeout_ms = timeout_ms,
            TierKind::Cascade => {}
        }
        self
    }

    /// Set the cascade nesting limit
    #[must_use]
    pub fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    /// Budget for a tier; `None` for cascades
    #[must_use]
    pub fn timeout_for(&self, tier: TierKind) -> Option<Duration> {
        let millis = match tier {
            TierKind::Code => self.code_timeout_ms,
            TierKind::Generative => self.generative_timeout_ms,
            TierKind::Agentic => self.agentic_timeout_ms,
            TierKind::Human => self.human_timeout_ms,
            TierKind::Cascade => return None,
        };
        Some(Duration::from_millis(millis))
    }

    /// Lifetime of a synthesised human task
    #[must_use]
    pub fn human_task_ttl(&self) -> Duration {
        Duration::from_secs(self.human_task_ttl_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            code_timeout_ms: 5_000,
            generative_timeout_ms: 30_000,
            agentic_timeout_ms: 300_000,
            human_timeout_ms: 10_000,
            human_task_ttl_secs: 86_400,
            max_cascade_depth: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budgets() {
        let config = DispatchConfig::default();
        assert_eq!(config.timeout_for(TierKind::Code), Some(Duration::from_secs(5)));
        assert_eq!(
            config.timeout_for(TierKind::Agentic),
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.timeout_for(TierKind::Cascade), None);
        assert_eq!(config.human_task_ttl(), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn test_partial_json() {
        let config: DispatchConfig =
            serde_json::from_str(r#"{ "codeTimeoutMs": 250, "maxCascadeDepth": 2 }"#).unwrap();
        assert_eq!(config.code_timeout_ms, 250);
        assert_eq!(config.max_cascade_depth, 2);
        assert_eq!(config.generative_timeout_ms, 30_000);
    }

    #[test]
    fn test_with_timeout() {
        let config = DispatchConfig::new()
            .with_timeout(TierKind::Generative, 10)
            .with_timeout(TierKind::Cascade, 10);
        assert_eq!(
            config.timeout_for(TierKind::Generative),
            Some(Duration::from_millis(10))
        );
        assert_eq!(config, DispatchConfig::new().with_timeout(TierKind::Generative, 10));
    }
}
