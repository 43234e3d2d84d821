//! Conversation-context estimation and degradation warnings
//!
//! The engine's real tokenizer is not available at this layer, so the
//! estimate is a cheap character-count heuristic. It is deterministic: the
//! same transcript and policy always produce the same estimate.

use serde::{Deserialize, Serialize};

use crate::chat::Transcript;
use crate::config::ContextPolicy;

/// Degradation warning derived from the current estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    None,
    Caution,
    Critical,
}

/// Estimated context usage, always a pure function of the transcript
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextEstimate {
    pub estimated_tokens: usize,
    pub warning: WarningLevel,
}

impl ContextEstimate {
    fn zero() -> Self {
        Self {
            estimated_tokens: 0,
            warning: WarningLevel::None,
        }
    }
}

/// Tracks the estimate for the active conversation
#[derive(Debug, Clone)]
pub struct ContextTracker {
    policy: ContextPolicy,
    current: ContextEstimate,
}

impl ContextTracker {
    pub fn new(policy: ContextPolicy) -> Self {
        Self {
            policy,
            current: ContextEstimate::zero(),
        }
    }

    /// Estimate a transcript without touching tracker state.
    pub fn estimate(policy: &ContextPolicy, transcript: &Transcript) -> ContextEstimate {
        let total_chars: usize = transcript
            .messages()
            .iter()
            .map(|m| m.content.chars().count())
            .sum();
        let estimated_tokens = total_chars.div_ceil(policy.chars_per_token.max(1));

        let warning = if estimated_tokens <= policy.caution_tokens {
            WarningLevel::None
        } else if estimated_tokens <= policy.critical_tokens {
            WarningLevel::Caution
        } else {
            WarningLevel::Critical
        };

        ContextEstimate {
            estimated_tokens,
            warning,
        }
    }

    /// Re-estimate after a transcript change and remember the result.
    pub fn observe(&mut self, transcript: &Transcript) -> ContextEstimate {
        self.current = Self::estimate(&self.policy, transcript);
        self.current
    }

    pub fn current(&self) -> ContextEstimate {
        self.current
    }

    /// Called when the transcript is cleared. The warning is not sticky.
    pub fn reset(&mut self) {
        self.current = ContextEstimate::zero();
    }
}
