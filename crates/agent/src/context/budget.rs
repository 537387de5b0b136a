//! Token budget manager.
//!
//! Keeps a history under the context limit by escalating through three
//! compaction levels, stopping as soon as the estimate fits:
//!
//! | Level | Action | Scope |
//! |-------|--------|-------|
//! | 1 | Collapse tool output into an extractive summary | Oldest unprotected round first |
//! | 2 | Strip image attachments from user messages | Every round but the latest |
//! | 3 | Drop whole rounds | Oldest unprotected round whose tool output is collapsed |
//!
//! The most recent `protected_rounds` rounds (never fewer than two) are
//! never collapsed or dropped, and user text is never rewritten.

use super::summary::summarize_tool_output;
use super::token::estimate_messages_tokens;
use serde::Serialize;
use std::ops::Range;
use toolweave_config::AgentConfig;
use toolweave_core::error::Error;
use toolweave_core::message::{Message, Role};
use toolweave_core::round::split_rounds;
use tracing::{debug, warn};

/// Rounds that compaction never touches, regardless of configuration.
pub const MIN_PROTECTED_ROUNDS: usize = 2;

/// Metadata key recording the images stripped from a user message.
pub const IMAGES_REMOVED_KEY: &str = "images_removed";

/// Marker stored in place of each stripped image.
pub const IMAGE_REMOVED_MARKER: &str = "[image removed]";

/// Limits the manager works against.
#[derive(Debug, Clone, Copy)]
pub struct BudgetSettings {
    pub limit_tokens: usize,
    pub protected_rounds: usize,
    pub image_token_cost: usize,
    pub summary_max_chars: usize,
}

impl From<&AgentConfig> for BudgetSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            limit_tokens: config.context_limit_tokens,
            protected_rounds: config.protected_rounds,
            image_token_cost: config.image_token_cost,
            summary_max_chars: config.summary_max_chars,
        }
    }
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

/// One compaction level that changed the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionStep {
    pub level: u8,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// What a [`TokenBudgetManager::fit`] pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactionReport {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub limit: usize,
    pub steps: Vec<CompactionStep>,
    pub rounds_collapsed: usize,
    pub images_stripped: usize,
    pub rounds_dropped: usize,
    pub within_budget: bool,
}

impl CompactionReport {
    /// Highest level applied, 0 when nothing changed.
    pub fn level_reached(&self) -> u8 {
        self.steps.iter().map(|s| s.level).max().unwrap_or(0)
    }

    /// The over-budget signal when compaction could not reach the limit.
    pub fn exceeded(&self) -> Option<Error> {
        (!self.within_budget).then(|| Error::BudgetExceeded {
            estimated: self.tokens_after,
            limit: self.limit,
        })
    }
}

/// Applies the compaction levels to a session history.
#[derive(Debug, Clone)]
pub struct TokenBudgetManager {
    settings: BudgetSettings,
    effective_limit: usize,
}

impl TokenBudgetManager {
    pub fn new(settings: BudgetSettings) -> Self {
        Self {
            effective_limit: settings.limit_tokens,
            settings,
        }
    }

    pub fn settings(&self) -> &BudgetSettings {
        &self.settings
    }

    /// Current limit, lowered by [`force_escalate`](Self::force_escalate).
    pub fn limit(&self) -> usize {
        self.effective_limit
    }

    /// Restore the configured limit.
    pub fn reset_limit(&mut self) {
        self.effective_limit = self.settings.limit_tokens;
    }

    fn protected(&self) -> usize {
        self.settings.protected_rounds.max(MIN_PROTECTED_ROUNDS)
    }

    /// Estimated tokens of the history, filling per-message caches.
    pub fn estimate(&self, messages: &mut [Message]) -> usize {
        estimate_messages_tokens(messages, self.settings.image_token_cost)
    }

    /// Compact `messages` until they plus `reserved_tokens` (tool schemas,
    /// response headroom) fit the limit, or nothing more can be done.
    pub fn fit(&self, messages: &mut Vec<Message>, reserved_tokens: usize) -> CompactionReport {
        let limit = self.effective_limit;
        let budget = limit.saturating_sub(reserved_tokens);
        let before = self.estimate(messages);
        let mut report = CompactionReport {
            tokens_before: before,
            tokens_after: before,
            limit,
            ..Default::default()
        };

        let mut current = before;
        if current > budget {
            let collapsed = self.collapse_tool_output(messages, budget, &mut current);
            report.rounds_collapsed = collapsed;
            self.record_step(&mut report, 1, collapsed > 0, current);
        }
        if current > budget {
            let stripped = self.strip_images(messages, &mut current);
            report.images_stripped = stripped;
            self.record_step(&mut report, 2, stripped > 0, current);
        }
        if current > budget {
            let dropped = self.drop_rounds(messages, budget, &mut current);
            report.rounds_dropped = dropped;
            self.record_step(&mut report, 3, dropped > 0, current);
        }

        report.tokens_after = current;
        report.within_budget = current <= budget;
        if !report.within_budget {
            warn!(
                estimated = current,
                limit,
                reserved = reserved_tokens,
                "History still over budget after compaction"
            );
        }
        report
    }

    /// Lower the limit by a quarter and compact again. Used after the
    /// provider rejects a request for exceeding its context window.
    pub fn force_escalate(&mut self, messages: &mut Vec<Message>, reserved_tokens: usize) -> CompactionReport {
        self.effective_limit = self.effective_limit * 3 / 4;
        debug!(limit = self.effective_limit, "Lowered context limit");
        self.fit(messages, reserved_tokens)
    }

    fn record_step(&self, report: &mut CompactionReport, level: u8, changed: bool, current: usize) {
        if !changed {
            return;
        }
        let tokens_before = report.steps.last().map_or(report.tokens_before, |s| s.tokens_after);
        debug!(level, tokens_before, tokens_after = current, "Compaction level applied");
        report.steps.push(CompactionStep {
            level,
            tokens_before,
            tokens_after: current,
        });
    }

    /// Rounds eligible for collapse and drop, oldest first.
    fn unprotected(&self, messages: &[Message]) -> Vec<Range<usize>> {
        let mut rounds = split_rounds(messages);
        let keep = rounds.len().saturating_sub(self.protected());
        rounds.truncate(keep);
        rounds
    }

    // ── Level 1 ───────────────────────────────────────────────────────────

    fn collapse_tool_output(&self, messages: &mut [Message], budget: usize, current: &mut usize) -> usize {
        let mut collapsed = 0;
        while *current > budget {
            let target = self.unprotected(messages).into_iter().find(|range| {
                messages[range.clone()]
                    .iter()
                    .any(|m| m.role == Role::Tool && !m.is_collapsed())
            });
            let Some(range) = target else { break };

            for msg in &mut messages[range] {
                if msg.role != Role::Tool || msg.is_collapsed() {
                    continue;
                }
                let summary = summarize_tool_output(&msg.content, self.settings.summary_max_chars);
                if summary.chars().count() < msg.content.chars().count() {
                    msg.content = summary;
                }
                msg.mark_collapsed();
            }
            collapsed += 1;
            *current = self.estimate(messages);
        }
        collapsed
    }

    // ── Level 2 ───────────────────────────────────────────────────────────

    fn strip_images(&self, messages: &mut [Message], current: &mut usize) -> usize {
        let rounds = split_rounds(messages);
        let Some(latest) = rounds.last() else { return 0 };
        let mut stripped = 0;

        for msg in &mut messages[..latest.start] {
            if msg.role != Role::User || msg.images.is_empty() {
                continue;
            }
            let removed = msg.images.len();
            msg.images.clear();
            msg.metadata.insert(
                IMAGES_REMOVED_KEY.into(),
                serde_json::Value::Array(vec![IMAGE_REMOVED_MARKER.into(); removed]),
            );
            msg.token_estimate = None;
            stripped += removed;
        }
        if stripped > 0 {
            *current = self.estimate(messages);
        }
        stripped
    }

    // ── Level 3 ───────────────────────────────────────────────────────────

    fn drop_rounds(&self, messages: &mut Vec<Message>, budget: usize, current: &mut usize) -> usize {
        let mut dropped = 0;
        while *current > budget {
            let target = self.unprotected(messages).into_iter().find(|range| {
                messages[range.clone()]
                    .iter()
                    .all(|m| m.role != Role::Tool || m.is_collapsed())
            });
            let Some(range) = target else { break };
            messages.drain(range);
            dropped += 1;
            *current = self.estimate(messages);
        }
        dropped
    }
}
