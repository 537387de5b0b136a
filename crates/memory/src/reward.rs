//! Task-outcome scoring and importance updates.
//!
//! `reward = w_success·success + w_efficiency·efficiency − w_error·penalty + w_novelty·novelty`,
//! clamped to `[0, 1]`. The reward then feeds `importance·decay + reward·alpha`
//! for the new episode and for every strategy whose steps the task followed.

use crate::store::MemoryStore;
use crate::vector::cosine_similarity;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use toolweave_config::RewardConfig;
use toolweave_core::error::MemoryError;
use toolweave_core::memory::{ActionRecord, EpisodicRecord};
use tracing::debug;

/// How many recent episodes novelty is measured against.
const NOVELTY_WINDOW: usize = 20;
const ERROR_CORRECTION_BONUS: f32 = 1.2;

/// Everything the loop knows about a finished task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub session_id: String,
    pub task: String,
    /// Tool calls in issue order, with per-call success
    pub actions: Vec<ActionRecord>,
    pub error_count: u32,
    pub retry_count: u32,
    pub success: bool,
    /// The assistant's final answer
    pub final_text: String,
}

impl TaskOutcome {
    pub fn tool_calls(&self) -> usize {
        self.actions.len()
    }

    /// A failed call later followed by a successful one.
    pub fn shows_error_correction(&self) -> bool {
        self.actions
            .iter()
            .position(|a| !a.success)
            .is_some_and(|first_failure| self.actions[first_failure + 1..].iter().any(|a| a.success))
    }

    /// One-line description stored as the episode's result summary.
    pub fn summary(&self) -> String {
        let status = if self.success { "succeeded" } else { "failed" };
        let mut text: String = self.final_text.chars().take(200).collect();
        if text.len() < self.final_text.len() {
            text.push_str("...");
        }
        format!(
            "{status} after {} tool calls ({} errors): {}",
            self.tool_calls(),
            self.error_count,
            text.trim()
        )
    }
}

/// The reward and its components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub success: f32,
    pub efficiency: f32,
    pub error_penalty: f32,
    pub novelty: f32,
    pub reward: f32,
}

/// Scores outcomes and writes the resulting episode.
pub struct RewardEngine {
    store: Arc<MemoryStore>,
    config: RewardConfig,
}

impl RewardEngine {
    pub fn new(store: Arc<MemoryStore>, config: RewardConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Score an outcome whose episode vector is `embedding`.
    pub fn evaluate(&self, outcome: &TaskOutcome, embedding: &[f32]) -> RewardBreakdown {
        let success = if outcome.success { 1.0 } else { 0.0 };
        let calls = outcome.tool_calls().max(1) as f32;
        let efficiency = 1.0 / (1.0 + 0.1 * calls + 0.3 * outcome.retry_count as f32);
        let error_penalty = (0.2 * outcome.error_count as f32).min(1.0);
        let novelty = self.novelty(embedding);

        let c = &self.config;
        let mut reward = (c.w_success * success + c.w_efficiency * efficiency
            - c.w_error * error_penalty
            + c.w_novelty * novelty)
            .clamp(0.0, 1.0);
        if outcome.success && outcome.shows_error_correction() {
            reward = (reward * ERROR_CORRECTION_BONUS).min(1.0);
        }

        RewardBreakdown {
            success,
            efficiency,
            error_penalty,
            novelty,
            reward,
        }
    }

    /// `1 − max similarity` to the most recent episodes; 1.0 when there are none.
    fn novelty(&self, embedding: &[f32]) -> f32 {
        let snap = self.store.snapshot();
        snap.recent_episodes(NOVELTY_WINDOW)
            .map(|e| cosine_similarity(&e.embedding, embedding))
            .fold(None, |best: Option<f32>, sim| Some(best.map_or(sim, |b| b.max(sim))))
            .map_or(1.0, |max_sim| (1.0 - max_sim).clamp(0.0, 1.0))
    }

    /// `importance·decay + reward·alpha`, clamped to `[0.01, 5]`.
    pub fn updated_importance(&self, importance: f32, reward: f32) -> f32 {
        (importance * self.config.decay + reward * self.config.alpha).clamp(0.01, 5.0)
    }

    /// Score the outcome, record it as an episode and reinforce the
    /// strategies it followed. Returns the episode id and the breakdown.
    pub async fn record(
        &self,
        outcome: &TaskOutcome,
        tags: Vec<String>,
        embedding: Vec<f32>,
    ) -> Result<(String, RewardBreakdown), MemoryError> {
        let breakdown = self.evaluate(outcome, &embedding);

        let mut episode = EpisodicRecord::new(&outcome.task, outcome.summary(), outcome.success);
        episode.session_id = outcome.session_id.clone();
        episode.actions = outcome.actions.clone();
        episode.error_count = outcome.error_count;
        episode.retry_count = outcome.retry_count;
        episode.reward = breakdown.reward;
        episode.importance = self.updated_importance(episode.importance, breakdown.reward);
        episode.tags = tags;
        episode.embedding = embedding;

        let id = self.store.record_episode(episode).await?;
        debug!(
            episode = %id,
            reward = breakdown.reward,
            efficiency = breakdown.efficiency,
            novelty = breakdown.novelty,
            "Scored task outcome"
        );

        self.reinforce_strategies(outcome, breakdown.reward).await?;

        let every = self.config.time_decay_every;
        if every > 0 && self.store.snapshot().episodes().len() % every == 0 {
            let touched = self.store.decay_importance(self.config.time_decay_lambda).await?;
            debug!(touched, "Applied time decay to episode importance");
        }

        Ok((id, breakdown))
    }

    /// Update priority and usage of every strategy whose steps appear, in
    /// order, in the task's tool sequence.
    async fn reinforce_strategies(&self, outcome: &TaskOutcome, reward: f32) -> Result<(), MemoryError> {
        let tools: Vec<&str> = outcome.actions.iter().map(|a| a.tool.as_str()).collect();
        let followed: Vec<(String, f32)> = self
            .store
            .snapshot()
            .strategies()
            .iter()
            .filter(|s| !s.steps.is_empty() && is_subsequence(&s.steps, &tools))
            .map(|s| (s.name.clone(), s.priority))
            .collect();

        for (name, priority) in followed {
            let next = (priority * self.config.decay + reward * self.config.alpha).clamp(0.0, 1.0);
            self.store.set_strategy_priority(&name, next).await?;
            self.store.record_strategy_usage(&name, outcome.success).await?;
            debug!(strategy = %name, priority = next, "Reinforced strategy");
        }
        Ok(())
    }
}

/// Whether `steps` occur in `tools` in the same relative order.
fn is_subsequence(steps: &[String], tools: &[&str]) -> bool {
    let mut it = tools.iter();
    steps.iter().all(|step| it.any(|t| *t == step.as_str()))
}
