//! Deriving semantic and procedural memory from finished tasks.
//!
//! Two passes:
//! - a rule pass after every task: tags the episode, clusters it with
//!   similar successful episodes into a [`SemanticRule`], and promotes
//!   repeated successful tool sequences to [`ProceduralStrategy`]s;
//! - a deep pass, every `deep_interval` tasks or after an error spike, that
//!   asks a model to generalize the recent episodes.

use crate::reward::{RewardBreakdown, RewardEngine, TaskOutcome};
use crate::store::{MemoryStore, RuleUpsert};
use crate::vector::cosine_similarity;
use serde::Deserialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use toolweave_config::{MemoryConfig, ReflectionConfig};
use toolweave_core::error::{Error, MemoryError, Result};
use toolweave_core::memory::{EpisodicRecord, ProceduralStrategy, SemanticRule};
use toolweave_core::message::Message;
use toolweave_core::provider::{Provider, ProviderRequest, Usage};
use tracing::{debug, info, warn};

/// Recent episodes considered when clustering.
const CLUSTER_WINDOW: usize = 50;
/// Episodes summarized for the deep pass.
const DEEP_PASS_EPISODES: usize = 10;
/// Tasks whose error counts feed the spike check.
const ERROR_WINDOW: usize = 3;
const RECENT_ERRORS_KEPT: usize = 10;
/// Priority bump when an already-promoted sequence repeats again.
const PROMOTION_STEP: f32 = 0.05;
const PROMOTED_PRIORITY: f32 = 0.5;
/// Confidence lost by a rule each time a matching task fails.
const RULE_PENALTY: f32 = 0.1;

const DEEP_PASS_SYSTEM: &str =
    "You are a self-improving assistant reviewing your own past work. Reply with JSON only.";

const DEEP_PASS_PROMPT: &str = r#"Below are summaries of recently completed tasks.

{episodes}

Extract what generalizes. Reply with one JSON object:
{
  "semantic_rules": [
    {"rule": "a general, reusable statement", "category": "error_handling|workflow|tool_usage|performance|general", "confidence": 0.6}
  ],
  "strategy_updates": [
    {"name": "existing_strategy_name", "priority_delta": 0.1, "reason": "why"}
  ]
}
Only include rules supported by more than one task. Use an empty list when nothing applies."#;

/// What the rule pass did for one task.
#[derive(Debug, Clone)]
pub struct ReflectionReport {
    pub episode_id: String,
    pub reward: RewardBreakdown,
    pub tags: Vec<String>,
    /// Rules created or strengthened by clustering
    pub rules: Vec<RuleUpsert>,
    /// Rules weakened because this task failed
    pub weakened: Vec<String>,
    /// Strategies created or raised by sequence promotion
    pub promoted: Vec<String>,
    /// Whether the caller should run [`ReflectionEngine::deep_pass`]
    pub deep_pass_due: bool,
}

/// What a deep pass changed.
#[derive(Debug, Clone, Default)]
pub struct DeepPassReport {
    pub episodes_reviewed: usize,
    pub rules: Vec<RuleUpsert>,
    pub strategies_updated: Vec<String>,
    pub usage: Usage,
}

#[derive(Debug, Default)]
struct Counters {
    tasks_since_deep: usize,
    recent_errors: VecDeque<u32>,
}

/// Runs the rule pass after each task and the model-backed deep pass on demand.
pub struct ReflectionEngine {
    reward: Arc<RewardEngine>,
    provider: Option<Arc<dyn Provider>>,
    model: String,
    config: ReflectionConfig,
    cluster_min_episodes: usize,
    cluster_threshold: f32,
    max_episodes: usize,
    counters: Mutex<Counters>,
}

impl ReflectionEngine {
    pub fn new(reward: Arc<RewardEngine>, config: ReflectionConfig, memory: &MemoryConfig) -> Self {
        Self {
            reward,
            provider: None,
            model: String::new(),
            config,
            cluster_min_episodes: memory.cluster_min_episodes.max(1),
            cluster_threshold: memory.cluster_threshold,
            max_episodes: memory.max_episodes,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Enable the deep pass through `provider`.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        self.provider = Some(provider);
        self.model = model.into();
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        self.reward.store()
    }

    /// Record a finished task and run the rule pass over it.
    pub async fn after_task(&self, outcome: &TaskOutcome) -> std::result::Result<ReflectionReport, MemoryError> {
        let store = self.store();
        let tags = rule_tags(outcome);
        let embedding = store
            .embed(&format!("{}\n{}", outcome.task, outcome.summary()))
            .await;

        let (episode_id, reward) = self
            .reward
            .record(outcome, tags.clone(), embedding.clone())
            .await?;

        let mut rules = Vec::new();
        let mut promoted = Vec::new();
        let mut weakened = Vec::new();
        if !outcome.success {
            weakened = self.weaken_rules(&embedding).await?;
        } else {
            if let Some(upsert) = self.cluster(&episode_id).await? {
                rules.push(upsert);
            }
            if let Some(name) = self.promote_sequence(outcome).await? {
                promoted.push(name);
            }
        }

        if self.max_episodes > 0 {
            let pruned = store.prune_episodes(self.max_episodes).await?;
            if pruned > 0 {
                debug!(pruned, "Pruned low-importance episodes");
            }
        }

        let deep_pass_due = self.track(outcome.error_count);
        debug!(
            episode = %episode_id,
            tags = ?tags,
            rules = rules.len(),
            weakened = weakened.len(),
            promoted = promoted.len(),
            deep_pass_due,
            "Rule pass finished"
        );

        Ok(ReflectionReport {
            episode_id,
            reward,
            tags,
            rules,
            weakened,
            promoted,
            deep_pass_due,
        })
    }

    /// Lower the confidence of every rule close to a failed task.
    async fn weaken_rules(&self, embedding: &[f32]) -> std::result::Result<Vec<String>, MemoryError> {
        let threshold = self.store().limits().rule_dedup_threshold;
        let snap = self.store().snapshot();
        let mut weakened = Vec::new();
        for rule in snap.rules() {
            if cosine_similarity(&rule.embedding, embedding) < threshold {
                continue;
            }
            let confidence = (rule.confidence - RULE_PENALTY).max(0.0);
            self.store().set_rule_confidence(&rule.id, confidence).await?;
            debug!(rule = %rule.id, confidence, "Weakened rule after a failed task");
            weakened.push(rule.id.clone());
        }
        Ok(weakened)
    }

    /// Group the new episode with similar successful ones; emit or
    /// strengthen a rule once the group is large enough.
    async fn cluster(&self, episode_id: &str) -> std::result::Result<Option<RuleUpsert>, MemoryError> {
        let snap = self.store().snapshot();
        let Some(anchor) = snap.episode(episode_id) else {
            return Ok(None);
        };

        let similar: Vec<&EpisodicRecord> = snap
            .recent_episodes(CLUSTER_WINDOW)
            .filter(|e| cosine_similarity(&e.embedding, &anchor.embedding) >= self.cluster_threshold)
            .collect();
        let members: Vec<&EpisodicRecord> = similar.iter().copied().filter(|e| e.success).collect();
        if members.len() < self.cluster_min_episodes {
            return Ok(None);
        }

        let success_rate = members.len() as f32 / similar.len() as f32;
        let tools = common_tools(&members);
        let rule_text = if tools.is_empty() {
            format!(
                "Tasks like \"{}\" can be answered directly without tools ({:.0}% success over {} similar tasks)",
                anchor.task,
                success_rate * 100.0,
                similar.len()
            )
        } else {
            format!(
                "Tasks like \"{}\" succeed using {} ({:.0}% success over {} similar tasks)",
                anchor.task,
                tools.join(", "),
                success_rate * 100.0,
                similar.len()
            )
        };

        let mut rule = SemanticRule::new(rule_text, "workflow");
        rule.confidence = success_rate.clamp(0.3, 0.9);
        rule.source_episodes = members.iter().map(|e| e.id.clone()).collect();
        let upsert = self.store().upsert_semantic_rule(rule).await?;
        info!(
            rule = %upsert.id(),
            members = members.len(),
            success_rate,
            "Derived rule from episode cluster"
        );
        Ok(Some(upsert))
    }

    /// Turn a successful tool sequence seen often enough into a strategy.
    async fn promote_sequence(&self, outcome: &TaskOutcome) -> std::result::Result<Option<String>, MemoryError> {
        let sequence = successful_sequence(outcome.actions.iter().filter(|a| a.success).map(|a| a.tool.as_str()));
        if sequence.len() < 2 {
            return Ok(None);
        }

        let snap = self.store().snapshot();
        let repeats = snap
            .episodes()
            .iter()
            .filter(|e| e.success)
            .filter(|e| {
                successful_sequence(e.actions.iter().filter(|a| a.success).map(|a| a.tool.as_str()))
                    == sequence
            })
            .count();
        if repeats < self.config.strategy_min_repeats.max(1) {
            return Ok(None);
        }

        let name = sequence.join("_then_");
        let strategy = match snap.strategy(&name) {
            Some(existing) => {
                ProceduralStrategy::new(&name, &existing.description, existing.priority + PROMOTION_STEP)
            }
            None => ProceduralStrategy::new(
                &name,
                format!("Call {} in that order", sequence.join(", then ")),
                PROMOTED_PRIORITY,
            )
            .with_steps(sequence.clone())
            .with_conditions(vec![outcome.task.clone()]),
        };
        self.store().upsert_strategy(strategy).await?;
        info!(strategy = %name, repeats, "Promoted tool sequence to strategy");
        Ok(Some(name))
    }

    /// Update the counters and decide whether a deep pass is due.
    fn track(&self, errors: u32) -> bool {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.tasks_since_deep += 1;
        counters.recent_errors.push_back(errors);
        while counters.recent_errors.len() > RECENT_ERRORS_KEPT {
            counters.recent_errors.pop_front();
        }

        if !self.config.deep_pass_enabled || self.provider.is_none() {
            return false;
        }
        if counters.tasks_since_deep >= self.config.deep_interval.max(1) {
            return true;
        }
        if counters.recent_errors.len() >= ERROR_WINDOW {
            let failing = counters
                .recent_errors
                .iter()
                .rev()
                .take(ERROR_WINDOW)
                .filter(|e| **e > 0)
                .count();
            return failing as f32 / ERROR_WINDOW as f32 >= self.config.error_spike_threshold;
        }
        false
    }

    /// Ask the model to generalize the most recent episodes and apply what
    /// it returns. Resets the task counter even when it fails.
    pub async fn deep_pass(&self) -> Result<DeepPassReport> {
        let Some(provider) = self.provider.clone() else {
            return Err(Error::Internal("deep reflection has no provider configured".into()));
        };
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks_since_deep = 0;

        let snap = self.store().snapshot();
        let recent: Vec<&EpisodicRecord> = snap.recent_episodes(DEEP_PASS_EPISODES).collect();
        if recent.is_empty() {
            return Ok(DeepPassReport::default());
        }

        let prompt = DEEP_PASS_PROMPT.replace("{episodes}", &episode_summaries(&recent));
        let request = ProviderRequest::new(
            self.model.clone(),
            vec![Message::system(DEEP_PASS_SYSTEM), Message::user(prompt)],
        )
        .with_temperature(0.3)
        .with_max_tokens(Some(1500));

        info!(provider = %provider.name(), episodes = recent.len(), "Starting deep reflection");
        let response = provider.complete(request).await.inspect_err(|e| {
            warn!(error = %e, "Deep reflection call failed");
        })?;

        let parsed = parse_deep_pass(&response.message.content).inspect_err(|e| {
            warn!(error = %e, "Deep reflection returned an unusable answer");
        })?;
        let sources: Vec<String> = recent.iter().take(5).map(|e| e.id.clone()).collect();

        let mut report = DeepPassReport {
            episodes_reviewed: recent.len(),
            usage: response.usage,
            ..Default::default()
        };

        for entry in parsed.semantic_rules {
            let (text, category, confidence) = entry.into_parts();
            if text.trim().is_empty() {
                continue;
            }
            let mut rule = SemanticRule::new(text, category);
            rule.confidence = confidence;
            rule.source_episodes = sources.clone();
            report.rules.push(self.store().upsert_semantic_rule(rule).await?);
        }

        for update in parsed.strategy_updates {
            if update.name.is_empty() || update.priority_delta == 0.0 {
                continue;
            }
            // Re-read: reward updates may have landed during the model call.
            let Some(current) = self.store().snapshot().strategy(&update.name).map(|s| s.priority) else {
                debug!(strategy = %update.name, "Deep reflection named an unknown strategy");
                continue;
            };
            self.store()
                .set_strategy_priority(&update.name, current + update.priority_delta)
                .await?;
            info!(
                strategy = %update.name,
                delta = update.priority_delta,
                reason = %update.reason,
                "Strategy priority adjusted"
            );
            report.strategies_updated.push(update.name);
        }

        info!(
            rules = report.rules.len(),
            strategies = report.strategies_updated.len(),
            "Deep reflection finished"
        );
        Ok(report)
    }
}

/// Signal tags for an outcome.
pub fn rule_tags(outcome: &TaskOutcome) -> Vec<String> {
    let mut tags = Vec::new();
    let had_error = outcome.error_count > 0 || outcome.actions.iter().any(|a| !a.success);

    if outcome.retry_count > 2 {
        tags.push("retry_heavy");
    }
    if outcome.success && outcome.shows_error_correction() {
        tags.push("error_correction");
    }
    if had_error && !outcome.success {
        tags.push("unresolved_error");
    }
    if outcome.tool_calls() > 10 {
        tags.push("complex_task");
    }
    if outcome.tool_calls() <= 3 && outcome.success {
        tags.push("efficient_task");
    }
    tags.into_iter().map(String::from).collect()
}

/// Tool names with consecutive repeats folded together.
fn successful_sequence<'a>(tools: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seq: Vec<String> = Vec::new();
    for tool in tools {
        if seq.last().map(String::as_str) != Some(tool) {
            seq.push(tool.to_string());
        }
    }
    seq
}

/// Tools used by every member, in the first member's order.
fn common_tools(members: &[&EpisodicRecord]) -> Vec<String> {
    let Some((first, rest)) = members.split_first() else {
        return Vec::new();
    };
    let sets: Vec<BTreeSet<&str>> = rest.iter().map(|e| e.tool_sequence().into_iter().collect()).collect();
    let mut seen = BTreeSet::new();
    first
        .tool_sequence()
        .into_iter()
        .filter(|t| seen.insert(*t))
        .filter(|t| sets.iter().all(|s| s.contains(t)))
        .map(String::from)
        .collect()
}

fn episode_summaries(episodes: &[&EpisodicRecord]) -> String {
    episodes
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let status = if e.success { "SUCCESS" } else { "FAILURE" };
            let tags = if e.tags.is_empty() {
                "none".to_string()
            } else {
                e.tags.join(", ")
            };
            format!(
                "{}. [{status}] Task: {}\n   Result: {}\n   Tools: {}\n   Errors: {}, retries: {}, reward: {:.2}\n   Tags: {tags}",
                i + 1,
                e.task,
                e.result_summary,
                e.tool_sequence().join(" -> "),
                e.error_count,
                e.retry_count,
                e.reward,
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ── Deep-pass answer ───────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct DeepPassAnswer {
    #[serde(default)]
    semantic_rules: Vec<RuleEntry>,
    #[serde(default)]
    strategy_updates: Vec<StrategyUpdate>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuleEntry {
    Text(String),
    Full {
        rule: String,
        #[serde(default = "default_rule_category")]
        category: String,
        #[serde(default = "default_rule_confidence")]
        confidence: f32,
    },
}

fn default_rule_category() -> String {
    "general".into()
}
fn default_rule_confidence() -> f32 {
    0.6
}

impl RuleEntry {
    fn into_parts(self) -> (String, String, f32) {
        match self {
            RuleEntry::Text(rule) => (rule, default_rule_category(), default_rule_confidence()),
            RuleEntry::Full {
                rule,
                category,
                confidence,
            } => (rule, category, confidence),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StrategyUpdate {
    #[serde(default)]
    name: String,
    #[serde(default)]
    priority_delta: f32,
    #[serde(default)]
    reason: String,
}

/// Strip a code fence, then parse the text or its outermost `{...}`.
fn parse_deep_pass(text: &str) -> Result<DeepPassAnswer> {
    let mut body = text.trim();
    if body.starts_with("```") {
        body = body.split_once('\n').map_or("", |(_, rest)| rest);
        body = body.trim_end().trim_end_matches("```").trim();
    }

    if let Ok(answer) = serde_json::from_str(body) {
        return Ok(answer);
    }
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => Ok(serde_json::from_str(&body[start..=end])?),
        _ => Err(Error::Internal("reflection answer contained no JSON object".into())),
    }
}
