//! The in-process memory store.
//!
//! Readers take a cheap clone of the current [`Snapshot`] and never wait for
//! writers. Writers are serialized by one async mutex: each write clones the
//! snapshot, applies its change, persists the touched records through the
//! backend and only then swaps the new snapshot in. A failed persist leaves
//! the visible state untouched.

use crate::embedding::EmbeddingService;
use crate::vector::{cosine_similarity, rank, top_k};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use toolweave_config::MemoryConfig;
use toolweave_core::error::MemoryError;
use toolweave_core::memory::{
    EpisodicRecord, MemoryBackend, MemoryLayer, MemoryRecord, ProceduralStrategy, RetrievalSet,
    SemanticRule, StoredMemory,
};
use tracing::{debug, info};

const MIN_IMPORTANCE: f32 = 0.01;
const MAX_IMPORTANCE: f32 = 5.0;
/// Rules below this confidence are kept but no longer recalled.
pub const MIN_RECALL_CONFIDENCE: f32 = 0.2;

/// Immutable view of all three layers.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    episodes: Vec<EpisodicRecord>,
    rules: Vec<SemanticRule>,
    strategies: Vec<ProceduralStrategy>,
}

impl Snapshot {
    /// Episodes, oldest first.
    pub fn episodes(&self) -> &[EpisodicRecord] {
        &self.episodes
    }

    pub fn rules(&self) -> &[SemanticRule] {
        &self.rules
    }

    pub fn strategies(&self) -> &[ProceduralStrategy] {
        &self.strategies
    }

    /// The `n` newest episodes, newest first.
    pub fn recent_episodes(&self, n: usize) -> impl Iterator<Item = &EpisodicRecord> {
        self.episodes.iter().rev().take(n)
    }

    pub fn strategy(&self, name: &str) -> Option<&ProceduralStrategy> {
        self.strategies.iter().find(|s| s.name == name)
    }

    pub fn episode(&self, id: &str) -> Option<&EpisodicRecord> {
        self.episodes.iter().find(|e| e.id == id)
    }
}

impl From<StoredMemory> for Snapshot {
    fn from(mut stored: StoredMemory) -> Self {
        stored.episodes.sort_by_key(|e| e.timestamp);
        Self {
            episodes: stored.episodes,
            rules: stored.rules,
            strategies: stored.strategies,
        }
    }
}

/// Outcome of [`MemoryStore::upsert_semantic_rule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleUpsert {
    Created(String),
    /// An existing rule was similar enough and got strengthened instead.
    Strengthened(String),
}

impl RuleUpsert {
    pub fn id(&self) -> &str {
        match self {
            RuleUpsert::Created(id) | RuleUpsert::Strengthened(id) => id,
        }
    }
}

/// Per-layer counts and a few aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub episodes: usize,
    pub successful_episodes: usize,
    pub rules: usize,
    pub strategies: usize,
    pub average_reward: f32,
    pub average_importance: f32,
}

/// Tunables the store needs from `[memory]`.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub procedural_capacity: usize,
    pub rule_dedup_threshold: f32,
}

impl From<&MemoryConfig> for StoreLimits {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            procedural_capacity: config.procedural_capacity.max(1),
            rule_dedup_threshold: config.rule_dedup_threshold,
        }
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::from(&MemoryConfig::default())
    }
}

enum Change {
    Put(MemoryRecord),
    Remove(MemoryLayer, String),
}

/// Episodic, semantic and procedural memory with copy-on-write reads.
pub struct MemoryStore {
    snapshot: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
    backend: Arc<dyn MemoryBackend>,
    embeddings: Arc<EmbeddingService>,
    limits: StoreLimits,
}

impl MemoryStore {
    /// Load everything the backend holds.
    pub async fn open(
        backend: Arc<dyn MemoryBackend>,
        embeddings: Arc<EmbeddingService>,
        limits: StoreLimits,
    ) -> Result<Self, MemoryError> {
        let stored = backend.load().await?;
        info!(
            backend = %backend.name(),
            episodes = stored.episodes.len(),
            rules = stored.rules.len(),
            strategies = stored.strategies.len(),
            "Memory store opened"
        );
        Ok(Self {
            snapshot: RwLock::new(Arc::new(Snapshot::from(stored))),
            writer: Mutex::new(()),
            backend,
            embeddings,
            limits,
        })
    }

    /// An empty, non-persistent store with hashed embeddings.
    pub fn ephemeral(dimension: usize, limits: StoreLimits) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(()),
            backend: Arc::new(crate::in_memory::InMemoryBackend::new()),
            embeddings: Arc::new(EmbeddingService::hashed(dimension)),
            limits,
        }
    }

    /// Current state. Never blocks on an in-progress write.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingService> {
        &self.embeddings
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    pub async fn embed(&self, text: &str) -> Vec<f32> {
        self.embeddings.embed(text).await
    }

    /// Clone the snapshot, let `f` edit it, persist its changes, swap.
    async fn write<R>(
        &self,
        f: impl FnOnce(&mut Snapshot) -> (R, Vec<Change>),
    ) -> Result<R, MemoryError> {
        let _guard = self.writer.lock().await;
        let mut next = (*self.snapshot()).clone();
        let (result, changes) = f(&mut next);

        for change in &changes {
            match change {
                Change::Put(record) => self.backend.persist(record).await?,
                Change::Remove(layer, id) => {
                    self.backend.remove(*layer, id).await?;
                }
            }
        }

        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Ok(result)
    }

    // ── Episodic ───────────────────────────────────────────────

    /// Append an episode. Embeds `task` + `result_summary` when the record
    /// has no vector yet. Importance is clamped to its valid range.
    pub async fn record_episode(&self, mut episode: EpisodicRecord) -> Result<String, MemoryError> {
        if episode.embedding.is_empty() {
            episode.embedding = self
                .embed(&format!("{}\n{}", episode.task, episode.result_summary))
                .await;
        }
        episode.importance = episode.importance.clamp(MIN_IMPORTANCE, MAX_IMPORTANCE);
        let id = episode.id.clone();

        self.write(|snap| {
            snap.episodes.push(episode.clone());
            ((), vec![Change::Put(MemoryRecord::Episode(episode))])
        })
        .await?;

        debug!(episode = %id, "Recorded episode");
        Ok(id)
    }

    pub async fn set_episode_importance(&self, id: &str, importance: f32) -> Result<(), MemoryError> {
        let id = id.to_string();
        self.write(|snap| {
            let Some(e) = snap.episodes.iter_mut().find(|e| e.id == id) else {
                return (Err(MemoryError::NotFound(id)), vec![]);
            };
            e.importance = importance.clamp(MIN_IMPORTANCE, MAX_IMPORTANCE);
            (Ok(()), vec![Change::Put(MemoryRecord::Episode(e.clone()))])
        })
        .await?
    }

    /// `importance · e^(−λ·age_days)` for every episode, floored at 0.01.
    pub async fn decay_importance(&self, lambda: f32) -> Result<usize, MemoryError> {
        let now = Utc::now();
        self.write(|snap| {
            let mut changes = Vec::new();
            for e in &mut snap.episodes {
                let days = (now - e.timestamp).num_seconds().max(0) as f32 / 86_400.0;
                let decayed = (e.importance * (-lambda * days).exp()).max(MIN_IMPORTANCE);
                if (decayed - e.importance).abs() > f32::EPSILON {
                    e.importance = decayed;
                    changes.push(Change::Put(MemoryRecord::Episode(e.clone())));
                }
            }
            (changes.len(), changes)
        })
        .await
    }

    /// Drop the least important episodes so at most `max` remain.
    pub async fn prune_episodes(&self, max: usize) -> Result<usize, MemoryError> {
        self.write(|snap| {
            if snap.episodes.len() <= max {
                return (0, vec![]);
            }
            let mut order: Vec<(f32, chrono::DateTime<Utc>, String)> = snap
                .episodes
                .iter()
                .map(|e| (e.importance, e.timestamp, e.id.clone()))
                .collect();
            order.sort_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.cmp(&b.1))
            });
            let excess = snap.episodes.len() - max;
            let doomed: Vec<String> = order.into_iter().take(excess).map(|(_, _, id)| id).collect();
            snap.episodes.retain(|e| !doomed.contains(&e.id));
            let changes = doomed
                .into_iter()
                .map(|id| Change::Remove(MemoryLayer::Episodic, id))
                .collect();
            (excess, changes)
        })
        .await
    }

    // ── Semantic ───────────────────────────────────────────────

    /// Insert a rule, or strengthen an existing one whose vector is within
    /// `rule_dedup_threshold`: confidence +0.1 (max 1.0), activation +1, and
    /// the supporting episodes merged. The existing rule text is kept.
    pub async fn upsert_semantic_rule(&self, mut rule: SemanticRule) -> Result<RuleUpsert, MemoryError> {
        if rule.embedding.is_empty() {
            rule.embedding = self.embed(&rule.rule).await;
        }
        rule.confidence = rule.confidence.clamp(0.0, 1.0);
        let threshold = self.limits.rule_dedup_threshold;

        let outcome = self
            .write(|snap| {
                let best = snap
                    .rules
                    .iter_mut()
                    .map(|r| (cosine_similarity(&r.embedding, &rule.embedding), r))
                    .filter(|(sim, _)| *sim >= threshold)
                    .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

                match best {
                    Some((_, existing)) => {
                        existing.confidence = (existing.confidence + 0.1).min(1.0);
                        existing.activation_count += 1;
                        existing.updated_at = Utc::now();
                        for ep in &rule.source_episodes {
                            if !existing.source_episodes.contains(ep) {
                                existing.source_episodes.push(ep.clone());
                            }
                        }
                        let id = existing.id.clone();
                        (
                            RuleUpsert::Strengthened(id),
                            vec![Change::Put(MemoryRecord::Rule(existing.clone()))],
                        )
                    }
                    None => {
                        let id = rule.id.clone();
                        snap.rules.push(rule.clone());
                        (RuleUpsert::Created(id), vec![Change::Put(MemoryRecord::Rule(rule))])
                    }
                }
            })
            .await?;

        match &outcome {
            RuleUpsert::Created(id) => info!(rule = %id, "Semantic rule created"),
            RuleUpsert::Strengthened(id) => info!(rule = %id, "Semantic rule strengthened"),
        }
        Ok(outcome)
    }

    pub async fn set_rule_confidence(&self, id: &str, confidence: f32) -> Result<(), MemoryError> {
        let id = id.to_string();
        self.write(|snap| {
            let Some(r) = snap.rules.iter_mut().find(|r| r.id == id) else {
                return (Err(MemoryError::NotFound(id)), vec![]);
            };
            r.confidence = confidence.clamp(0.0, 1.0);
            r.updated_at = Utc::now();
            (Ok(()), vec![Change::Put(MemoryRecord::Rule(r.clone()))])
        })
        .await?
    }

    // ── Procedural ─────────────────────────────────────────────

    /// Insert a strategy, or update the priority of the one with the same
    /// name (its description and steps stay as first recorded). Beyond
    /// `procedural_capacity` the lowest-priority strategy is evicted, least
    /// recently used first on ties. Returns the id of the stored strategy.
    pub async fn upsert_strategy(&self, mut strategy: ProceduralStrategy) -> Result<String, MemoryError> {
        if strategy.embedding.is_empty() {
            let text = format!(
                "{} {} {}",
                strategy.name.replace('_', " "),
                strategy.description,
                strategy.conditions.join(" ")
            );
            strategy.embedding = self.embed(&text).await;
        }
        strategy.priority = strategy.priority.clamp(0.0, 1.0);
        let capacity = self.limits.procedural_capacity;

        let (id, evicted) = self
            .write(|snap| {
                let mut changes = Vec::new();
                let id = match snap.strategies.iter_mut().find(|s| s.name == strategy.name) {
                    Some(existing) => {
                        existing.priority = strategy.priority;
                        for c in &strategy.conditions {
                            if !existing.conditions.contains(c) {
                                existing.conditions.push(c.clone());
                            }
                        }
                        changes.push(Change::Put(MemoryRecord::Strategy(existing.clone())));
                        existing.id.clone()
                    }
                    None => {
                        let id = strategy.id.clone();
                        snap.strategies.push(strategy.clone());
                        changes.push(Change::Put(MemoryRecord::Strategy(strategy)));
                        id
                    }
                };

                let mut evicted = Vec::new();
                while snap.strategies.len() > capacity {
                    let Some(victim) = snap
                        .strategies
                        .iter()
                        .enumerate()
                        .min_by(|(_, a), (_, b)| {
                            a.priority
                                .partial_cmp(&b.priority)
                                .unwrap_or(std::cmp::Ordering::Equal)
                                .then(a.last_used.cmp(&b.last_used))
                        })
                        .map(|(i, _)| i)
                    else {
                        break;
                    };
                    let gone = snap.strategies.remove(victim);
                    changes.push(Change::Remove(MemoryLayer::Procedural, gone.id.clone()));
                    evicted.push(gone.name);
                }
                ((id, evicted), changes)
            })
            .await?;

        for name in evicted {
            info!(strategy = %name, "Evicted lowest-priority strategy");
        }
        Ok(id)
    }

    pub async fn set_strategy_priority(&self, name: &str, priority: f32) -> Result<(), MemoryError> {
        let name = name.to_string();
        self.write(|snap| {
            let Some(s) = snap.strategies.iter_mut().find(|s| s.name == name) else {
                return (Err(MemoryError::NotFound(name)), vec![]);
            };
            s.priority = priority.clamp(0.0, 1.0);
            (Ok(()), vec![Change::Put(MemoryRecord::Strategy(s.clone()))])
        })
        .await?
    }

    /// Count one use and fold the outcome into the success rate with
    /// `α = min(0.3, 1/n)`.
    pub async fn record_strategy_usage(&self, name: &str, success: bool) -> Result<(), MemoryError> {
        let name = name.to_string();
        self.write(|snap| {
            let Some(s) = snap.strategies.iter_mut().find(|s| s.name == name) else {
                return (Err(MemoryError::NotFound(name)), vec![]);
            };
            s.usage_count += 1;
            let alpha = (1.0 / s.usage_count as f32).min(0.3);
            let outcome = if success { 1.0 } else { 0.0 };
            s.success_rate = if s.usage_count == 1 {
                outcome
            } else {
                s.success_rate * (1.0 - alpha) + outcome * alpha
            };
            s.last_used = Utc::now();
            (Ok(()), vec![Change::Put(MemoryRecord::Strategy(s.clone()))])
        })
        .await?
    }

    /// Insert the general-purpose strategies when the procedural layer is
    /// empty. Returns how many were added.
    pub async fn seed_default_strategies(&self) -> Result<usize, MemoryError> {
        if !self.snapshot().strategies.is_empty() {
            return Ok(0);
        }
        let seeds = default_strategies();
        let count = seeds.len();
        for strategy in seeds {
            self.upsert_strategy(strategy).await?;
        }
        info!(count, "Seeded default strategies");
        Ok(count)
    }

    // ── Retrieval ──────────────────────────────────────────────

    /// Top `k` per layer by cosine similarity; ties go to the newer record.
    pub fn retrieve(&self, query: &[f32], k: usize) -> RetrievalSet {
        let snap = self.snapshot();
        RetrievalSet {
            episodes: top_k(&snap.episodes, query, k),
            rules: top_k(&snap.rules, query, k),
            strategies: top_k(&snap.strategies, query, k),
        }
    }

    /// Like [`retrieve`](Self::retrieve), but each layer's similarity is
    /// weighted by importance, confidence or priority. Rules under
    /// [`MIN_RECALL_CONFIDENCE`] are skipped.
    pub fn recall(&self, query: &[f32], k: usize) -> RetrievalSet {
        let snap = self.snapshot();
        RetrievalSet {
            episodes: rank(&snap.episodes, query, k, |e, sim| {
                sim * (0.5 + 0.5 * e.importance.min(2.0))
            }),
            rules: rank(
                snap.rules.iter().filter(|r| r.confidence >= MIN_RECALL_CONFIDENCE),
                query,
                k,
                |r, sim| sim * (0.5 + 0.5 * r.confidence),
            ),
            strategies: rank(&snap.strategies, query, k, |s, sim| {
                sim * (0.3 + 0.7 * s.priority)
            }),
        }
    }

    /// Embed `text` and [`recall`](Self::recall).
    pub async fn search_text(&self, text: &str, k: usize) -> RetrievalSet {
        let query = self.embed(text).await;
        self.recall(&query, k)
    }

    pub fn stats(&self) -> MemoryStats {
        let snap = self.snapshot();
        let n = snap.episodes.len();
        let (reward_sum, importance_sum) = snap
            .episodes
            .iter()
            .fold((0.0f32, 0.0f32), |(r, i), e| (r + e.reward, i + e.importance));
        MemoryStats {
            episodes: n,
            successful_episodes: snap.episodes.iter().filter(|e| e.success).count(),
            rules: snap.rules.len(),
            strategies: snap.strategies.len(),
            average_reward: if n == 0 { 0.0 } else { reward_sum / n as f32 },
            average_importance: if n == 0 { 0.0 } else { importance_sum / n as f32 },
        }
    }
}

/// General strategies every fresh store starts with.
pub fn default_strategies() -> Vec<ProceduralStrategy> {
    vec![
        ProceduralStrategy::new(
            "decompose_complex_task",
            "Break a large request into small verifiable steps and work through them in order",
            0.7,
        )
        .with_conditions(vec!["complex".into(), "multi-step".into()]),
        ProceduralStrategy::new(
            "clarify_ambiguous_task",
            "Inspect the current state before acting when the request leaves details open",
            0.6,
        )
        .with_conditions(vec!["ambiguous".into()]),
        ProceduralStrategy::new(
            "multi_path_reasoning",
            "Consider more than one approach and pick the one with the fewest risky edits",
            0.5,
        )
        .with_conditions(vec!["design".into()]),
        ProceduralStrategy::new(
            "verify_before_modify",
            "Read the target first, then change it, then read it again to confirm",
            0.65,
        )
        .with_steps(vec!["read".into(), "modify".into(), "verify".into()])
        .with_conditions(vec!["modify".into(), "edit".into()]),
        ProceduralStrategy::new(
            "error_recovery",
            "After a failed call, read the error, fix the arguments and retry once",
            0.7,
        )
        .with_conditions(vec!["error".into(), "failure".into()]),
    ]
}
