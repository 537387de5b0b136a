//! The agent loop engine.
//!
//! One engine drives one session through **Plan → Act → Observe** cycles:
//!
//! 1. **Compact** the history until it fits the token budget
//! 2. **Stream** a provider call, forwarding text and thinking deltas
//! 3. **Deduplicate** the requested tool calls within the turn
//! 4. **Dispatch** the survivors through the [`ToolDispatchRouter`]
//! 5. **Append** results as `tool` messages in the order the calls were issued
//! 6. Loop until the model answers without tool calls
//!
//! The cancel token is polled before every provider call and right after
//! every dispatch. A cancelled dispatch is left to finish on its own; its
//! result is never appended.

use crate::calls::{normalize_tool_calls, DedupPlan};
use crate::context::{estimate_tools_tokens, BudgetSettings, CompactionReport, TokenBudgetManager};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use toolweave_config::AgentConfig;
use toolweave_core::error::{Error, ProviderError, Result};
use toolweave_core::event::{EngineEvent, EventBus};
use toolweave_core::memory::ActionRecord;
use toolweave_core::message::{ImageRef, Message, SessionId};
use toolweave_core::provider::{Provider, ProviderRequest, ProviderResponse, StreamAccumulator, StreamDelta, ToolDefinition};
use toolweave_core::round::{preamble_len, sanitize};
use toolweave_core::tool::ToolCall;
use toolweave_core::LoopState;
use toolweave_memory::{MemoryStore, ReflectionEngine, TaskOutcome};
use toolweave_telemetry::{PricingTable, UsageLedger, UsageTotals};
use toolweave_tools::{Dispatched, ToolDispatchRouter};
use tracing::{debug, info, warn};

/// Content of the placeholder answering a call whose result was discarded.
pub const CANCELLED_TOOL_OUTPUT: &str =
    "Cancelled: the task was stopped while this call was running, so its result was discarded.";

/// What the user asked for in one run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub text: String,
    pub images: Vec<ImageRef>,
}

impl RunRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<ImageRef>) -> Self {
        self.images = images;
        self
    }
}

impl From<&str> for RunRequest {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for RunRequest {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// How a run ended.
#[derive(Debug)]
pub struct RunOutcome {
    /// The assistant-facing answer; on failure, a plain-language explanation.
    pub final_message: Message,
    pub state: LoopState,
    /// Provider calls that completed planning steps
    pub iterations: usize,
    pub usage: UsageTotals,
    /// Tool calls requested by the model, duplicates included
    pub tool_calls: usize,
    /// The terminal error when `state` is `Error` (or `Cancelled` when stopped)
    pub error: Option<Error>,
}

impl RunOutcome {
    pub fn text(&self) -> &str {
        &self.final_message.content
    }
}

/// Per-run bookkeeping fed to reflection.
#[derive(Debug, Default)]
struct RunTracker {
    iterations: usize,
    tool_calls: usize,
    actions: Vec<ActionRecord>,
    error_count: u32,
    retry_count: u32,
    partial_text: String,
}

impl RunTracker {
    fn observe(&mut self, name: &str, dispatched: &Dispatched) {
        self.actions.push(ActionRecord {
            tool: name.to_string(),
            success: dispatched.result.success,
        });
        if !dispatched.result.success {
            self.error_count += 1;
        }
        self.retry_count += dispatched.retries();
    }
}

enum Exit {
    Finished(Message),
    Cancelled,
    Failed(Error),
}

enum Turn {
    Complete(ProviderResponse),
    Cancelled,
}

/// Drives a single session's conversation.
pub struct AgentLoopEngine {
    session_id: SessionId,
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    router: Arc<ToolDispatchRouter>,
    events: EventBus,
    memory: Option<Arc<MemoryStore>>,
    reflection: Option<Arc<ReflectionEngine>>,
    config: AgentConfig,
    budget: TokenBudgetManager,
    history: Vec<Message>,
    state: LoopState,
    ledger: UsageLedger,
}

impl AgentLoopEngine {
    pub fn new(
        session_id: SessionId,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        router: Arc<ToolDispatchRouter>,
        config: AgentConfig,
    ) -> Self {
        Self {
            session_id,
            provider,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            router,
            events: EventBus::default(),
            memory: None,
            reflection: None,
            budget: TokenBudgetManager::new(BudgetSettings::from(&config)),
            config,
            history: Vec::new(),
            state: LoopState::Idle,
            ledger: UsageLedger::new(Arc::new(PricingTable::with_defaults())),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Publish events on a shared bus instead of a private one.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Recall past experience from `memory` before each run.
    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Score and reflect on every finished run.
    pub fn with_reflection(mut self, reflection: Arc<ReflectionEngine>) -> Self {
        self.reflection = Some(reflection);
        self
    }

    pub fn with_pricing(mut self, pricing: Arc<PricingTable>) -> Self {
        self.ledger = UsageLedger::new(pricing);
        self
    }

    /// Start from an existing conversation.
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn budget(&self) -> &TokenBudgetManager {
        &self.budget
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ── Run ────────────────────────────────────────────────────────────────

    /// Run one user request to completion, cancellation or failure.
    ///
    /// Only a blank request is an `Err`; provider failures and the iteration
    /// limit end in `LoopState::Error` with the cause in [`RunOutcome::error`].
    pub async fn run(&mut self, request: impl Into<RunRequest>, cancel: CancellationToken) -> Result<RunOutcome> {
        let request = request.into();
        if request.text.trim().is_empty() && request.images.is_empty() {
            return Err(Error::Internal("empty request".into()));
        }
        if self.state.is_terminal() {
            self.transition(LoopState::Idle);
        }

        info!(
            session = %self.session_id,
            messages = self.history.len(),
            "Starting run"
        );
        let ledger_start = self.ledger.len();
        self.budget.reset_limit();

        let fixes = sanitize(&mut self.history);
        if fixes > 0 {
            warn!(session = %self.session_id, fixes, "Repaired inconsistent history");
        }
        self.prepare_preamble(&request.text).await;
        self.history
            .push(Message::user(&request.text).with_images(request.images));

        self.transition(LoopState::Planning);
        let mut tracker = RunTracker::default();
        let exit = self.drive(&cancel, &mut tracker).await;

        let (final_message, error) = match exit {
            Exit::Finished(message) => {
                self.transition(LoopState::Done);
                (message, None)
            }
            Exit::Cancelled => {
                info!(session = %self.session_id, "Run cancelled");
                self.transition(LoopState::Stopped);
                let message = Message::assistant(cancellation_text(&tracker.partial_text));
                self.history.push(message.clone());
                (message, Some(Error::Cancelled))
            }
            Exit::Failed(err) => {
                warn!(session = %self.session_id, error = %err, "Run failed");
                self.transition(LoopState::Error);
                let message = Message::assistant(err.user_message());
                self.history.push(message.clone());
                (message, Some(err))
            }
        };

        if matches!(self.state, LoopState::Done | LoopState::Error) {
            self.reflect(&request.text, &final_message.content, &tracker).await;
        }

        Ok(RunOutcome {
            final_message,
            state: self.state,
            iterations: tracker.iterations,
            usage: self.ledger.totals_since(ledger_start),
            tool_calls: tracker.tool_calls,
            error,
        })
    }

    async fn drive(&mut self, cancel: &CancellationToken, tracker: &mut RunTracker) -> Exit {
        let tools = self.router.registry().definitions();
        let reserved = estimate_tools_tokens(&tools);
        let mut context_retries = 0;

        loop {
            if tracker.iterations >= self.config.max_iterations {
                warn!(
                    session = %self.session_id,
                    limit = self.config.max_iterations,
                    "Iteration limit reached"
                );
                return Exit::Failed(Error::IterationLimitExceeded {
                    limit: self.config.max_iterations,
                });
            }

            let report = self.budget.fit(&mut self.history, reserved);
            self.publish_compaction(&report);

            if cancel.is_cancelled() {
                return Exit::Cancelled;
            }

            let iteration = tracker.iterations + 1;
            let response = match self.stream_turn(iteration, &tools, cancel, tracker).await {
                Ok(Turn::Complete(response)) => response,
                Ok(Turn::Cancelled) => return Exit::Cancelled,
                Err(ProviderError::ContextLengthExceeded(reason))
                    if context_retries < self.config.max_context_retries =>
                {
                    context_retries += 1;
                    warn!(
                        session = %self.session_id,
                        attempt = context_retries,
                        reason = %reason,
                        "Provider rejected context length, forcing compaction"
                    );
                    let report = self.budget.force_escalate(&mut self.history, reserved);
                    self.publish_compaction(&report);
                    continue;
                }
                Err(err) => return Exit::Failed(err.into()),
            };
            tracker.iterations = iteration;

            let mut message = response.message;
            tracker.partial_text = message.content.clone();
            let (message_calls, calls) = normalize_tool_calls(std::mem::take(&mut message.tool_calls), iteration);

            if calls.is_empty() {
                self.transition(LoopState::Finalizing);
                self.history.push(message.clone());
                return Exit::Finished(message);
            }

            message.tool_calls = message_calls;
            self.history.push(message);
            tracker.tool_calls += calls.len();

            self.transition(LoopState::Dispatching);
            let Some(dispatched) = self.dispatch(&calls, cancel).await else {
                self.answer_cancelled(&calls);
                return Exit::Cancelled;
            };
            let dispatched = match dispatched {
                Ok(d) => d,
                Err(err) => return Exit::Failed(err),
            };
            if cancel.is_cancelled() {
                self.answer_cancelled(&calls);
                return Exit::Cancelled;
            }

            self.transition(LoopState::Observing);
            self.observe(&calls, dispatched, tracker);
            self.transition(LoopState::Planning);
        }
    }

    // ── Provider ───────────────────────────────────────────────────────────

    async fn stream_turn(
        &mut self,
        iteration: usize,
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
        tracker: &mut RunTracker,
    ) -> std::result::Result<Turn, ProviderError> {
        let request = ProviderRequest::new(self.model.clone(), self.history.clone())
            .with_tools(tools.to_vec())
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);

        debug!(
            session = %self.session_id,
            iteration,
            messages = request.messages.len(),
            "Calling provider"
        );
        let started = Instant::now();
        let mut rx = self.provider.stream_completion(request).await?;
        let mut acc = StreamAccumulator::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracker.partial_text = acc.text().to_string();
                    return Ok(Turn::Cancelled);
                }
                next = rx.recv() => next,
            };
            let Some(delta) = next else { break };
            let delta = delta?;
            match &delta {
                StreamDelta::Text { text } => self.events.publish(EngineEvent::TokenDelta {
                    session_id: self.session_id.to_string(),
                    text: text.clone(),
                }),
                StreamDelta::Thinking { text } => self.events.publish(EngineEvent::ThinkingDelta {
                    session_id: self.session_id.to_string(),
                    text: text.clone(),
                }),
                _ => {}
            }
            acc.push(&delta);
            if acc.is_done() {
                break;
            }
        }

        let response = acc.finish(self.model.clone());
        let latency_ms = started.elapsed().as_millis() as u64;
        self.ledger.record(
            &self.model,
            iteration,
            response.usage,
            latency_ms,
            !response.message.tool_calls.is_empty(),
        );
        debug!(
            session = %self.session_id,
            iteration,
            input = response.usage.input_tokens,
            output = response.usage.output_tokens,
            tool_calls = response.message.tool_calls.len(),
            latency_ms,
            "Provider call finished"
        );
        Ok(Turn::Complete(response))
    }

    // ── Tools ──────────────────────────────────────────────────────────────

    /// Run the unique calls in a spawned task. `None` when cancelled first.
    async fn dispatch(&self, calls: &[ToolCall], cancel: &CancellationToken) -> Option<Result<(DedupPlan, Vec<Dispatched>)>> {
        let plan = DedupPlan::build(calls);
        if plan.duplicates() > 0 {
            debug!(
                session = %self.session_id,
                duplicates = plan.duplicates(),
                "Deduplicated tool calls"
            );
        }
        for call in &plan.unique {
            self.events.publish(EngineEvent::ToolStart {
                session_id: self.session_id.to_string(),
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }

        let router = self.router.clone();
        let unique = plan.unique.clone();
        let handle = tokio::spawn(async move { router.execute_all(&unique).await });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            joined = handle => Some(
                joined
                    .map(|dispatched| (plan, dispatched))
                    .map_err(|e| Error::Internal(format!("tool dispatch task failed: {e}"))),
            ),
        }
    }

    /// Append results in issue order; duplicates get a copy of the first result.
    fn observe(&mut self, calls: &[ToolCall], (plan, dispatched): (DedupPlan, Vec<Dispatched>), tracker: &mut RunTracker) {
        for (slot, call) in plan.unique.iter().enumerate() {
            tracker.observe(&call.name, &dispatched[slot]);
        }

        for (i, call) in calls.iter().enumerate() {
            let d = &dispatched[plan.slots[i]];
            let deduplicated = plan.is_duplicate(i);
            self.events.publish(EngineEvent::ToolEnd {
                session_id: self.session_id.to_string(),
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                success: d.result.success,
                deduplicated,
                duration_ms: if deduplicated { 0 } else { d.elapsed.as_millis() as u64 },
            });

            let mut content = d.result.output.clone();
            if let Some(effects) = &d.result.side_effects {
                content.push_str(&format!("\n[side effects] {effects}"));
            }
            let mut message = Message::tool_result(&call.id, content);
            message.metadata.insert("tool_name".into(), call.name.clone().into());
            message.metadata.insert("success".into(), d.result.success.into());
            if deduplicated {
                message.metadata.insert("deduplicated".into(), true.into());
            }
            self.history.push(message);
        }
    }

    /// Keep the history valid after a cancelled dispatch.
    fn answer_cancelled(&mut self, calls: &[ToolCall]) {
        for call in calls {
            let mut message = Message::tool_result(&call.id, CANCELLED_TOOL_OUTPUT);
            message.metadata.insert("cancelled".into(), true.into());
            self.history.push(message);
        }
    }

    // ── Context ────────────────────────────────────────────────────────────

    /// Rebuild the system preamble: configured prompt plus recalled experience.
    async fn prepare_preamble(&mut self, task: &str) {
        let mut prompt = self.config.system_prompt.clone();
        if let Some(section) = self.recall_section(task).await {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(&section);
        }

        let preamble = preamble_len(&self.history);
        self.history.drain(..preamble);
        if !prompt.is_empty() {
            self.history.insert(0, Message::system(prompt));
        }
    }

    async fn recall_section(&self, task: &str) -> Option<String> {
        let memory = self.memory.as_ref()?;
        if self.config.recall_k == 0 {
            return None;
        }
        let recalled = memory.search_text(task, self.config.recall_k).await;
        let rules: Vec<String> = recalled
            .rules
            .iter()
            .filter(|s| s.score > 0.0)
            .map(|s| format!("- {} (confidence {:.2})", s.item.rule, s.item.confidence))
            .collect();
        let strategies: Vec<String> = recalled
            .strategies
            .iter()
            .filter(|s| s.score > 0.0)
            .map(|s| {
                let steps = if s.item.steps.is_empty() {
                    String::new()
                } else {
                    format!(" [steps: {}]", s.item.steps.join(" -> "))
                };
                format!("- {}: {}{steps}", s.item.name, s.item.description)
            })
            .collect();
        let episodes: Vec<String> = recalled
            .episodes
            .iter()
            .filter(|s| s.score > 0.0)
            .map(|s| format!("- {}: {}", s.item.task, s.item.result_summary))
            .collect();

        if rules.is_empty() && strategies.is_empty() && episodes.is_empty() {
            return None;
        }
        debug!(
            session = %self.session_id,
            rules = rules.len(),
            strategies = strategies.len(),
            episodes = episodes.len(),
            "Recalled experience"
        );

        let mut section = String::from("## Recalled Experience\n");
        for (title, lines) in [("Rules", rules), ("Strategies", strategies), ("Past tasks", episodes)] {
            if !lines.is_empty() {
                section.push_str(&format!("\n### {title}\n{}\n", lines.join("\n")));
            }
        }
        Some(section)
    }

    fn publish_compaction(&self, report: &CompactionReport) {
        for step in &report.steps {
            info!(
                session = %self.session_id,
                level = step.level,
                tokens_before = step.tokens_before,
                tokens_after = step.tokens_after,
                "Compacted context"
            );
            self.events.publish(EngineEvent::BudgetCompacted {
                session_id: self.session_id.to_string(),
                level: step.level,
                tokens_before: step.tokens_before,
                tokens_after: step.tokens_after,
            });
        }
        if let Some(err) = report.exceeded() {
            warn!(session = %self.session_id, error = %err, "Sending context over budget");
        }
    }

    // ── State & reflection ─────────────────────────────────────────────────

    fn transition(&mut self, next: LoopState) {
        let from = self.state;
        debug_assert!(from.can_transition_to(next), "illegal transition {from} -> {next}");
        debug!(session = %self.session_id, %from, to = %next, "State transition");
        self.state = next;
        self.events.publish(EngineEvent::StateChange {
            session_id: self.session_id.to_string(),
            from,
            to: next,
            timestamp: Utc::now(),
        });
    }

    async fn reflect(&self, task: &str, final_text: &str, tracker: &RunTracker) {
        let Some(reflection) = &self.reflection else {
            return;
        };
        let outcome = TaskOutcome {
            session_id: self.session_id.to_string(),
            task: task.to_string(),
            actions: tracker.actions.clone(),
            error_count: tracker.error_count,
            retry_count: tracker.retry_count,
            success: self.state == LoopState::Done,
            final_text: final_text.to_string(),
        };

        match reflection.after_task(&outcome).await {
            Ok(report) => {
                debug!(
                    session = %self.session_id,
                    episode = %report.episode_id,
                    reward = report.reward.reward,
                    rules = report.rules.len(),
                    promoted = report.promoted.len(),
                    "Reflected on task"
                );
                if report.deep_pass_due {
                    let reflection = reflection.clone();
                    tokio::spawn(async move {
                        match reflection.deep_pass().await {
                            Ok(deep) => info!(
                                episodes = deep.episodes_reviewed,
                                rules = deep.rules.len(),
                                strategies = deep.strategies_updated.len(),
                                "Deep reflection pass finished"
                            ),
                            Err(e) => warn!(error = %e, "Deep reflection pass failed"),
                        }
                    });
                }
            }
            Err(e) => warn!(session = %self.session_id, error = %e, "Reflection failed"),
        }
    }
}

/// Partial text of the interrupted turn plus a plain-language note.
fn cancellation_text(partial: &str) -> String {
    let note = Error::Cancelled.user_message();
    let partial = partial.trim();
    if partial.is_empty() {
        note
    } else {
        format!("{partial}\n\n{note}")
    }
}

/// A compact view of a history for logs and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct HistorySummary {
    pub messages: usize,
    pub rounds: usize,
    pub collapsed_tool_messages: usize,
}

impl HistorySummary {
    pub fn of(history: &[Message]) -> Self {
        Self {
            messages: history.len(),
            rounds: toolweave_core::round::split_rounds(history).len(),
            collapsed_tool_messages: history.iter().filter(|m| m.is_collapsed()).count(),
        }
    }
}
