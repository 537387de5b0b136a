//! End-to-end integration tests for the toolweave engine.
//!
//! These tests drive whole requests through the agent loop with a scripted
//! streaming provider: context compaction, cancellation while a tool is in
//! flight, transient-failure retries, per-turn dedup and exclusive tools.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use toolweave_agent::{AgentLoopEngine, SessionRegistry, SharedServices, CANCELLED_TOOL_OUTPUT};
use toolweave_config::{AgentConfig, DispatchConfig};
use toolweave_core::error::{ProviderError, ToolError};
use toolweave_core::event::EngineEvent;
use toolweave_core::message::{ImageRef, Message, MessageToolCall, Role, SessionId};
use toolweave_core::provider::{DeltaStream, Provider, ProviderRequest, StreamDelta, ToolCallDelta, Usage};
use toolweave_core::tool::{Tool, ToolOutput, ToolRegistry};
use toolweave_core::LoopState;
use toolweave_tools::{default_registry, DispatchSettings, ToolDispatchRouter, Workspace};

// ── Mock Provider ────────────────────────────────────────────────────────

/// Streams scripted turns in sequence and records every request.
struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<StreamDelta>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(turns: Vec<Vec<StreamDelta>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, n: usize) -> ProviderRequest {
        self.requests.lock().unwrap()[n].clone()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn stream_completion(&self, request: ProviderRequest) -> Result<DeltaStream, ProviderError> {
        let count = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };
        let deltas = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("ScriptedProvider exhausted at call #{count}"));
        let (tx, rx) = mpsc::channel(deltas.len().max(1));
        for delta in deltas {
            tx.try_send(Ok(delta)).unwrap();
        }
        Ok(rx)
    }
}

fn usage() -> StreamDelta {
    StreamDelta::Usage(Usage {
        input_tokens: 200,
        output_tokens: 20,
        ..Default::default()
    })
}

fn text_turn(text: &str) -> Vec<StreamDelta> {
    vec![
        StreamDelta::Text { text: text.into() },
        usage(),
        StreamDelta::Done {
            finish_reason: Some("stop".into()),
        },
    ]
}

/// A turn with optional lead-in text and `(id, name, arguments)` calls.
fn tool_turn(text: &str, calls: &[(&str, &str, Value)]) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();
    if !text.is_empty() {
        deltas.push(StreamDelta::Text { text: text.into() });
    }
    for (index, (id, name, args)) in calls.iter().enumerate() {
        deltas.push(StreamDelta::ToolCall(ToolCallDelta {
            index,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            arguments: args.to_string(),
        }));
    }
    deltas.push(usage());
    deltas.push(StreamDelta::Done {
        finish_reason: Some("tool_calls".into()),
    });
    deltas
}

// ── Mock Tools ───────────────────────────────────────────────────────────

/// Sleeps for `ms` (argument), then echoes its arguments.
struct FetchTool {
    runs: AtomicUsize,
}

#[async_trait::async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }
    fn description(&self) -> &str {
        "fetches a resource after a delay"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"ms": {"type": "integer"}, "tag": {"type": "string"}},
            "required": ["ms"]
        })
    }
    async fn execute(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let ms = arguments["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ToolOutput::text(format!("run {run}: {}", arguments["tag"])))
    }
}

/// Always fails with a network error, recording when each attempt started.
struct UnreachableTool {
    attempts: Mutex<Vec<tokio::time::Instant>>,
}

#[async_trait::async_trait]
impl Tool for UnreachableTool {
    fn name(&self) -> &str {
        "remote_render"
    }
    fn description(&self) -> &str {
        "renders on a remote host"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _arguments: Value) -> Result<ToolOutput, ToolError> {
        self.attempts.lock().unwrap().push(tokio::time::Instant::now());
        Err(ToolError::Network {
            tool_name: "remote_render".into(),
            reason: "connection refused".into(),
        })
    }
}

fn router_with(tools: Vec<Arc<dyn Tool>>) -> Arc<ToolDispatchRouter> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    Arc::new(ToolDispatchRouter::new(
        registry,
        DispatchSettings::from(&DispatchConfig::default()),
    ))
}

fn agent_config(limit: usize) -> AgentConfig {
    AgentConfig {
        context_limit_tokens: limit,
        system_prompt: "You are a test agent.".into(),
        ..Default::default()
    }
}

fn drain(rx: &mut broadcast::Receiver<Arc<EngineEvent>>) -> Vec<Arc<EngineEvent>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn compaction_levels(events: &[Arc<EngineEvent>]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e.as_ref() {
            EngineEvent::BudgetCompacted { level, .. } => Some(*level),
            _ => None,
        })
        .collect()
}

fn tools_in(messages: &[Message]) -> Vec<&Message> {
    messages.iter().filter(|m| m.role == Role::Tool).collect()
}

// ── Scenario A: compaction order ─────────────────────────────────────────

/// Six finished rounds, each with ~1000 tokens of tool output.
fn six_round_history() -> Vec<Message> {
    let mut history = Vec::new();
    for n in 1..=6 {
        let id = format!("old{n}");
        history.push(Message::user(format!("old question {n}")));
        history.push(Message::assistant_with_tools(
            "",
            vec![MessageToolCall {
                id: id.clone(),
                name: "fetch".into(),
                arguments: "{}".into(),
            }],
        ));
        history.push(Message::tool_result(&id, "x".repeat(3800)));
        history.push(Message::assistant(format!("old answer {n}")));
    }
    history
}

async fn run_with_history(limit: usize, history: Vec<Message>) -> (Arc<ScriptedProvider>, Vec<Arc<EngineEvent>>, LoopState) {
    let provider = ScriptedProvider::new(vec![text_turn("ok")]);
    let mut agent = AgentLoopEngine::new(
        SessionId::from("scenario-a"),
        provider.clone(),
        "mock-model",
        router_with(vec![]),
        agent_config(limit),
    )
    .with_history(history);
    let mut rx = agent.events().subscribe();

    let outcome = agent.run("new question", CancellationToken::new()).await.unwrap();
    (provider, drain(&mut rx), outcome.state)
}

#[tokio::test]
async fn e2e_compaction_collapses_oldest_round_first() {
    // ~6200 tokens against a 5800 limit: one collapsed round is enough.
    let (provider, events, state) = run_with_history(5800, six_round_history()).await;

    assert_eq!(state, LoopState::Done);
    assert_eq!(compaction_levels(&events), vec![1]);
    let sent = provider.request(0).messages;
    let collapsed: Vec<bool> = tools_in(&sent).iter().map(|m| m.is_collapsed()).collect();
    assert_eq!(collapsed, vec![true, false, false, false, false, false]);
}

#[tokio::test]
async fn e2e_compaction_walks_forward_round_by_round() {
    let (provider, events, _) = run_with_history(2600, six_round_history()).await;

    assert_eq!(compaction_levels(&events), vec![1]);
    let sent = provider.request(0).messages;
    let collapsed: Vec<bool> = tools_in(&sent).iter().map(|m| m.is_collapsed()).collect();
    assert_eq!(collapsed, vec![true, true, true, true, false, false]);
    assert!(tools_in(&sent)[0].content.starts_with("[collapsed]"));
    assert_eq!(tools_in(&sent)[5].content.len(), 3800);
}

#[tokio::test]
async fn e2e_compaction_escalates_through_all_levels() {
    let mut history = six_round_history();
    // Round 2's question carries a screenshot.
    history[4] = Message::user("old question 2").with_images(vec![ImageRef::new("image/png", "aGVsbG8=")]);

    let (provider, events, state) = run_with_history(500, history).await;

    // Nothing fits 500 tokens; the most compacted context is still sent.
    assert_eq!(state, LoopState::Done);
    assert_eq!(compaction_levels(&events), vec![1, 2, 3]);

    let sent = provider.request(0).messages;
    assert_eq!(sent[0].role, Role::System);
    let users: Vec<&str> = sent
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(users, vec!["old question 6", "new question"]);
    // The protected round keeps its full tool output.
    let tools = tools_in(&sent);
    assert_eq!(tools.len(), 1);
    assert!(!tools[0].is_collapsed());
}

// ── Scenario B: cancel while a tool is in flight ─────────────────────────

#[tokio::test(start_paused = true)]
async fn e2e_cancel_during_tool_dispatch() {
    let fetch = Arc::new(FetchTool {
        runs: AtomicUsize::new(0),
    });
    let provider = ScriptedProvider::new(vec![
        tool_turn(
            "Fetching the report.",
            &[("c1", "fetch", json!({"ms": 30_000, "tag": "report"}))],
        ),
        text_turn("fresh start"),
    ]);
    let mut agent = AgentLoopEngine::new(
        SessionId::from("scenario-b"),
        provider.clone(),
        "mock-model",
        router_with(vec![fetch.clone() as Arc<dyn Tool>]),
        agent_config(64_000),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let outcome = agent.run("get the report", cancel).await.unwrap();

    assert_eq!(outcome.state, LoopState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(provider.calls(), 1);
    assert!(outcome.text().starts_with("Fetching the report."));
    assert_ne!(outcome.text(), "Fetching the report.");

    // The history stays valid: the pending call got a synthetic answer.
    let tools = tools_in(agent.history());
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(tools[0].content, CANCELLED_TOOL_OUTPUT);

    // The session is usable afterwards.
    let outcome = agent.run("try again", CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.state, LoopState::Done);
    assert_eq!(outcome.text(), "fresh start");
}

#[tokio::test(start_paused = true)]
async fn e2e_registry_cancel_stops_only_that_session() {
    let fetch = Arc::new(FetchTool {
        runs: AtomicUsize::new(0),
    });
    let provider = ScriptedProvider::new(vec![
        tool_turn("", &[("c1", "fetch", json!({"ms": 10_000, "tag": "slow"}))]),
        text_turn("other answer"),
    ]);
    let registry = Arc::new(SessionRegistry::new(SharedServices::new(
        provider.clone(),
        "mock-model",
        router_with(vec![fetch as Arc<dyn Tool>]),
    )));
    let slow = registry.create().await;
    let other = registry.create().await;

    let running = {
        let registry = registry.clone();
        let slow = slow.clone();
        tokio::spawn(async move { registry.run(&slow, "slow task").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.cancel(&slow).await);

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.state, LoopState::Stopped);

    let outcome = registry.run(&other, "quick task").await.unwrap();
    assert_eq!(outcome.state, LoopState::Done);
    assert_eq!(outcome.text(), "other answer");
}

// ── Scenario C: transient failures retried, then reported ────────────────

#[tokio::test(start_paused = true)]
async fn e2e_transient_failures_back_off_then_report() {
    let tool = Arc::new(UnreachableTool {
        attempts: Mutex::new(Vec::new()),
    });
    let provider = ScriptedProvider::new(vec![
        tool_turn("", &[("r1", "remote_render", json!({}))]),
        text_turn("The remote renderer is unreachable."),
    ]);
    let mut agent = AgentLoopEngine::new(
        SessionId::from("scenario-c"),
        provider.clone(),
        "mock-model",
        router_with(vec![tool.clone() as Arc<dyn Tool>]),
        agent_config(64_000),
    );

    let outcome = agent.run("render the scene", CancellationToken::new()).await.unwrap();

    // The failure is content for the model, not a terminal error.
    assert_eq!(outcome.state, LoopState::Done);
    assert_eq!(outcome.text(), "The remote renderer is unreachable.");

    let attempts = tool.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
    );

    let second = provider.request(1).messages;
    let tools = tools_in(&second);
    assert_eq!(tools.len(), 1);
    assert!(tools[0].content.contains("connection refused"));
    assert!(tools[0].content.contains("(after 4 attempts)"));
    assert_eq!(tools[0].metadata.get("success"), Some(&json!(false)));
}

// ── Dedup and ordering ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn e2e_duplicates_run_once_and_results_keep_issue_order() {
    let fetch = Arc::new(FetchTool {
        runs: AtomicUsize::new(0),
    });
    let provider = ScriptedProvider::new(vec![
        tool_turn(
            "",
            &[
                ("slow", "fetch", json!({"ms": 300, "tag": "a"})),
                ("fast", "fetch", json!({"ms": 10, "tag": "b"})),
                ("again", "fetch", json!({"tag": "a", "ms": 300})),
            ],
        ),
        text_turn("both fetched"),
    ]);
    let mut agent = AgentLoopEngine::new(
        SessionId::from("dedup"),
        provider.clone(),
        "mock-model",
        router_with(vec![fetch.clone() as Arc<dyn Tool>]),
        agent_config(64_000),
    );
    let mut rx = agent.events().subscribe();

    let outcome = agent.run("fetch a and b", CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.state, LoopState::Done);
    assert_eq!(outcome.tool_calls, 3);
    assert_eq!(fetch.runs.load(Ordering::SeqCst), 2);

    let tools = tools_in(agent.history());
    let ids: Vec<&str> = tools.iter().filter_map(|m| m.tool_call_id.as_deref()).collect();
    assert_eq!(ids, vec!["slow", "fast", "again"]);
    assert_eq!(tools[0].content, tools[2].content);
    assert_ne!(tools[0].content, tools[1].content);

    let dedup_flags: Vec<(String, bool)> = drain(&mut rx)
        .iter()
        .filter_map(|e| match e.as_ref() {
            EngineEvent::ToolEnd {
                call_id, deduplicated, ..
            } => Some((call_id.clone(), *deduplicated)),
            _ => None,
        })
        .collect();
    assert!(dedup_flags.contains(&("again".to_string(), true)));
    assert!(dedup_flags.contains(&("slow".to_string(), false)));
}

// ── Built-in exclusive tools ─────────────────────────────────────────────

#[tokio::test]
async fn e2e_workspace_writes_apply_in_issue_order() {
    let workspace = Workspace::new();
    let registry = default_registry(&DispatchConfig::default(), workspace.clone(), None).unwrap();
    let router = Arc::new(ToolDispatchRouter::new(registry, DispatchSettings::default()));
    let provider = ScriptedProvider::new(vec![
        tool_turn(
            "",
            &[
                ("w1", "workspace_set", json!({"key": "cube", "value": {"size": 1}})),
                ("w2", "workspace_set", json!({"key": "cube", "value": {"size": 2}})),
            ],
        ),
        tool_turn("", &[("r1", "workspace_get", json!({"key": "cube"}))]),
        text_turn("The cube has size 2."),
    ]);
    let mut agent = AgentLoopEngine::new(
        SessionId::from("workspace"),
        provider.clone(),
        "mock-model",
        router,
        agent_config(64_000),
    );

    let outcome = agent.run("make the cube size 2", CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.state, LoopState::Done);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(workspace.get("cube"), Some(json!({"size": 2})));

    let tools = tools_in(agent.history());
    assert!(tools[0].content.contains("created 'cube'"));
    assert!(tools[1].content.contains("updated 'cube'"));
    assert_eq!(tools[2].content, r#"{"size":2}"#);
    assert_eq!(outcome.usage.calls, 3);
}
