//! Test doubles shared by the engine and session tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use toolweave_core::error::{ProviderError, ToolError};
use toolweave_core::provider::{DeltaStream, Provider, ProviderRequest, StreamDelta, ToolCallDelta, Usage};
use toolweave_core::tool::{Affinity, Tool, ToolOutput, ToolRegistry};
use toolweave_tools::{DispatchSettings, ToolDispatchRouter};

pub enum Script {
    Deltas(Vec<StreamDelta>),
    Fail(ProviderError),
}

/// Plays back queued turns and records every request.
/// Once the queue is empty it answers with plain text.
#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Script>>,
    pub requests: Mutex<Vec<ProviderRequest>>,
    repeat_tool_call: Option<(String, String)>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            ..Default::default()
        })
    }

    /// Always asks for the same tool call.
    pub fn looping(name: &str, arguments: &str) -> Arc<Self> {
        Arc::new(Self {
            repeat_tool_call: Some((name.into(), arguments.into())),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_completion(&self, request: ProviderRequest) -> Result<DeltaStream, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let next = self.turns.lock().unwrap().pop_front();
        let deltas = match (next, &self.repeat_tool_call) {
            (Some(Script::Fail(err)), _) => return Err(err),
            (Some(Script::Deltas(deltas)), _) => deltas,
            (None, Some((name, args))) => tool_turn(&[("", name.as_str(), args.as_str())]),
            (None, None) => text_turn("done"),
        };
        let (tx, rx) = mpsc::channel(64);
        for delta in deltas {
            tx.try_send(Ok(delta)).unwrap();
        }
        Ok(rx)
    }
}

pub fn text_turn(text: &str) -> Vec<StreamDelta> {
    vec![
        StreamDelta::Text { text: text.into() },
        StreamDelta::Usage(Usage {
            input_tokens: 100,
            output_tokens: 10,
            ..Default::default()
        }),
        StreamDelta::Done {
            finish_reason: Some("stop".into()),
        },
    ]
}

/// One turn requesting `(id, name, arguments)` calls; an empty id is omitted.
pub fn tool_turn(calls: &[(&str, &str, &str)]) -> Vec<StreamDelta> {
    let mut deltas: Vec<StreamDelta> = calls
        .iter()
        .enumerate()
        .map(|(index, (id, name, args))| {
            StreamDelta::ToolCall(ToolCallDelta {
                index,
                id: (!id.is_empty()).then(|| id.to_string()),
                name: Some(name.to_string()),
                arguments: args.to_string(),
            })
        })
        .collect();
    deltas.push(StreamDelta::Done {
        finish_reason: Some("tool_calls".into()),
    });
    deltas
}

/// Echoes its arguments after `delay`, counting executions.
pub struct EchoTool {
    pub name: &'static str,
    pub affinity: Affinity,
    pub delay: Duration,
    pub runs: AtomicUsize,
}

impl EchoTool {
    pub fn new(name: &'static str) -> Arc<Self> {
        Self::slow(name, Duration::ZERO)
    }

    pub fn slow(name: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            affinity: Affinity::Concurrent,
            delay,
            runs: AtomicUsize::new(0),
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "echoes its arguments"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }
    fn affinity(&self) -> Affinity {
        self.affinity
    }
    async fn execute(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(ToolOutput::text(format!("{}: {arguments}", self.name)))
    }
}

pub fn router(tools: Vec<Arc<dyn Tool>>) -> Arc<ToolDispatchRouter> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    Arc::new(ToolDispatchRouter::new(registry, DispatchSettings::default()))
}
