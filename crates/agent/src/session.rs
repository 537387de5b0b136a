//! Session registry.
//!
//! Each session owns one [`AgentLoopEngine`] and with it one history. The
//! collaborators every engine needs (provider, dispatch router, memory,
//! event bus) are shared; histories never are.

use crate::loop_runner::{AgentLoopEngine, RunOutcome, RunRequest};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use toolweave_config::AgentConfig;
use toolweave_core::error::{Error, Result};
use toolweave_core::event::EventBus;
use toolweave_core::message::SessionId;
use toolweave_core::provider::Provider;
use toolweave_core::LoopState;
use toolweave_memory::{MemoryStore, ReflectionEngine};
use toolweave_telemetry::PricingTable;
use toolweave_tools::ToolDispatchRouter;
use tracing::{debug, info};

/// Maximum number of live sessions before the oldest is evicted.
const MAX_SESSIONS: usize = 1_000;

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SharedServices {
    pub provider: Arc<dyn Provider>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub router: Arc<ToolDispatchRouter>,
    pub events: EventBus,
    pub memory: Option<Arc<MemoryStore>>,
    pub reflection: Option<Arc<ReflectionEngine>>,
    pub pricing: Arc<PricingTable>,
    pub agent: AgentConfig,
}

impl SharedServices {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, router: Arc<ToolDispatchRouter>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            router,
            events: EventBus::default(),
            memory: None,
            reflection: None,
            pricing: Arc::new(PricingTable::with_defaults()),
            agent: AgentConfig::default(),
        }
    }

    fn engine(&self, id: SessionId) -> AgentLoopEngine {
        let mut engine = AgentLoopEngine::new(
            id,
            self.provider.clone(),
            self.model.clone(),
            self.router.clone(),
            self.agent.clone(),
        )
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens)
        .with_events(self.events.clone())
        .with_pricing(self.pricing.clone());
        if let Some(memory) = &self.memory {
            engine = engine.with_memory(memory.clone());
        }
        if let Some(reflection) = &self.reflection {
            engine = engine.with_reflection(reflection.clone());
        }
        engine
    }
}

/// One live session.
pub struct SessionHandle {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    engine: tokio::sync::Mutex<AgentLoopEngine>,
    cancel: Mutex<CancellationToken>,
}

impl SessionHandle {
    /// Cancel the current run, if any.
    pub fn cancel(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Install a fresh token for the next run.
    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    /// Lock the engine, waiting for a running request to finish.
    pub async fn engine(&self) -> tokio::sync::MutexGuard<'_, AgentLoopEngine> {
        self.engine.lock().await
    }

    /// State and size without waiting on a running request.
    pub fn info(&self) -> SessionInfo {
        let (state, messages) = match self.engine.try_lock() {
            Ok(engine) => (Some(engine.state()), engine.history().len()),
            Err(_) => (None, 0),
        };
        SessionInfo {
            id: self.id.to_string(),
            created_at: self.created_at,
            busy: state.is_none(),
            state,
            messages,
        }
    }
}

/// Listing entry for a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// `None` while a run holds the engine
    pub state: Option<LoopState>,
    pub messages: usize,
    pub busy: bool,
}

/// Maps session ids to their engines.
pub struct SessionRegistry {
    services: SharedServices,
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new(services: SharedServices) -> Self {
        Self {
            services,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &SharedServices {
        &self.services
    }

    /// Create a session with a fresh id.
    pub async fn create(&self) -> SessionId {
        self.create_with_id(SessionId::new()).await
    }

    /// Create (or replace) the session `id`.
    pub async fn create_with_id(&self, id: SessionId) -> SessionId {
        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            created_at: Utc::now(),
            engine: tokio::sync::Mutex::new(self.services.engine(id.clone())),
            cancel: Mutex::new(CancellationToken::new()),
        });

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= MAX_SESSIONS && !sessions.contains_key(&id) {
            let oldest = sessions
                .values()
                .min_by_key(|h| h.created_at)
                .map(|h| h.id.clone());
            if let Some(oldest) = oldest {
                if let Some(evicted) = sessions.remove(&oldest) {
                    evicted.cancel();
                    debug!(session = %oldest, "Evicted oldest session");
                }
            }
        }
        if let Some(replaced) = sessions.insert(id.clone(), handle) {
            replaced.cancel();
        }
        info!(session = %id, "Session created");
        id
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove a session, cancelling its current run.
    pub async fn remove(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(handle) => {
                handle.cancel();
                info!(session = %id, "Session removed");
                true
            }
            None => false,
        }
    }

    /// Sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|h| h.info()).collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    /// Run a request on a session. Runs on one session are serialized.
    pub async fn run(&self, id: &SessionId, request: impl Into<RunRequest>) -> Result<RunOutcome> {
        let handle = self
            .get(id)
            .await
            .ok_or_else(|| Error::Internal(format!("unknown session '{id}'")))?;
        let mut engine = handle.engine().await;
        let token = handle.arm();
        engine.run(request, token).await
    }

    /// Cancel the session's current run. False when the session is unknown.
    pub async fn cancel(&self, id: &SessionId) -> bool {
        match self.get(id).await {
            Some(handle) => {
                handle.cancel();
                info!(session = %id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{router, text_turn, tool_turn, EchoTool, Script, ScriptedProvider};
    use std::time::Duration;
    use toolweave_core::message::Role;
    use toolweave_core::tool::Tool;

    fn registry(provider: Arc<ScriptedProvider>, tools: Vec<Arc<dyn Tool>>) -> SessionRegistry {
        SessionRegistry::new(SharedServices::new(provider, "mock-model", router(tools)))
    }

    #[tokio::test]
    async fn sessions_keep_separate_histories() {
        let provider = ScriptedProvider::new(vec![
            Script::Deltas(text_turn("first answer")),
            Script::Deltas(text_turn("second answer")),
        ]);
        let reg = registry(provider, vec![]);
        let a = reg.create().await;
        let b = reg.create().await;
        assert_ne!(a, b);

        reg.run(&a, "question a").await.unwrap();
        reg.run(&b, "question b").await.unwrap();

        let handle = reg.get(&a).await.unwrap();
        let engine = handle.engine().await;
        let users: Vec<&str> = engine
            .history()
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(users, vec!["question a"]);
        assert_eq!(engine.history().last().unwrap().content, "first answer");
    }

    #[tokio::test]
    async fn list_and_remove() {
        let reg = registry(ScriptedProvider::new(vec![]), vec![]);
        let a = reg.create_with_id(SessionId::from("a")).await;
        reg.create_with_id(SessionId::from("b")).await;

        let listed = reg.list().await;
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|i| i.state == Some(LoopState::Idle) && !i.busy));

        assert!(reg.remove(&a).await);
        assert!(!reg.remove(&a).await);
        assert_eq!(reg.len().await, 1);
        assert!(reg.get(&a).await.is_none());
    }

    #[tokio::test]
    async fn unknown_sessions() {
        let reg = registry(ScriptedProvider::new(vec![]), vec![]);
        let ghost = SessionId::from("ghost");
        assert!(reg.run(&ghost, "hi").await.is_err());
        assert!(!reg.cancel(&ghost).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_a_running_session() {
        let slow = EchoTool::slow("slow", Duration::from_secs(30));
        let provider = ScriptedProvider::new(vec![Script::Deltas(tool_turn(&[("a", "slow", "{}")]))]);
        let reg = Arc::new(registry(provider.clone(), vec![slow as Arc<dyn Tool>]));
        let id = reg.create().await;

        let running = {
            let reg = reg.clone();
            let id = id.clone();
            tokio::spawn(async move { reg.run(&id, "slow work").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reg.cancel(&id).await);

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome.state, LoopState::Stopped);
        assert_eq!(provider.calls(), 1);

        // The next run gets a fresh token.
        let outcome = reg.run(&id, "again").await.unwrap();
        assert_eq!(outcome.state, LoopState::Done);
    }
}
