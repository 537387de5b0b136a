//! Agent loop states.

use serde::{Deserialize, Serialize};

/// State of one agent-loop run.
///
/// `Idle → Planning → Dispatching → Observing → (Planning | Finalizing) → Done`,
/// with `Stopped` and `Error` reachable from every active state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    Idle,
    Planning,
    Dispatching,
    Observing,
    Finalizing,
    Done,
    Stopped,
    Error,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Done | LoopState::Stopped | LoopState::Error)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != LoopState::Idle
    }

    /// Whether the machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        if self.is_active() && matches!(next, Stopped | Error) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Planning)
                | (Planning, Dispatching)
                | (Planning, Finalizing)
                | (Dispatching, Observing)
                | (Observing, Planning)
                | (Observing, Finalizing)
                | (Finalizing, Done)
        ) || (self.is_terminal() && next == Idle)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Planning => "planning",
            LoopState::Dispatching => "dispatching",
            LoopState::Observing => "observing",
            LoopState::Finalizing => "finalizing",
            LoopState::Done => "done",
            LoopState::Stopped => "stopped",
            LoopState::Error => "error",
        }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
