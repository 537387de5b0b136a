//! Error types for the toolweave domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all toolweave operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Loop control ---
    #[error("Run cancelled")]
    Cancelled,

    #[error("Iteration limit of {limit} exceeded without a final answer")]
    IterationLimitExceeded { limit: usize },

    #[error("Token budget exceeded: estimated {estimated} > limit {limit}")]
    BudgetExceeded { estimated: usize, limit: usize },

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// A natural-language explanation suitable for the final assistant message.
    ///
    /// Never includes raw provider payloads or internal error chains.
    pub fn user_message(&self) -> String {
        match self {
            Error::Provider(ProviderError::AuthenticationFailed(_)) => {
                "I couldn't reach the language model because the API key was rejected. \
                 Please check your credentials and try again."
                    .into()
            }
            Error::Provider(ProviderError::RateLimited { retry_after_secs }) => format!(
                "The language model provider is rate limiting requests. \
                 Please wait about {retry_after_secs} seconds and try again."
            ),
            Error::Provider(ProviderError::ContextLengthExceeded(_)) => {
                "The conversation grew too large for the model's context window, \
                 even after compacting older tool output. Please start a new session \
                 or narrow the request."
                    .into()
            }
            Error::Provider(ProviderError::ModelNotFound(model)) => format!(
                "The configured model '{model}' is not available from the provider."
            ),
            Error::Provider(ProviderError::NotConfigured(_)) => {
                "No language model provider is configured.".into()
            }
            Error::Provider(_) => {
                "I lost contact with the language model after several retries, \
                 so I had to stop. Please try again in a moment."
                    .into()
            }
            Error::Cancelled => "The task was stopped at your request.".into(),
            Error::IterationLimitExceeded { limit } => format!(
                "I stopped after {limit} planning steps without reaching a final answer. \
                 The task may be too large for one request; try splitting it into smaller steps."
            ),
            Error::BudgetExceeded { .. } => {
                "The conversation is too large to continue in this session.".into()
            }
            Error::Tool(_) | Error::Memory(_) | Error::Config { .. } => {
                "An internal component failed while working on your request, so I had to stop."
                    .into()
            }
            Error::Serialization(_) | Error::Internal(_) => {
                "Something went wrong on my side while working on your request.".into()
            }
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether the adapter boundary should retry this failure.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::StreamInterrupted(_)
            | ProviderError::Timeout(_)
            | ProviderError::Network(_) => true,
            ProviderError::ApiError { status_code, .. } => {
                *status_code >= 500 || *status_code == 408
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Invalid tool schema for {tool_name}: {reason}")]
    InvalidSchema { tool_name: String, reason: String },

    #[error("Tool already registered: {0}")]
    DuplicateTool(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Network failure in {tool_name}: {reason}")]
    Network { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },
}

impl ToolError {
    /// Network and timeout failures are worth retrying; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Network { .. } | ToolError::Timeout { .. })
    }

    /// Stable label carried in `ToolResult::error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "not_found",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::InvalidSchema { .. } => "invalid_schema",
            ToolError::DuplicateTool(_) => "duplicate_tool",
            ToolError::ExecutionFailed { .. } => "execution_failed",
            ToolError::Network { .. } => "network",
            ToolError::Timeout { .. } => "timeout",
            ToolError::PermissionDenied { .. } => "permission_denied",
        }
    }
}
