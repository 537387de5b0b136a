//! Long-term memory for toolweave.
//!
//! [`MemoryStore`] holds the episodic, semantic and procedural layers behind
//! copy-on-write snapshots. [`RewardEngine`] scores finished tasks and
//! [`ReflectionEngine`] turns repeated experience into rules and strategies.

pub mod embedding;
pub mod in_memory;
pub mod reflection;
pub mod reward;
pub mod store;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use embedding::{EmbeddingService, Embedder, HashEmbedder, ProviderEmbedder};
pub use in_memory::InMemoryBackend;
pub use reflection::{DeepPassReport, ReflectionEngine, ReflectionReport, rule_tags};
pub use reward::{RewardBreakdown, RewardEngine, TaskOutcome};
pub use store::{MemoryStats, MemoryStore, RuleUpsert, Snapshot, StoreLimits};
pub use vector::cosine_similarity;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

use std::sync::Arc;
use toolweave_config::MemoryConfig;
use toolweave_core::error::MemoryError;
use toolweave_core::memory::MemoryBackend;
use toolweave_core::provider::Provider;
use tracing::warn;

/// Build the embedding service `[memory]` asks for.
///
/// `provider` is the provider named by `embedding`; without one the hash
/// embedder is used.
pub fn embedding_from_config(
    config: &MemoryConfig,
    provider: Option<Arc<dyn Provider>>,
) -> EmbeddingService {
    match (config.embedding.as_str(), provider) {
        ("hash", _) => EmbeddingService::hashed(config.dimension),
        (_, Some(provider)) => EmbeddingService::new(Arc::new(ProviderEmbedder::new(
            provider,
            config.embedding_model.clone(),
            config.dimension,
        ))),
        (name, None) => {
            warn!(embedding = %name, "Embedding provider not configured, using hashed embeddings");
            EmbeddingService::hashed(config.dimension)
        }
    }
}

/// Open the store described by `[memory]`.
pub async fn open_from_config(
    config: &MemoryConfig,
    embedding_provider: Option<Arc<dyn Provider>>,
) -> Result<MemoryStore, MemoryError> {
    let backend: Arc<dyn MemoryBackend> = match config.backend.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let path = config.db_path();
            Arc::new(SqliteBackend::new(&path.to_string_lossy()).await?)
        }
        "memory" | "in_memory" => Arc::new(InMemoryBackend::new()),
        other => {
            return Err(MemoryError::Storage(format!(
                "Unknown memory backend '{other}'"
            )));
        }
    };
    let embeddings = Arc::new(embedding_from_config(config, embedding_provider));
    MemoryStore::open(backend, embeddings, StoreLimits::from(config)).await
}
