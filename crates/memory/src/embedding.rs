//! Text embeddings for similarity search.
//!
//! [`HashEmbedder`] is deterministic and offline: SHA-256 feature hashing of
//! character trigrams and words. [`ProviderEmbedder`] asks a model provider.
//! [`EmbeddingService`] caches either one and falls back to hashing when the
//! provider fails, so memory keeps working without network access.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use toolweave_core::error::MemoryError;
use toolweave_core::provider::{EmbeddingRequest, Provider};
use tracing::{debug, warn};

pub const DEFAULT_DIMENSION: usize = 384;
const CACHE_CAPACITY: usize = 2000;

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError>;
}

/// Feature-hashing embedder. Captures lexical overlap, not meaning.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embed one text synchronously.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimension];
        let lower = text.trim().to_lowercase();
        if lower.is_empty() {
            return vec;
        }

        let chars: Vec<char> = lower.chars().collect();
        for window in chars.windows(3) {
            let gram: String = window.iter().collect();
            vec[self.bucket(&gram)] += 1.0;
        }
        for word in lower.split_whitespace() {
            if word.chars().count() >= 2 {
                vec[self.bucket(word)] += 2.0;
            }
        }

        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vec {
                *x /= norm;
            }
        }
        vec
    }

    fn bucket(&self, feature: &str) -> usize {
        let digest = Sha256::digest(feature.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(head) % self.dimension as u64) as usize
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Embeds through a model provider's embedding endpoint.
pub struct ProviderEmbedder {
    provider: Arc<dyn Provider>,
    model: String,
    dimension: usize,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            provider,
            model: model.into(),
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        let response = self
            .provider
            .embed(EmbeddingRequest {
                model: self.model.clone(),
                inputs: texts.to_vec(),
            })
            .await
            .map_err(|e| MemoryError::EmbeddingFailed(e.to_string()))?;

        if response.embeddings.len() != texts.len() {
            return Err(MemoryError::EmbeddingFailed(format!(
                "expected {} vectors, got {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        if let Some(bad) = response.embeddings.iter().find(|v| v.len() != self.dimension) {
            return Err(MemoryError::EmbeddingFailed(format!(
                "expected dimension {}, got {}",
                self.dimension,
                bad.len()
            )));
        }
        Ok(response.embeddings)
    }
}

/// Insertion-ordered cache; evicts the oldest fifth when full.
#[derive(Debug, Default)]
struct EmbeddingCache {
    entries: HashMap<String, (u64, Vec<f32>)>,
    seq: u64,
}

impl EmbeddingCache {
    fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.entries.get(text).map(|(_, v)| v.clone())
    }

    fn insert(&mut self, text: String, vec: Vec<f32>) {
        if self.entries.len() >= CACHE_CAPACITY {
            let mut by_age: Vec<(u64, String)> = self
                .entries
                .iter()
                .map(|(k, (seq, _))| (*seq, k.clone()))
                .collect();
            by_age.sort_unstable();
            for (_, key) in by_age.into_iter().take(CACHE_CAPACITY / 5) {
                self.entries.remove(&key);
            }
        }
        self.seq += 1;
        self.entries.insert(text, (self.seq, vec));
    }
}

/// Cached embedding front-end used by the memory store.
pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    fallback: HashEmbedder,
    cache: Mutex<EmbeddingCache>,
}

impl EmbeddingService {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        let fallback = HashEmbedder::new(embedder.dimension());
        Self {
            embedder,
            fallback,
            cache: Mutex::new(EmbeddingCache::default()),
        }
    }

    /// Offline hashing service.
    pub fn hashed(dimension: usize) -> Self {
        Self::new(Arc::new(HashEmbedder::new(dimension)))
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.name()
    }

    pub async fn embed(&self, text: &str) -> Vec<f32> {
        let mut out = self.embed_batch(&[text.to_string()]).await;
        out.pop().unwrap_or_else(|| vec![0.0; self.dimension()])
    }

    /// Embed many texts; results line up with `texts`.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let mut out: Vec<Option<Vec<f32>>> = {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            texts.iter().map(|t| cache.get(t)).collect()
        };

        let missing: Vec<String> = texts
            .iter()
            .zip(&out)
            .filter(|(_, v)| v.is_none())
            .map(|(t, _)| t.clone())
            .collect();
        if missing.is_empty() {
            return out.into_iter().flatten().collect();
        }

        let fresh = match self.embedder.embed(&missing).await {
            Ok(vectors) => vectors,
            Err(e) => {
                warn!(
                    embedder = %self.embedder.name(),
                    error = %e,
                    "Embedding failed, falling back to hashing"
                );
                missing.iter().map(|t| self.fallback.embed_one(t)).collect()
            }
        };
        debug!(count = missing.len(), "Embedded texts");

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let mut fresh = fresh.into_iter();
        for (text, slot) in texts.iter().zip(out.iter_mut()) {
            if slot.is_none() {
                let vec = fresh
                    .next()
                    .unwrap_or_else(|| vec![0.0; self.fallback.dimension]);
                cache.insert(text.clone(), vec.clone());
                *slot = Some(vec);
            }
        }
        out.into_iter().flatten().collect()
    }

    pub fn cached(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[test]
    fn hash_embedding_is_normalized_and_deterministic() {
        let e = HashEmbedder::default();
        let a = e.embed_one("find the broken attribute wrangle");
        let b = e.embed_one("find the broken attribute wrangle");
        assert_eq!(a.len(), DEFAULT_DIMENSION);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashEmbedder::new(16);
        assert!(e.embed_one("   ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn similar_texts_score_higher() {
        let e = HashEmbedder::default();
        let q = e.embed_one("count the points in the mesh");
        let near = e.embed_one("count points in this mesh");
        let far = e.embed_one("translate the french poem");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn name(&self) -> &str {
            "failing"
        }
        fn dimension(&self) -> usize {
            32
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
            Err(MemoryError::EmbeddingFailed("offline".into()))
        }
    }

    #[tokio::test]
    async fn service_falls_back_and_caches() {
        let service = EmbeddingService::new(Arc::new(FailingEmbedder));
        let v = service.embed("hello world").await;
        assert_eq!(v.len(), 32);
        assert_eq!(v, HashEmbedder::new(32).embed_one("hello world"));
        assert_eq!(service.cached(), 1);

        let batch = service
            .embed_batch(&["hello world".to_string(), "other".to_string()])
            .await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], v);
        assert_eq!(service.cached(), 2);
    }

    #[test]
    fn cache_evicts_oldest_fifth() {
        let mut cache = EmbeddingCache::default();
        for i in 0..CACHE_CAPACITY {
            cache.insert(format!("t{i}"), vec![i as f32]);
        }
        cache.insert("new".into(), vec![0.0]);
        assert_eq!(cache.entries.len(), CACHE_CAPACITY - CACHE_CAPACITY / 5 + 1);
        assert!(cache.get("t0").is_none());
        assert!(cache.get(&format!("t{}", CACHE_CAPACITY - 1)).is_some());
        assert!(cache.get("new").is_some());
    }
}
