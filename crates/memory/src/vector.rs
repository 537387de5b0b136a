//! Vector similarity and ranking utilities.

use std::cmp::Ordering;
use toolweave_core::memory::{MemoryItem, Scored};

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if the lengths differ or either vector is empty or zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Order by score descending, then newer first.
pub fn by_score_then_recency<T: MemoryItem>(a: &Scored<T>, b: &Scored<T>) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.item.recency().cmp(&a.item.recency()))
}

/// Top `k` items by `weight(item, cosine)`, ties broken by recency.
///
/// Items without an embedding are skipped.
pub fn rank<'a, T, I, W>(items: I, query: &[f32], k: usize, weight: W) -> Vec<Scored<T>>
where
    T: MemoryItem + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
    W: Fn(&T, f32) -> f32,
{
    if k == 0 {
        return Vec::new();
    }
    let mut scored: Vec<Scored<T>> = items
        .into_iter()
        .filter(|item| !item.embedding().is_empty())
        .map(|item| Scored {
            score: weight(item, cosine_similarity(item.embedding(), query)),
            item: item.clone(),
        })
        .collect();

    scored.sort_by(by_score_then_recency);
    scored.truncate(k);
    scored
}

/// Top `k` by raw cosine similarity.
pub fn top_k<'a, T, I>(items: I, query: &[f32], k: usize) -> Vec<Scored<T>>
where
    T: MemoryItem + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
{
    rank(items, query, k, |_, sim| sim)
}

/// Encode a vector as little-endian f32 bytes.
pub fn to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes. A trailing partial chunk is ignored.
pub fn from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
