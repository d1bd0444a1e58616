use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::ollama::OllamaClient;
use crate::text_index::sha256_hex;

const CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    #[error("embedding service returned a zero-length vector")]
    Empty,
}

/// Embedding front-end: L2-normalizes vectors (so cosine similarity equals
/// dot product), caches by `(model, sha256(text))`, and bounds concurrent
/// service calls.
#[derive(Clone)]
pub struct EmbedClient {
    ollama: OllamaClient,
    model: String,
    timeout: Duration,
    fanout: Arc<Semaphore>,
    cache: Arc<Mutex<EmbedCache>>,
}

impl EmbedClient {
    pub fn new(
        ollama: OllamaClient,
        model: impl Into<String>,
        timeout: Duration,
        n_embed: usize,
    ) -> Self {
        Self {
            ollama,
            model: model.into(),
            timeout,
            fanout: Arc::new(Semaphore::new(n_embed.max(1))),
            cache: Arc::new(Mutex::new(EmbedCache::new(CACHE_CAPACITY))),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let key = format!("{}:{}", self.model, sha256_hex(text));
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return Ok(hit);
            }
        }

        let _permit = self
            .fanout
            .acquire()
            .await
            .map_err(|_| EmbedError::Unavailable("embed semaphore closed".into()))?;

        let raw = self
            .ollama
            .embed(&self.model, text, self.timeout)
            .await
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
        if raw.is_empty() {
            return Err(EmbedError::Empty);
        }

        let vector = l2_normalize(raw);
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, vector.clone());
        }
        Ok(vector)
    }
}

pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

/// Cosine similarity. Inputs from `EmbedClient` are unit vectors, so this
/// is just the dot product, but the norm terms keep it correct for raw
/// vectors too.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// Bounded least-recently-used map. Recency is tracked with a logical
/// clock; eviction scans for the stalest entry, which is fine at this
/// capacity and keeps the structure trivial.
struct EmbedCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, (Vec<f32>, u64)>,
}

impl EmbedCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|(vector, used)| {
            *used = tick;
            vector.clone()
        })
    }

    fn put(&mut self, key: String, vector: Vec<f32>) {
        self.tick += 1;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(stalest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&stalest);
            }
        }
        self.entries.insert(key, (vector, self.tick));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_vector() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn cosine_of_unit_vectors_is_dot_product() {
        let a = l2_normalize(vec![1.0, 1.0]);
        let b = l2_normalize(vec![1.0, 0.0]);
        assert!((cosine(&a, &b) - (0.5f32).sqrt()).abs() < 1e-6);
        assert_eq!(cosine(&a, &[]), 0.0);
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = EmbedCache::new(2);
        cache.put("a".into(), vec![1.0]);
        cache.put("b".into(), vec![2.0]);
        assert!(cache.get("a").is_some());
        cache.put("c".into(), vec![3.0]);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn cache_updates_existing_key_without_eviction() {
        let mut cache = EmbedCache::new(2);
        cache.put("a".into(), vec![1.0]);
        cache.put("b".into(), vec![2.0]);
        cache.put("a".into(), vec![9.0]);
        assert_eq!(cache.get("a"), Some(vec![9.0]));
        assert!(cache.get("b").is_some());
    }
}
