use crate::error::RagError;
use async_trait::async_trait;
use log::debug;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Embedding { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }
}

/// Maps text to a fixed-dimension vector.
///
/// Implementations must be deterministic for a fixed model: the same text
/// always yields the same vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifies the model; indexes built with another model are never compared
    fn model_id(&self) -> &str;

    /// Dimension of every vector this embedder returns
    fn dimension(&self) -> usize;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Embedding, RagError>;

    /// Embed many texts, preserving order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, RagError> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }
}

/// Fail when a collaborator returns a vector of the wrong size
pub fn check_dimension(expected: usize, embedding: &Embedding) -> Result<(), RagError> {
    if embedding.dimension() != expected {
        return Err(RagError::DimensionMismatch {
            expected,
            actual: embedding.dimension(),
        });
    }
    Ok(())
}

/// Local embedding model based on signed feature hashing.
///
/// Words and character trigrams are hashed into `dimension` buckets and the
/// result is L2-normalized. It runs in-process, never fails and is fully
/// deterministic, which makes it the default when no remote model is set up.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedder {
    /// A `dimension` of zero is raised to one
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        HashingEmbedder {
            dimension,
            model_id: format!("hashing-v1-{}", dimension),
        }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut values = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();

        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.add_feature(&mut values, word.as_bytes(), 1.0);

            let padded: Vec<char> = format!("#{}#", word).chars().collect();
            for trigram in padded.windows(3) {
                let trigram: String = trigram.iter().collect();
                self.add_feature(&mut values, trigram.as_bytes(), 0.5);
            }
        }

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in values.iter_mut() {
                *v /= norm;
            }
        }
        values
    }

    fn add_feature(&self, values: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let bucket = (hash % self.dimension as u64) as usize;
        // top bit picks the sign so unrelated features cancel out on average
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        values[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding, RagError> {
        Ok(Embedding::new(self.vectorize(text)))
    }
}

pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Query-path wrapper that remembers recent embeddings in an LRU cache
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Option<Mutex<LruCache<String, Embedding>>>,
}

impl CachedEmbedder {
    /// A capacity of zero disables caching
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        let cache = NonZeroUsize::new(capacity).map(|capacity| Mutex::new(LruCache::new(capacity)));
        CachedEmbedder { inner, cache }
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Embedding, RagError> {
        let Some(cache) = &self.cache else {
            return self.inner.embed(text).await;
        };

        if let Some(hit) = cache.lock().await.get(text) {
            debug!("Query embedding cache hit");
            return Ok(hit.clone());
        }

        let embedding = self.inner.embed(text).await?;
        cache.lock().await.put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, RagError> {
        self.inner.embed_batch(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::cosine_similarity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed(&self, text: &str) -> Result<Embedding, RagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text).await
        }
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(384);
        let a = embedder.embed("Rust ownership and borrowing").await.unwrap();
        let b = embedder.embed("Rust ownership and borrowing").await.unwrap();

        assert_eq!(a.dimension(), 384);
        assert_eq!(a.values, b.values);
    }

    #[tokio::test]
    async fn test_hashing_embedder_ranks_related_text_higher() {
        let embedder = HashingEmbedder::new(384);
        let query = embedder.embed("how does borrowing work").await.unwrap();
        let related = embedder
            .embed("Borrowing lets code use a value without taking ownership")
            .await
            .unwrap();
        let unrelated = embedder
            .embed("The weather in spring is mild and rainy")
            .await
            .unwrap();

        assert!(
            cosine_similarity(&query.values, &related.values)
                > cosine_similarity(&query.values, &unrelated.values)
        );
    }

    #[tokio::test]
    async fn test_empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        let embedding = embedder.embed("  ").await.unwrap();
        assert!(embedding.values.iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn test_zero_dimension_is_raised_to_one() {
        let embedder = HashingEmbedder::new(0);
        assert_eq!(embedder.dimension(), 1);

        let embedding = embedder.embed("borrowing").await.unwrap();
        assert_eq!(embedding.dimension(), 1);
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let embedder = HashingEmbedder::new(64);
        let texts = vec!["first".to_string(), "second".to_string()];
        let batch = embedder.embed_batch(&texts).await.unwrap();

        assert_eq!(batch[0], embedder.embed("first").await.unwrap());
        assert_eq!(batch[1], embedder.embed("second").await.unwrap());
    }

    #[tokio::test]
    async fn test_cached_embedder_reuses_vectors() {
        let counting = Arc::new(CountingEmbedder {
            inner: HashingEmbedder::new(32),
            calls: AtomicUsize::new(0),
        });
        let cached = CachedEmbedder::new(counting.clone(), 8);

        let first = cached.embed("what is a lifetime").await.unwrap();
        let second = cached.embed("what is a lifetime").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        let uncached = CachedEmbedder::new(counting.clone(), 0);
        uncached.embed("what is a lifetime").await.unwrap();
        uncached.embed("what is a lifetime").await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_check_dimension() {
        let embedding = Embedding::new(vec![0.0; 3]);
        assert!(check_dimension(3, &embedding).is_ok());
        assert!(matches!(
            check_dimension(4, &embedding),
            Err(RagError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }
}
