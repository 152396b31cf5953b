use crate::chunking::Chunk;
use crate::database::{ArticleIndex, VectorStore};
use crate::document::ArticleId;
use crate::embeddings::Embedding;
use crate::error::RagError;
use std::sync::Arc;

/// A retrieved chunk and its similarity to the question
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Top-K chunks for one question, best first. Never cached or shared between questions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetrievalResult {
    pub article_id: ArticleId,
    pub chunks: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn empty(article_id: impl Into<ArticleId>) -> Self {
        RetrievalResult {
            article_id: article_id.into(),
            chunks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

/// Cosine of the angle between two vectors, in [-1, 1].
///
/// Returns 0.0 when either vector has zero magnitude or the lengths differ;
/// callers are expected to have checked dimensions beforehand.
pub fn cosine_similarity(e1: &[f32], e2: &[f32]) -> f32 {
    if e1.len() != e2.len() {
        return 0.0;
    }

    let dot_product: f32 = e1.iter().zip(e2.iter()).map(|(a, b)| a * b).sum();
    let norm1: f32 = e1.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm2: f32 = e2.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm1 == 0.0 || norm2 == 0.0 {
        return 0.0;
    }

    (dot_product / (norm1 * norm2)).clamp(-1.0, 1.0)
}

/// Score every chunk of `index` against `query` and keep the best `k`.
///
/// Ties go to the earlier chunk. `k` larger than the index returns every chunk.
pub fn rank(index: &ArticleIndex, query: &Embedding, k: usize) -> Result<RetrievalResult, RagError> {
    if index.is_empty() {
        return Ok(RetrievalResult::empty(index.article_id.clone()));
    }
    if index.dimension != query.dimension() {
        return Err(RagError::DimensionMismatch {
            expected: index.dimension,
            actual: query.dimension(),
        });
    }

    let mut scored: Vec<ScoredChunk> = index
        .entries
        .iter()
        .map(|entry| ScoredChunk {
            score: cosine_similarity(&query.values, &entry.embedding.values),
            chunk: entry.chunk.clone(),
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.index.cmp(&b.chunk.index))
    });
    scored.truncate(k);

    Ok(RetrievalResult {
        article_id: index.article_id.clone(),
        chunks: scored,
    })
}

/// Read-only similarity search scoped to one article
#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn VectorStore>,
}

impl Retriever {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Retriever { store }
    }

    /// The article's current generation; an empty index if it was never ingested
    pub async fn index(&self, article_id: &str) -> Result<Arc<ArticleIndex>, RagError> {
        self.store.get_index(article_id).await
    }

    /// Top-`k` chunks of the article's current index for `query`
    pub async fn retrieve(
        &self,
        article_id: &str,
        query: &Embedding,
        k: usize,
    ) -> Result<RetrievalResult, RagError> {
        let index = self.index(article_id).await?;
        rank(&index, query, k)
    }
}
