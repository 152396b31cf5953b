use crate::chunking::{reassemble_text, Chunk};
use crate::document::ArticleId;
use crate::embeddings::{check_dimension, fnv1a, Embedding};
use crate::error::RagError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use qdrant_client::qdrant::collections_client::CollectionsClient;
use qdrant_client::qdrant::{
    alias_operations, vectors, AliasOperations, ChangeAliases, CreateAlias,
    CreateCollectionBuilder, DeleteAlias, Distance, ListAliasesRequest, PointId, PointStruct,
    RetrievedPoint, ScrollPointsBuilder, UpsertPointsBuilder, Value, VectorParams,
};
use qdrant_client::{Qdrant, QdrantError};
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::RwLock;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::Channel;

/// One chunk and its vector
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Embedding,
}

/// All chunk/embedding pairs of one article, replaced wholesale on re-ingestion
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleIndex {
    pub article_id: ArticleId,
    /// Store-assigned generation; 0 means the article was never ingested
    pub generation: u64,
    /// `updated_at` of the article version this index was built from
    pub source_updated_at: u64,
    /// Embedding model that produced the vectors
    pub model_id: String,
    pub dimension: usize,
    /// Ordered by chunk index
    pub entries: Vec<IndexEntry>,
}

impl ArticleIndex {
    /// Index of an article that was never ingested
    pub fn empty(article_id: impl Into<ArticleId>) -> Self {
        ArticleIndex {
            article_id: article_id.into(),
            generation: 0,
            source_updated_at: 0,
            model_id: String::new(),
            dimension: 0,
            entries: Vec::new(),
        }
    }

    /// Pair chunks with their embeddings, checking counts and dimensions
    pub fn build(
        article_id: impl Into<ArticleId>,
        source_updated_at: u64,
        model_id: impl Into<String>,
        dimension: usize,
        chunks: Vec<Chunk>,
        embeddings: Vec<Embedding>,
    ) -> Result<Self, RagError> {
        if chunks.len() != embeddings.len() {
            return Err(RagError::EmbeddingUnavailable(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }
        for embedding in &embeddings {
            check_dimension(dimension, embedding)?;
        }

        let entries = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexEntry { chunk, embedding })
            .collect();

        Ok(ArticleIndex {
            article_id: article_id.into(),
            generation: 0,
            source_updated_at,
            model_id: model_id.into(),
            dimension,
            entries,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether vectors from the given model can be compared with this index.
    /// An index without entries has nothing to compare and always matches.
    pub fn is_compatible_with(&self, model_id: &str, dimension: usize) -> bool {
        self.is_empty() || (self.model_id == model_id && self.dimension == dimension)
    }

    /// The normalized article text the chunks were cut from
    pub fn source_text(&self) -> String {
        let chunks: Vec<Chunk> = self.entries.iter().map(|e| e.chunk.clone()).collect();
        reassemble_text(&chunks)
    }
}

/// Per-article vector persistence.
///
/// `replace_index` is all-or-nothing: concurrent readers observe either the
/// previous generation or the new one, never a mix.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Atomically swap the stored index for `index.article_id`, returning the new generation
    async fn replace_index(&self, index: ArticleIndex) -> Result<u64, RagError>;

    /// Current generation, or an empty index if the article was never ingested
    async fn get_index(&self, article_id: &str) -> Result<Arc<ArticleIndex>, RagError>;

    /// Remove every vector of an article; deleting a missing article is not an error
    async fn delete_index(&self, article_id: &str) -> Result<(), RagError>;
}

/// In-process store; each generation is an immutable `Arc` swapped under a write lock
#[derive(Default)]
pub struct MemoryVectorStore {
    indexes: RwLock<HashMap<ArticleId, Arc<ArticleIndex>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn replace_index(&self, mut index: ArticleIndex) -> Result<u64, RagError> {
        let mut indexes = self.indexes.write().await;
        let generation = indexes
            .get(&index.article_id)
            .map(|current| current.generation)
            .unwrap_or(0)
            + 1;
        index.generation = generation;
        debug!(
            "Storing generation {} of article {} ({} chunks)",
            generation,
            index.article_id,
            index.len()
        );
        indexes.insert(index.article_id.clone(), Arc::new(index));
        Ok(generation)
    }

    async fn get_index(&self, article_id: &str) -> Result<Arc<ArticleIndex>, RagError> {
        let indexes = self.indexes.read().await;
        Ok(indexes
            .get(article_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(ArticleIndex::empty(article_id))))
    }

    async fn delete_index(&self, article_id: &str) -> Result<(), RagError> {
        self.indexes.write().await.remove(article_id);
        Ok(())
    }
}

/// Configuration for Qdrant
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
}

impl QdrantConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let url = env::var("QDRANT_URL")?;
        let api_key = env::var("QDRANT_API_KEY").ok();

        Ok(QdrantConfig { url, api_key })
    }
}

const UPSERT_BATCH: usize = 256;
const SCROLL_PAGE: u32 = 256;

/// Adds the `api-key` header to raw gRPC calls
#[derive(Clone)]
struct ApiKeyInterceptor {
    api_key: Option<MetadataValue<Ascii>>,
}

impl Interceptor for ApiKeyInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        if let Some(api_key) = &self.api_key {
            request.metadata_mut().insert("api-key", api_key.clone());
        }
        Ok(request)
    }
}

/// Qdrant-backed store.
///
/// Every generation lives in its own collection (`rag_<article>_g<n>`) and an
/// alias named after the article points at the current one. The alias is
/// moved with a single `UpdateAliases` request, which Qdrant applies
/// atomically; readers resolve the alias once and read one concrete
/// collection, so a swap can never interleave with a read.
pub struct QdrantVectorStore {
    client: Qdrant,
    aliases: CollectionsClient<InterceptedService<Channel, ApiKeyInterceptor>>,
}

impl QdrantVectorStore {
    /// Create a new Qdrant-backed store
    pub async fn new(config: QdrantConfig) -> Result<Self> {
        let config_builder = Qdrant::from_url(&config.url);
        let config_builder = if let Some(api_key) = config.api_key.clone() {
            config_builder.api_key(api_key)
        } else {
            config_builder
        };
        let client = config_builder.build()?;

        let api_key = match &config.api_key {
            Some(key) => Some(
                MetadataValue::try_from(key.as_str()).context("Invalid Qdrant API key")?,
            ),
            None => None,
        };
        let channel = Channel::from_shared(config.url.clone())
            .with_context(|| format!("Invalid Qdrant URL {}", config.url))?
            .connect_lazy();
        let aliases = CollectionsClient::with_interceptor(channel, ApiKeyInterceptor { api_key });

        Ok(QdrantVectorStore { client, aliases })
    }

    /// Apply alias actions in one request; Qdrant commits them together
    async fn change_aliases(&self, actions: Vec<alias_operations::Action>) -> Result<()> {
        let actions = actions
            .into_iter()
            .map(|action| AliasOperations {
                action: Some(action),
            })
            .collect();

        self.aliases
            .clone()
            .update_aliases(ChangeAliases {
                actions,
                timeout: None,
            })
            .await?;

        Ok(())
    }

    /// Read one concrete collection; `None` when it no longer exists
    async fn read_collection(
        &self,
        article_id: &str,
        collection_name: &str,
    ) -> Result<Option<ArticleIndex>> {
        let mut entries = Vec::new();
        let mut model_id = String::new();
        let mut source_updated_at = 0;
        let mut offset: Option<PointId> = None;

        loop {
            let mut request = ScrollPointsBuilder::new(collection_name.to_string())
                .limit(SCROLL_PAGE)
                .with_payload(true)
                .with_vectors(true);
            if let Some(offset) = offset.take() {
                request = request.offset(offset);
            }

            let response = match self.client.scroll(request).await {
                Ok(response) => response,
                Err(QdrantError::ResponseError { status })
                    if status.code() == tonic::Code::NotFound =>
                {
                    return Ok(None);
                }
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "Failed to scroll collection {}: {}",
                        collection_name,
                        e
                    ))
                }
            };

            for point in response.result {
                let (entry, point_model, point_updated_at) = entry_from_point(point)?;
                model_id = point_model;
                source_updated_at = point_updated_at;
                entries.push(entry);
            }

            match response.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        entries.sort_by_key(|entry| entry.chunk.index);
        let dimension = entries
            .first()
            .map(|entry| entry.embedding.dimension())
            .unwrap_or(0);

        Ok(Some(ArticleIndex {
            article_id: article_id.to_string(),
            generation: generation_of(collection_name),
            source_updated_at,
            model_id,
            dimension,
            entries,
        }))
    }

    async fn try_get(&self, article_id: &str) -> Result<ArticleIndex> {
        let alias = get_collection_name(article_id);

        // A concurrent swap may drop the collection we resolved; resolve again
        for _ in 0..3 {
            let Some(collection_name) = self.resolve_alias(&alias).await? else {
                return Ok(ArticleIndex::empty(article_id));
            };
            if let Some(index) = self.read_collection(article_id, &collection_name).await? {
                return Ok(index);
            }
            debug!("Collection {} vanished during read, retrying", collection_name);
        }

        Err(anyhow::anyhow!(
            "Index for article {} kept changing during read",
            article_id
        ))
    }

    async fn try_delete(&self, article_id: &str) -> Result<()> {
        let alias = get_collection_name(article_id);
        let Some(collection_name) = self.resolve_alias(&alias).await? else {
            return Ok(());
        };

        self.change_aliases(vec![alias_operations::Action::DeleteAlias(DeleteAlias {
            alias_name: alias.clone(),
        })])
        .await
        .with_context(|| format!("Failed to delete alias {}", alias))?;
        self.drop_collection(&collection_name).await
    }
}

/// Collection and alias operations a generation swap is built from
#[async_trait]
trait GenerationBackend: Send + Sync {
    /// Collection currently behind `alias`, if any
    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>>;

    /// Drop a collection; a missing collection is not an error
    async fn drop_collection(&self, collection_name: &str) -> Result<()>;

    /// Create `collection_name` and fill it with every entry of `index`
    async fn create_generation(&self, collection_name: &str, index: &ArticleIndex) -> Result<()>;

    /// Point `alias` at `collection_name` in one atomic request
    async fn swap_alias(&self, alias: &str, collection_name: &str, had_previous: bool) -> Result<()>;
}

/// Build the next generation of an article and move its alias onto it.
///
/// Safe to repeat after any failure: a collection left over from an earlier
/// attempt at the same generation is dropped before it is rebuilt, and the
/// alias keeps pointing at the previous generation until the swap succeeds.
async fn replace_generation<B: GenerationBackend + ?Sized>(
    backend: &B,
    index: &ArticleIndex,
) -> Result<u64> {
    let alias = get_collection_name(&index.article_id);
    let previous = backend.resolve_alias(&alias).await?;
    let generation = previous.as_deref().map(generation_of).unwrap_or(0) + 1;
    let collection_name = format!("{}_g{}", alias, generation);

    backend.drop_collection(&collection_name).await?;
    if let Err(e) = backend.create_generation(&collection_name, index).await {
        if let Err(cleanup) = backend.drop_collection(&collection_name).await {
            warn!(
                "Failed to drop half-built collection {}: {:#}",
                collection_name, cleanup
            );
        }
        return Err(e);
    }
    backend
        .swap_alias(&alias, &collection_name, previous.is_some())
        .await?;
    info!(
        "Article {} now served from {} ({} chunks)",
        index.article_id,
        collection_name,
        index.len()
    );

    if let Some(previous) = previous {
        if let Err(e) = backend.drop_collection(&previous).await {
            warn!("Failed to drop superseded collection {}: {:#}", previous, e);
        }
    }

    Ok(generation)
}

#[async_trait]
impl GenerationBackend for QdrantVectorStore {
    /// Collection currently behind the article alias, if any
    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>> {
        let response = self
            .aliases
            .clone()
            .list_aliases(ListAliasesRequest {})
            .await
            .context("Failed to list Qdrant aliases")?
            .into_inner();

        Ok(response
            .aliases
            .into_iter()
            .find(|description| description.alias_name == alias)
            .map(|description| description.collection_name))
    }

    async fn drop_collection(&self, collection_name: &str) -> Result<()> {
        match self.client.delete_collection(collection_name.to_string()).await {
            Ok(_) => Ok(()),
            Err(QdrantError::ResponseError { status }) if status.code() == tonic::Code::NotFound => {
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to delete collection {}: {}",
                collection_name,
                e
            )),
        }
    }

    async fn create_generation(&self, collection_name: &str, index: &ArticleIndex) -> Result<()> {
        let create_collection = CreateCollectionBuilder::new(collection_name.to_string())
            .vectors_config(VectorParams {
                size: index.dimension.max(1) as u64,
                distance: Distance::Cosine.into(),
                ..Default::default()
            });

        self.client
            .create_collection(create_collection)
            .await
            .with_context(|| format!("Failed to create collection {}", collection_name))?;

        let mut points = Vec::with_capacity(index.len());
        for entry in &index.entries {
            let payload: HashMap<String, Value> = serde_json::from_value(json!({
                "text": entry.chunk.text,
                "chunk_index": entry.chunk.index,
                "start_char": entry.chunk.start_char,
                "end_char": entry.chunk.end_char,
                "model_id": index.model_id,
                "source_updated_at": index.source_updated_at,
            }))
            .context("Failed to build point payload")?;

            points.push(PointStruct::new(
                entry.chunk.index as u64,
                entry.embedding.values.clone(),
                payload,
            ));
        }

        for batch in points.chunks(UPSERT_BATCH) {
            let upsert_request =
                UpsertPointsBuilder::new(collection_name.to_string(), batch.to_vec()).wait(true);
            self.client
                .upsert_points(upsert_request)
                .await
                .with_context(|| {
                    format!("Failed to upsert points in collection {}", collection_name)
                })?;
        }

        Ok(())
    }

    /// Point `alias` at `collection_name`, dropping the previous mapping in the same request
    async fn swap_alias(&self, alias: &str, collection_name: &str, had_previous: bool) -> Result<()> {
        let mut actions = Vec::new();
        if had_previous {
            actions.push(alias_operations::Action::DeleteAlias(DeleteAlias {
                alias_name: alias.to_string(),
            }));
        }
        actions.push(alias_operations::Action::CreateAlias(CreateAlias {
            collection_name: collection_name.to_string(),
            alias_name: alias.to_string(),
        }));

        self.change_aliases(actions)
            .await
            .with_context(|| format!("Failed to move alias {} to {}", alias, collection_name))
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn replace_index(&self, index: ArticleIndex) -> Result<u64, RagError> {
        replace_generation(self, &index)
            .await
            .map_err(|e| RagError::Storage(format!("{:#}", e)))
    }

    async fn get_index(&self, article_id: &str) -> Result<Arc<ArticleIndex>, RagError> {
        self.try_get(article_id)
            .await
            .map(Arc::new)
            .map_err(|e| RagError::Storage(format!("{:#}", e)))
    }

    async fn delete_index(&self, article_id: &str) -> Result<(), RagError> {
        self.try_delete(article_id)
            .await
            .map_err(|e| RagError::Storage(format!("{:#}", e)))
    }
}

fn entry_from_point(point: RetrievedPoint) -> Result<(IndexEntry, String, u64)> {
    let values = match point.vectors.and_then(|v| v.vectors_options) {
        Some(vectors::VectorsOptions::Vector(vector)) => vector.data,
        _ => return Err(anyhow::anyhow!("Stored point has no dense vector")),
    };

    let payload = point.payload;
    let text = payload
        .get("text")
        .and_then(|v| v.as_str())
        .context("Stored point has no text")?
        .to_string();
    let int_field = |key: &str| -> Result<usize> {
        payload
            .get(key)
            .and_then(|v| v.as_integer())
            .map(|v| v as usize)
            .with_context(|| format!("Stored point has no {}", key))
    };
    let index = int_field("chunk_index")?;
    let start_char = int_field("start_char")?;
    let end_char = int_field("end_char")?;
    let source_updated_at = int_field("source_updated_at")? as u64;
    let model_id = payload
        .get("model_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_default();

    let entry = IndexEntry {
        chunk: Chunk {
            index,
            text,
            start_char,
            end_char,
        },
        embedding: Embedding::new(values),
    };
    Ok((entry, model_id, source_updated_at))
}

/// Generate a collection name from an article id.
///
/// The hash suffix keeps ids that sanitize to the same string apart.
fn get_collection_name(article_id: &str) -> String {
    let name = article_id
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_lowercase();

    format!("rag_{}_{:08x}", name, fnv1a(article_id.as_bytes()) as u32)
}

/// Parse the generation number from a `..._g<n>` collection name
fn generation_of(collection_name: &str) -> u64 {
    collection_name
        .rsplit_once("_g")
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::chunk_text;
    use crate::config::ChunkingConfig;

    fn index_with(article_id: &str, marker: f32, chunks: usize) -> ArticleIndex {
        let text: String = "x".repeat(chunks * 4);
        let chunks = chunk_text(&text, &ChunkingConfig::new(4, 0).unwrap());
        let embeddings = chunks
            .iter()
            .map(|_| Embedding::new(vec![marker, marker]))
            .collect();
        ArticleIndex::build(article_id, 1, "test-model", 2, chunks, embeddings).unwrap()
    }

    #[tokio::test]
    async fn test_missing_article_is_empty_index() {
        let store = MemoryVectorStore::new();
        let index = store.get_index("never-ingested").await.unwrap();

        assert!(index.is_empty());
        assert_eq!(index.generation, 0);
        assert_eq!(index.article_id, "never-ingested");
    }

    #[tokio::test]
    async fn test_replace_bumps_generation_and_supersedes() {
        let store = MemoryVectorStore::new();
        assert_eq!(store.replace_index(index_with("a", 1.0, 5)).await.unwrap(), 1);
        assert_eq!(store.replace_index(index_with("a", 2.0, 2)).await.unwrap(), 2);

        let index = store.get_index("a").await.unwrap();
        assert_eq!(index.generation, 2);
        assert_eq!(index.len(), 2);
        assert!(index.entries.iter().all(|e| e.embedding.values[0] == 2.0));
    }

    #[tokio::test]
    async fn test_articles_are_independent() {
        let store = MemoryVectorStore::new();
        store.replace_index(index_with("a", 1.0, 3)).await.unwrap();
        store.replace_index(index_with("b", 2.0, 1)).await.unwrap();
        store.delete_index("a").await.unwrap();

        assert!(store.get_index("a").await.unwrap().is_empty());
        assert_eq!(store.get_index("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryVectorStore::new();
        store.delete_index("ghost").await.unwrap();
        store.replace_index(index_with("a", 1.0, 1)).await.unwrap();
        store.delete_index("a").await.unwrap();
        store.delete_index("a").await.unwrap();
        assert!(store.get_index("a").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_mixed_generations() {
        let store = Arc::new(MemoryVectorStore::new());
        store.replace_index(index_with("a", 0.0, 8)).await.unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for generation in 1..200 {
                    let chunks = 1 + generation % 8;
                    store
                        .replace_index(index_with("a", generation as f32, chunks))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..500 {
                        let index = store.get_index("a").await.unwrap();
                        let marker = index.entries[0].embedding.values[0];
                        assert!(index
                            .entries
                            .iter()
                            .all(|e| e.embedding.values[0] == marker));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[test]
    fn test_build_rejects_mismatched_input() {
        let chunks = chunk_text("abcdefgh", &ChunkingConfig::new(4, 0).unwrap());
        let too_few = vec![Embedding::new(vec![0.0, 1.0])];
        assert!(ArticleIndex::build("a", 0, "m", 2, chunks.clone(), too_few).is_err());

        let wrong_dim = vec![Embedding::new(vec![0.0]), Embedding::new(vec![1.0])];
        assert!(matches!(
            ArticleIndex::build("a", 0, "m", 2, chunks, wrong_dim),
            Err(RagError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_compatibility_and_source_text() {
        let text = "The borrow checker enforces aliasing rules.";
        let chunks = chunk_text(text, &ChunkingConfig::new(10, 3).unwrap());
        let embeddings = chunks.iter().map(|_| Embedding::new(vec![1.0])).collect();
        let index = ArticleIndex::build("a", 0, "model-a", 1, chunks, embeddings).unwrap();

        assert_eq!(index.source_text(), text);
        assert!(index.is_compatible_with("model-a", 1));
        assert!(!index.is_compatible_with("model-b", 1));
        assert!(!index.is_compatible_with("model-a", 384));
        assert!(ArticleIndex::empty("b").is_compatible_with("anything", 7));
    }

    #[test]
    fn test_collection_names() {
        let a = get_collection_name("my-post");
        let b = get_collection_name("my_post");
        assert!(a.starts_with("rag_my_post_"));
        assert_ne!(a, b);
        assert_eq!(generation_of(&format!("{}_g12", a)), 12);
        assert_eq!(generation_of("rag_plain"), 0);
    }

    /// Collections and aliases held in memory; upserts can be made to fail
    #[derive(Default)]
    struct FakeBackend {
        state: std::sync::Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        collections: HashMap<String, usize>,
        aliases: HashMap<String, String>,
        failed_upserts: u32,
    }

    #[async_trait]
    impl GenerationBackend for FakeBackend {
        async fn resolve_alias(&self, alias: &str) -> Result<Option<String>> {
            Ok(self.state.lock().unwrap().aliases.get(alias).cloned())
        }

        async fn drop_collection(&self, collection_name: &str) -> Result<()> {
            self.state.lock().unwrap().collections.remove(collection_name);
            Ok(())
        }

        async fn create_generation(
            &self,
            collection_name: &str,
            index: &ArticleIndex,
        ) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.collections.contains_key(collection_name) {
                return Err(anyhow::anyhow!("Collection {} already exists", collection_name));
            }
            state.collections.insert(collection_name.to_string(), 0);
            if state.failed_upserts > 0 {
                state.failed_upserts -= 1;
                return Err(anyhow::anyhow!("upsert timed out"));
            }
            state
                .collections
                .insert(collection_name.to_string(), index.len());
            Ok(())
        }

        async fn swap_alias(
            &self,
            alias: &str,
            collection_name: &str,
            _had_previous: bool,
        ) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .aliases
                .insert(alias.to_string(), collection_name.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_upsert_can_be_retried() {
        let backend = FakeBackend::default();
        let alias = get_collection_name("post");
        let index = index_with("post", 1.0, 3);

        assert_eq!(replace_generation(&backend, &index).await.unwrap(), 1);

        backend.state.lock().unwrap().failed_upserts = 1;
        assert!(replace_generation(&backend, &index).await.is_err());
        {
            let state = backend.state.lock().unwrap();
            assert_eq!(state.aliases[&alias], format!("{}_g1", alias));
            assert!(!state.collections.contains_key(&format!("{}_g2", alias)));
        }

        assert_eq!(replace_generation(&backend, &index).await.unwrap(), 2);
        let state = backend.state.lock().unwrap();
        assert_eq!(state.aliases[&alias], format!("{}_g2", alias));
        assert_eq!(state.collections.len(), 1);
        assert_eq!(state.collections[&format!("{}_g2", alias)], 3);
    }

    #[tokio::test]
    async fn test_leftover_collection_is_rebuilt() {
        let backend = FakeBackend::default();
        let alias = get_collection_name("post");
        backend
            .state
            .lock()
            .unwrap()
            .collections
            .insert(format!("{}_g1", alias), 0);

        let index = index_with("post", 1.0, 2);
        assert_eq!(replace_generation(&backend, &index).await.unwrap(), 1);

        let state = backend.state.lock().unwrap();
        assert_eq!(state.aliases[&alias], format!("{}_g1", alias));
        assert_eq!(state.collections[&format!("{}_g1", alias)], 2);
    }
}
