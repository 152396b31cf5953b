//! Background chunk, embed and store jobs driven by article change events.
//!
//! Events for the same article are coalesced: while a job for an article is
//! waiting out the debounce window or running, newer events replace the
//! pending one, so only the latest content is ingested. Each article has at
//! most one worker task, which linearizes `replace_index` per article.

use crate::chunking::chunk_text;
use crate::config::{ChunkingConfig, RagConfig, RetryPolicy};
use crate::database::{ArticleIndex, VectorStore};
use crate::document::{Article, ArticleId};
use crate::embeddings::Embedder;
use crate::error::RagError;
use crate::observability::{EventKind, ObservabilityEvent, Observer};
use log::{debug, info};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{sleep, timeout};

/// Notification from the content system
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleEvent {
    /// Article created or edited; carries the normalized text
    Changed(Article),
    /// Article deleted; its index goes with it
    Deleted(ArticleId),
}

impl ArticleEvent {
    pub fn article_id(&self) -> &str {
        match self {
            ArticleEvent::Changed(article) => &article.id,
            ArticleEvent::Deleted(article_id) => article_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Indexed { generation: u64, chunks: usize },
    Deleted,
    Stale,
    KeptPrevious { attempts: u32 },
    Failed,
}

struct Failure {
    error: RagError,
    attempts: u32,
}

/// Per-article job slot; present while the article has a live worker
struct Slot {
    pending: Option<ArticleEvent>,
}

struct Inner {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    observer: Arc<dyn Observer>,
    chunking: ChunkingConfig,
    retry: RetryPolicy,
    embed_timeout: Duration,
    debounce: Duration,
    permits: Semaphore,
    slots: Mutex<HashMap<ArticleId, Slot>>,
    idle: Notify,
}

/// Handle to the background ingestion workers; cheap to clone
#[derive(Clone)]
pub struct IngestionPipeline {
    inner: Arc<Inner>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        observer: Arc<dyn Observer>,
        config: &RagConfig,
    ) -> Self {
        IngestionPipeline {
            inner: Arc::new(Inner {
                store,
                embedder,
                observer,
                chunking: config.chunking,
                retry: config.retry,
                embed_timeout: config.embed_timeout,
                debounce: config.debounce,
                permits: Semaphore::new(config.max_concurrent_ingestions.max(1)),
                slots: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    /// Queue an event. Must be called from within a Tokio runtime.
    pub fn submit(&self, event: ArticleEvent) {
        let article_id = event.article_id().to_string();
        let mut slots = self.inner.slots();

        match slots.get_mut(&article_id) {
            Some(slot) => {
                if slot.pending.replace(event).is_some() {
                    debug!("Coalesced pending ingestion for article {}", article_id);
                }
            }
            None => {
                slots.insert(
                    article_id.clone(),
                    Slot {
                        pending: Some(event),
                    },
                );
                tokio::spawn(self.inner.clone().run_worker(article_id));
            }
        }
    }

    /// True when no article has a pending or running job
    pub fn is_idle(&self) -> bool {
        self.inner.slots().is_empty()
    }

    /// Wait until every submitted event has been processed
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<ArticleId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_worker(self: Arc<Self>, article_id: ArticleId) {
        loop {
            if !self.debounce.is_zero() {
                sleep(self.debounce).await;
            }

            let event = {
                let mut slots = self.slots();
                match slots.get_mut(&article_id).and_then(|slot| slot.pending.take()) {
                    Some(event) => event,
                    None => {
                        slots.remove(&article_id);
                        if slots.is_empty() {
                            self.idle.notify_waiters();
                        }
                        return;
                    }
                }
            };

            let _permit = self.permits.acquire().await.ok();
            let outcome = self.process(event).await;
            debug!("Ingestion of article {} finished: {:?}", article_id, outcome);
        }
    }

    async fn process(&self, event: ArticleEvent) -> Outcome {
        match event {
            ArticleEvent::Changed(article) => self.ingest(article).await,
            ArticleEvent::Deleted(article_id) => {
                let store = &self.store;
                let id = article_id.as_str();
                match self
                    .with_retry(id, move || async move { store.delete_index(id).await })
                    .await
                {
                    Ok(()) => {
                        info!("Deleted index for article {}", article_id);
                        Outcome::Deleted
                    }
                    Err(failure) => self.give_up(id, failure),
                }
            }
        }
    }

    async fn ingest(&self, article: Article) -> Outcome {
        let store = &self.store;
        let id = article.id.as_str();

        let current = match self
            .with_retry(id, move || async move { store.get_index(id).await })
            .await
        {
            Ok(current) => current,
            Err(failure) => return self.give_up(id, failure),
        };
        if current.generation > 0 && article.updated_at < current.source_updated_at {
            info!(
                "Skipping stale update of article {} ({} < {})",
                id, article.updated_at, current.source_updated_at
            );
            return Outcome::Stale;
        }

        let chunks = chunk_text(&article.content, &self.chunking);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            let embedder = &self.embedder;
            let texts = &texts;
            let limit = self.embed_timeout;
            let embedded = self
                .with_retry(id, move || async move {
                    timeout(limit, embedder.embed_batch(texts))
                        .await
                        .map_err(|_| {
                            RagError::EmbeddingUnavailable(format!(
                                "timed out after {:?}",
                                limit
                            ))
                        })?
                })
                .await;
            match embedded {
                Ok(embeddings) => embeddings,
                Err(failure) => return self.give_up(id, failure),
            }
        };

        let index = match ArticleIndex::build(
            id,
            article.updated_at,
            self.embedder.model_id(),
            self.embedder.dimension(),
            chunks,
            embeddings,
        ) {
            Ok(index) => index,
            Err(error) => return self.give_up(id, Failure { error, attempts: 1 }),
        };
        let chunk_count = index.len();

        let index = &index;
        match self
            .with_retry(id, move || async move { store.replace_index(index.clone()).await })
            .await
        {
            Ok(generation) => {
                info!(
                    "Indexed article {} as generation {} ({} chunks)",
                    id, generation, chunk_count
                );
                Outcome::Indexed {
                    generation,
                    chunks: chunk_count,
                }
            }
            Err(failure) => self.give_up(id, failure),
        }
    }

    /// Run `op`, retrying retryable errors with backoff up to the attempt limit
    async fn with_retry<T, F, Fut>(&self, article_id: &str, mut op: F) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RagError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.retry.max_attempts => {
                    self.report(article_id, EventKind::IngestionRetry, &error, attempt);
                    sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(Failure {
                        error,
                        attempts: attempt,
                    })
                }
            }
        }
    }

    /// The previous generation, if any, stays in the store untouched
    fn give_up(&self, article_id: &str, failure: Failure) -> Outcome {
        if failure.error.is_retryable() {
            self.report(
                article_id,
                EventKind::IngestionExhausted,
                &failure.error,
                failure.attempts,
            );
            Outcome::KeptPrevious {
                attempts: failure.attempts,
            }
        } else {
            self.report(
                article_id,
                EventKind::IngestionFailed,
                &failure.error,
                failure.attempts,
            );
            Outcome::Failed
        }
    }

    fn report(&self, article_id: &str, kind: EventKind, error: &RagError, attempts: u32) {
        self.observer.report(ObservabilityEvent {
            article_id: article_id.to_string(),
            kind,
            error_kind: error.kind(),
            attempts,
            detail: error.to_string(),
        });
    }
}
