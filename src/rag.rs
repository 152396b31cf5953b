use crate::config::RagConfig;
use crate::database::VectorStore;
use crate::document::{Article, ArticleId};
use crate::embeddings::{CachedEmbedder, Embedder};
use crate::error::RagError;
use crate::generation::{
    fixed_answer, AnswerGenerator, AnswerStream, CancelSignal, LanguageModel, NOT_INDEXED_MESSAGE,
};
use crate::ingestion::{ArticleEvent, IngestionPipeline};
use crate::observability::{EventKind, ObservabilityEvent, Observer};
use crate::retriever::{rank, Retriever};
use anyhow::Result;
use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// First frame on every chat channel
pub const GREETING: &str = "Connected to AI assistant with RAG. Ask anything!";

/// RAG (Retrieval-Augmented Generation) engine
pub struct RagEngine {
    retriever: Retriever,
    query_embedder: Arc<dyn Embedder>,
    generator: AnswerGenerator,
    pipeline: IngestionPipeline,
    observer: Arc<dyn Observer>,
    top_k: usize,
    embed_timeout: Duration,
}

impl RagEngine {
    /// Wire the store, embedder and language model together.
    ///
    /// The same embedder is used for ingestion and (behind an LRU cache) for
    /// questions, so both sides of every comparison come from one model.
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
        observer: Arc<dyn Observer>,
        config: &RagConfig,
    ) -> Self {
        let pipeline =
            IngestionPipeline::new(store.clone(), embedder.clone(), observer.clone(), config);
        let query_embedder: Arc<dyn Embedder> =
            Arc::new(CachedEmbedder::new(embedder, config.query_cache_size));
        let generator = AnswerGenerator::new(model, config.generate_timeout)
            .with_rate_limit(config.llm_calls_per_minute);

        RagEngine {
            retriever: Retriever::new(store),
            query_embedder,
            generator,
            pipeline,
            observer,
            top_k: config.top_k,
            embed_timeout: config.embed_timeout,
        }
    }

    /// Background ingestion handle
    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    /// Hand a content-system event to the background pipeline
    pub fn submit(&self, event: ArticleEvent) {
        self.pipeline.submit(event);
    }

    /// Answer `question` from the article's current index.
    ///
    /// Articles without chunks get the fixed not-indexed reply; so do articles
    /// whose index came from a different embedding model, which are queued for
    /// re-ingestion. Query-path failures are returned, never retried.
    pub async fn ask(
        &self,
        article_id: &str,
        question: &str,
        cancel: CancelSignal,
    ) -> Result<AnswerStream, RagError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::EmptyQuestion);
        }

        let index = self.retriever.index(article_id).await?;
        if index.is_empty() {
            debug!("Article {} has no chunks", article_id);
            return Ok(fixed_answer(NOT_INDEXED_MESSAGE));
        }

        let model_id = self.query_embedder.model_id();
        let dimension = self.query_embedder.dimension();
        if !index.is_compatible_with(model_id, dimension) {
            self.observer.report(ObservabilityEvent {
                article_id: article_id.to_string(),
                kind: EventKind::IndexInvalidated,
                error_kind: "model_changed",
                attempts: 0,
                detail: format!(
                    "index built with {} ({}), querying with {} ({})",
                    index.model_id, index.dimension, model_id, dimension
                ),
            });
            self.pipeline.submit(ArticleEvent::Changed(Article::new(
                article_id,
                index.source_text(),
                index.source_updated_at,
            )));
            return Ok(fixed_answer(NOT_INDEXED_MESSAGE));
        }

        let query = timeout(self.embed_timeout, self.query_embedder.embed(question))
            .await
            .map_err(|_| {
                RagError::EmbeddingUnavailable(format!(
                    "query embedding timed out after {:?}",
                    self.embed_timeout
                ))
            })??;

        let retrieved = rank(&index, &query, self.top_k)?;
        debug!(
            "Retrieved {} chunks from generation {} of article {}",
            retrieved.len(),
            index.generation,
            article_id
        );

        Ok(self.generator.answer(question, &retrieved, cancel))
    }

    fn report_failure(&self, article_id: &str, error: &RagError) {
        self.observer.report(ObservabilityEvent {
            article_id: article_id.to_string(),
            kind: EventKind::GenerationError,
            error_kind: error.kind(),
            attempts: 1,
            detail: error.to_string(),
        });
    }
}

/// Frames sent to a reader over a chat channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    ConnectionEstablished {
        message: String,
    },
    Token {
        text: String,
    },
    Done {
        answer: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        partial: Option<String>,
    },
}

/// A completed question and answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
}

/// One reader's conversation about one article.
///
/// Asking a new question supersedes the one in flight: its answer stream
/// stops at the next token and nothing more is sent for it.
pub struct ChatSession {
    engine: Arc<RagEngine>,
    article_id: ArticleId,
    current: watch::Sender<u64>,
    history: Mutex<Vec<ConversationTurn>>,
}

impl ChatSession {
    pub fn new(engine: Arc<RagEngine>, article_id: impl Into<ArticleId>) -> Self {
        let (current, _) = watch::channel(0);
        ChatSession {
            engine,
            article_id: article_id.into(),
            current,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn article_id(&self) -> &str {
        &self.article_id
    }

    pub fn greeting(&self) -> ChatEvent {
        ChatEvent::ConnectionEstablished {
            message: GREETING.to_string(),
        }
    }

    /// Abandon the question in flight, if any
    pub fn cancel(&self) {
        self.current.send_modify(|n| *n += 1);
    }

    /// Completed turns, oldest first. Failed and abandoned questions are not recorded.
    pub fn history(&self) -> Vec<ConversationTurn> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Answer `question`, sending frames to `events` until the answer is
    /// done, fails, or is superseded by a later question.
    pub async fn respond(&self, question: &str, events: &mpsc::Sender<ChatEvent>) {
        let mut ticket = 0;
        self.current.send_modify(|n| {
            *n += 1;
            ticket = *n;
        });
        let cancel = CancelSignal::new(self.current.subscribe(), ticket);

        let mut answer_stream = match self.engine.ask(&self.article_id, question, cancel.clone()).await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(e, &cancel, events).await;
                return;
            }
        };

        let mut answer = String::new();
        while let Some(item) = answer_stream.next().await {
            match item {
                Ok(text) => {
                    answer.push_str(&text);
                    if !self.send(&cancel, events, ChatEvent::Token { text }).await {
                        return;
                    }
                }
                Err(e) => {
                    self.fail(e, &cancel, events).await;
                    return;
                }
            }
        }

        if cancel.is_cancelled() {
            debug!("Question {} on {} superseded", ticket, self.article_id);
            return;
        }

        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ConversationTurn {
                question: question.trim().to_string(),
                answer: answer.clone(),
            });
        self.send(&cancel, events, ChatEvent::Done { answer }).await;
    }

    /// Deliver a frame unless the question was superseded; false once nothing more should be sent
    async fn send(
        &self,
        cancel: &CancelSignal,
        events: &mpsc::Sender<ChatEvent>,
        event: ChatEvent,
    ) -> bool {
        if cancel.is_cancelled() {
            debug!("Dropping frame for superseded question on {}", self.article_id);
            return false;
        }
        if events.send(event).await.is_err() {
            debug!("Chat channel for {} closed mid-answer", self.article_id);
            return false;
        }
        true
    }

    async fn fail(&self, error: RagError, cancel: &CancelSignal, events: &mpsc::Sender<ChatEvent>) {
        if cancel.is_cancelled() {
            debug!("Superseded question on {} failed: {}", self.article_id, error);
            return;
        }
        if !matches!(error, RagError::EmptyQuestion) {
            self.engine.report_failure(&self.article_id, &error);
        }
        let partial = error
            .partial_output()
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        self.send(
            cancel,
            events,
            ChatEvent::Error {
                message: error.user_message(),
                partial,
            },
        )
        .await;
    }
}

/// Run the interactive query loop for an article on stdin/stdout.
///
/// `exit` quits; Ctrl-C abandons the answer being streamed.
pub async fn run_query_loop(session: Arc<ChatSession>) -> Result<()> {
    info!(
        "Ready to answer questions about {}. Type 'exit' to quit.",
        session.article_id()
    );
    if let ChatEvent::ConnectionEstablished { message } = session.greeting() {
        println!("{}", message);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = io::stdout();

    loop {
        print!("\nYour question: ");
        stdout.flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let question = line.trim().to_string();
        if question.eq_ignore_ascii_case("exit") {
            info!("Goodbye!");
            break;
        }

        let (sender, mut receiver) = mpsc::channel(64);
        let responder = {
            let session = session.clone();
            tokio::spawn(async move { session.respond(&question, &sender).await })
        };

        loop {
            tokio::select! {
                event = receiver.recv() => match event {
                    Some(ChatEvent::Token { text }) => {
                        print!("{}", text);
                        stdout.flush()?;
                    }
                    Some(ChatEvent::Done { .. }) => println!(),
                    Some(ChatEvent::Error { message, .. }) => println!("\n{}", message),
                    Some(ChatEvent::ConnectionEstablished { message }) => println!("{}", message),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    session.cancel();
                    println!("\n(cancelled)");
                }
            }
        }

        if let Err(e) = responder.await {
            warn!("Answer task failed: {}", e);
        }
    }

    Ok(())
}
