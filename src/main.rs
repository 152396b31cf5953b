use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use log::{error, info};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use post_chat::config::{EmbeddingProvider, LlmProvider, RagConfig};
use post_chat::database::{MemoryVectorStore, QdrantConfig, QdrantVectorStore, VectorStore};
use post_chat::document::{now_millis, Document};
use post_chat::embeddings::{Embedder, HashingEmbedder};
use post_chat::gemini::{GeminiClient, GeminiConfig};
use post_chat::generation::LanguageModel;
use post_chat::groq::{GroqClient, GroqConfig};
use post_chat::ingestion::ArticleEvent;
use post_chat::observability::LogObserver;
use post_chat::rag::{run_query_loop, ChatSession, RagEngine};

/// Chat with a blog article: retrieval-augmented answers grounded in one article's text
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the article to import (supports text, HTML and PDF)
    #[arg(index = 1)]
    file_path: String,

    /// Article id; defaults to the file name
    #[arg(long)]
    article_id: Option<String>,

    /// Re-ingest even if the article is already indexed
    #[arg(long)]
    reindex: bool,

    /// Remove the article's index and exit
    #[arg(long)]
    delete: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    // Parse and validate command line arguments
    let args = Args::parse();
    let file_path = args.file_path;

    info!("Processing file: {}", file_path);

    // Validate input file exists
    let path = Path::new(&file_path);
    if !path.exists() {
        error!("File not found: {}", file_path);
        return Err(anyhow::anyhow!("File not found"));
    }

    // Load configuration from environment
    let config = RagConfig::from_env().context("Invalid pipeline configuration")?;

    let store: Arc<dyn VectorStore> = if env::var("QDRANT_URL").is_ok() {
        let qdrant_config = QdrantConfig::from_env().context("Missing QDRANT_URL")?;
        info!("Using Qdrant at {}", qdrant_config.url);
        Arc::new(
            QdrantVectorStore::new(qdrant_config)
                .await
                .context("Failed to initialize Qdrant client")?,
        )
    } else {
        info!("QDRANT_URL not set, keeping vectors in memory");
        Arc::new(MemoryVectorStore::new())
    };

    let gemini = match (config.embedding_provider, config.llm_provider) {
        (EmbeddingProvider::Local, LlmProvider::Groq) => None,
        _ => Some(GeminiClient::new(
            GeminiConfig::from_env().context("Missing GEMINI_API_KEY")?,
            config.embedding_dim,
        )),
    };

    let embedder: Arc<dyn Embedder> = match (&config.embedding_provider, &gemini) {
        (EmbeddingProvider::Gemini, Some(gemini)) => Arc::new(gemini.clone()),
        _ => Arc::new(HashingEmbedder::new(config.embedding_dim)),
    };
    let model: Arc<dyn LanguageModel> = match (&config.llm_provider, gemini) {
        (LlmProvider::Gemini, Some(gemini)) => Arc::new(gemini),
        _ => Arc::new(GroqClient::new(
            GroqConfig::from_env().context("Missing GROQ_API_KEY")?,
        )),
    };
    info!(
        "Embedding with {}, answering with {}",
        embedder.model_id(),
        model.name()
    );

    // Initialize RAG engine
    let rag_engine = Arc::new(RagEngine::new(
        store.clone(),
        embedder,
        model,
        Arc::new(LogObserver),
        &config,
    ));

    // Process the document (text, HTML or PDF)
    let document = Document::from_file(path).context("Failed to process document")?;
    info!("Document type: {}", document.mime_type);

    let updated_at = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(now_millis);
    let article = document.into_article(args.article_id, updated_at);
    let article_id = article.id.clone();

    if args.delete {
        rag_engine.submit(ArticleEvent::Deleted(article_id.clone()));
        rag_engine.pipeline().wait_idle().await;
        info!("Deleted index for {}", article_id);
        return Ok(());
    }

    // Only ingest if the article has no index yet
    let existing = store.get_index(&article_id).await?;
    if existing.is_empty() || args.reindex {
        info!("Indexing article {}...", article_id);
        rag_engine.submit(ArticleEvent::Changed(article));
        rag_engine.pipeline().wait_idle().await;
    } else {
        info!(
            "Using existing index for {} (generation {}, {} chunks)",
            article_id,
            existing.generation,
            existing.len()
        );
    }

    // Enter interactive Q&A loop
    let session = Arc::new(ChatSession::new(rag_engine, article_id));
    run_query_loop(session)
        .await
        .context("Error in query loop")?;

    Ok(())
}
