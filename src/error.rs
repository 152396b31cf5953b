//! Error types shared by the retrieval pipeline.

use thiserror::Error;

/// Message shown to readers when a question could not be answered.
pub const TRY_AGAIN_MESSAGE: &str = "Sorry, I couldn't answer that right now. Please try again.";

/// Errors produced by chunking, embedding, storage, retrieval and generation.
#[derive(Debug, Clone, Error)]
pub enum RagError {
    /// Bad chunking or pipeline configuration; fatal at startup
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Embedding model could not be reached, loaded or timed out
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
    /// No index for the article. Callers of the store never see this; it is
    /// mapped to an empty index.
    #[error("No index for article {0}")]
    IndexNotFound(String),
    /// Embeddings of different dimensions were about to be compared
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// The language model failed mid-stream
    #[error("Generation failed: {message}")]
    GenerationFailure { partial: String, message: String },
    /// The language model did not produce the next token in time
    #[error("Generation timed out")]
    GenerationTimeout { partial: String },
    /// Language model call budget exhausted
    #[error("Too many questions, slow down")]
    RateLimited,
    /// Question was empty after trimming
    #[error("Question cannot be empty")]
    EmptyQuestion,
    /// Vector store backend failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl RagError {
    /// Whether the ingestion pipeline should retry the failed step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RagError::EmbeddingUnavailable(_) | RagError::Storage(_))
    }

    /// Text streamed before a generation error, if any.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            RagError::GenerationFailure { partial, .. } | RagError::GenerationTimeout { partial } => {
                Some(partial.as_str())
            }
            _ => None,
        }
    }

    /// Short machine-readable kind, used in observability events.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::InvalidConfiguration(_) => "invalid_configuration",
            RagError::EmbeddingUnavailable(_) => "embedding_unavailable",
            RagError::IndexNotFound(_) => "index_not_found",
            RagError::DimensionMismatch { .. } => "dimension_mismatch",
            RagError::GenerationFailure { .. } => "generation_failure",
            RagError::GenerationTimeout { .. } => "generation_timeout",
            RagError::RateLimited => "rate_limited",
            RagError::EmptyQuestion => "empty_question",
            RagError::Storage(_) => "storage",
        }
    }

    /// Reader-facing text for a failed question.
    pub fn user_message(&self) -> String {
        match self {
            RagError::EmptyQuestion => self.to_string(),
            _ => TRY_AGAIN_MESSAGE.to_string(),
        }
    }
}

pub type RagResult<T> = std::result::Result<T, RagError>;
