use crate::error::RagError;
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Chunk size and overlap, in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub size: usize,
    pub overlap: usize,
}

impl ChunkingConfig {
    /// Build a validated chunking configuration.
    ///
    /// Takes signed values so that callers passing through user input get
    /// `InvalidConfiguration` instead of a wrap-around.
    pub fn new(size: i64, overlap: i64) -> Result<Self, RagError> {
        if size <= 0 {
            return Err(RagError::InvalidConfiguration(format!(
                "chunk size must be positive, got {}",
                size
            )));
        }
        if overlap < 0 {
            return Err(RagError::InvalidConfiguration(format!(
                "chunk overlap must not be negative, got {}",
                overlap
            )));
        }
        if overlap >= size {
            return Err(RagError::InvalidConfiguration(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                overlap, size
            )));
        }
        Ok(ChunkingConfig {
            size: size as usize,
            overlap: overlap as usize,
        })
    }

    /// Distance between the starts of two consecutive chunks
    pub fn step(&self) -> usize {
        self.size - self.overlap
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            size: 500,
            overlap: 50,
        }
    }
}

/// Bounded exponential backoff for ingestion retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based: the delay after the first failure is `attempt = 1`)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.min_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            min_backoff: Duration::from_secs(4),
            max_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    Local,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Gemini,
    Groq,
}

/// Pipeline-wide settings
#[derive(Debug, Clone)]
pub struct RagConfig {
    pub chunking: ChunkingConfig,
    pub top_k: usize,
    pub embedding_dim: usize,
    pub embed_timeout: Duration,
    pub generate_timeout: Duration,
    pub retry: RetryPolicy,
    pub debounce: Duration,
    pub max_concurrent_ingestions: usize,
    pub llm_calls_per_minute: u32,
    pub query_cache_size: usize,
    pub embedding_provider: EmbeddingProvider,
    pub llm_provider: LlmProvider,
}

impl Default for RagConfig {
    fn default() -> Self {
        RagConfig {
            chunking: ChunkingConfig::default(),
            top_k: 3,
            embedding_dim: 384,
            embed_timeout: Duration::from_secs(30),
            generate_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            debounce: Duration::from_millis(500),
            max_concurrent_ingestions: 4,
            llm_calls_per_minute: 20,
            query_cache_size: 128,
            embedding_provider: EmbeddingProvider::Local,
            llm_provider: LlmProvider::Gemini,
        }
    }
}

impl RagConfig {
    /// Create a new configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = RagConfig::default();

        let chunking = ChunkingConfig::new(
            env_or("RAG_CHUNK_SIZE", defaults.chunking.size as i64)?,
            env_or("RAG_CHUNK_OVERLAP", defaults.chunking.overlap as i64)?,
        )?;

        let embedding_provider = match env::var("EMBEDDING_PROVIDER")
            .unwrap_or_else(|_| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => EmbeddingProvider::Local,
            "gemini" => EmbeddingProvider::Gemini,
            other => {
                return Err(RagError::InvalidConfiguration(format!(
                    "unknown EMBEDDING_PROVIDER: {}",
                    other
                ))
                .into())
            }
        };

        let llm_provider = match env::var("LLM_PROVIDER")
            .unwrap_or_else(|_| "gemini".to_string())
            .to_lowercase()
            .as_str()
        {
            "gemini" => LlmProvider::Gemini,
            "groq" => LlmProvider::Groq,
            other => {
                return Err(RagError::InvalidConfiguration(format!(
                    "unknown LLM_PROVIDER: {}",
                    other
                ))
                .into())
            }
        };

        let config = RagConfig {
            chunking,
            top_k: env_or("RAG_TOP_K", defaults.top_k)?,
            embedding_dim: env_or("RAG_EMBEDDING_DIM", defaults.embedding_dim)?,
            embed_timeout: Duration::from_secs(env_or("RAG_EMBED_TIMEOUT_SECS", 30)?),
            generate_timeout: Duration::from_secs(env_or("RAG_GENERATE_TIMEOUT_SECS", 30)?),
            retry: RetryPolicy {
                max_attempts: env_or("RAG_INGEST_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
                min_backoff: Duration::from_millis(env_or("RAG_RETRY_MIN_MS", 4000)?),
                max_backoff: Duration::from_millis(env_or("RAG_RETRY_MAX_MS", 10000)?),
            },
            debounce: Duration::from_millis(env_or("RAG_DEBOUNCE_MS", 500)?),
            max_concurrent_ingestions: env_or(
                "RAG_MAX_CONCURRENT_INGESTIONS",
                defaults.max_concurrent_ingestions,
            )?,
            llm_calls_per_minute: env_or(
                "RAG_LLM_CALLS_PER_MINUTE",
                defaults.llm_calls_per_minute,
            )?,
            query_cache_size: env_or("RAG_QUERY_CACHE_SIZE", defaults.query_cache_size)?,
            embedding_provider,
            llm_provider,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), RagError> {
        ChunkingConfig::new(self.chunking.size as i64, self.chunking.overlap as i64)?;
        if self.top_k == 0 {
            return Err(RagError::InvalidConfiguration(
                "top_k must be at least 1".to_string(),
            ));
        }
        if self.embedding_dim == 0 {
            return Err(RagError::InvalidConfiguration(
                "embedding dimension must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RagError::InvalidConfiguration(
                "ingestion needs at least one attempt".to_string(),
            ));
        }
        if self.max_concurrent_ingestions == 0 {
            return Err(RagError::InvalidConfiguration(
                "at least one ingestion worker is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read and parse an environment variable, using `default` when unset
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid value for {}: {}", key, raw)),
        Err(_) => Ok(default),
    }
}
