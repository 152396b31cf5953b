use crate::embeddings::{check_dimension, Embedder, Embedding};
use crate::error::RagError;
use crate::generation::{sse_data, LanguageModel, Prompt, TokenStream};
use anyhow::{Context, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::env;

const DEFAULT_EMBEDDING_MODEL: &str = "models/text-embedding-004";
const DEFAULT_GENERATION_MODEL: &str = "models/gemini-2.0-flash";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
/// Most requests `batchEmbedContents` accepts at once
const BATCH_LIMIT: usize = 100;

/// Configuration for Gemini API
#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub embedding_model: String,
    pub generation_model: String,
    pub embeddings_url: String,
    pub batch_embeddings_url: String,
    pub stream_url: String,
}

impl GeminiConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY").context("GEMINI_API_KEY not set")?;
        let embedding_model = env::var("GEMINI_EMBEDDING_MODEL")
            .unwrap_or_else(|_| DEFAULT_EMBEDDING_MODEL.to_string());
        let generation_model = env::var("GEMINI_GENERATION_MODEL")
            .unwrap_or_else(|_| DEFAULT_GENERATION_MODEL.to_string());

        // Default URLs if not specified
        let embeddings_url = env::var("GEMINI_EMBEDDINGS_URL").unwrap_or_else(|_| {
            format!("{}/{}:embedContent", DEFAULT_BASE_URL, embedding_model)
        });
        let batch_embeddings_url = env::var("GEMINI_BATCH_EMBEDDINGS_URL").unwrap_or_else(|_| {
            format!("{}/{}:batchEmbedContents", DEFAULT_BASE_URL, embedding_model)
        });
        let stream_url = env::var("GEMINI_STREAM_URL").unwrap_or_else(|_| {
            format!("{}/{}:streamGenerateContent", DEFAULT_BASE_URL, generation_model)
        });

        Ok(GeminiConfig {
            api_key,
            embedding_model,
            generation_model,
            embeddings_url,
            batch_embeddings_url,
            stream_url,
        })
    }
}

/// Client for interacting with Gemini API
#[derive(Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
    dimension: usize,
    model_id: String,
}

impl GeminiClient {
    /// Create a new Gemini client producing `dimension`-sized embeddings
    pub fn new(config: GeminiConfig, dimension: usize) -> Self {
        let client = reqwest::Client::new();
        let model_id = format!("gemini:{}:{}", config.embedding_model, dimension);
        GeminiClient {
            config,
            client,
            dimension,
            model_id,
        }
    }

    /// Get the client configuration
    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(body)
            .send()
            .await
            .context("Gemini request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!(
                "API request failed: {} {}",
                status,
                error_text
            ));
        }
        Ok(response)
    }

    /// Generate embeddings for a text
    pub async fn get_embedding(&self, text: &str) -> Result<Embedding> {
        let request = self.embedding_request(text);
        let response = self.post(&self.config.embeddings_url, &request).await?;
        let response_data: EmbeddingResponse = response.json().await?;

        Ok(Embedding::new(response_data.embedding.values))
    }

    /// Generate embeddings for many texts, preserving order.
    ///
    /// Texts are sent in batches of at most [`BATCH_LIMIT`].
    pub async fn get_embeddings(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut embeddings = Vec::with_capacity(texts.len());

        for request in self.batch_requests(texts) {
            let expected = request.requests.len();
            let response = self.post(&self.config.batch_embeddings_url, &request).await?;
            let response_data: BatchEmbeddingResponse = response.json().await?;

            if response_data.embeddings.len() != expected {
                return Err(anyhow::anyhow!(
                    "Expected {} embeddings, got {}",
                    expected,
                    response_data.embeddings.len()
                ));
            }
            embeddings.extend(
                response_data
                    .embeddings
                    .into_iter()
                    .map(|e| Embedding::new(e.values)),
            );
        }

        Ok(embeddings)
    }

    fn batch_requests<'a>(&'a self, texts: &'a [String]) -> Vec<BatchEmbeddingRequest<'a>> {
        texts
            .chunks(BATCH_LIMIT)
            .map(|batch| BatchEmbeddingRequest {
                requests: batch.iter().map(|t| self.embedding_request(t)).collect(),
            })
            .collect()
    }

    fn embedding_request<'a>(&'a self, text: &'a str) -> EmbeddingRequest<'a> {
        EmbeddingRequest {
            model: &self.config.embedding_model,
            content: Content {
                parts: vec![Part { text }],
                role: None,
            },
            output_dimensionality: self.dimension,
        }
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding, RagError> {
        let embedding = self
            .get_embedding(text)
            .await
            .map_err(|e| RagError::EmbeddingUnavailable(format!("{:#}", e)))?;
        check_dimension(self.dimension, &embedding)?;
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self
            .get_embeddings(texts)
            .await
            .map_err(|e| RagError::EmbeddingUnavailable(format!("{:#}", e)))?;
        for embedding in &embeddings {
            check_dimension(self.dimension, embedding)?;
        }
        Ok(embeddings)
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    fn name(&self) -> &str {
        &self.config.generation_model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<TokenStream> {
        let request = GenerateRequest {
            system_instruction: Content {
                parts: vec![Part {
                    text: &prompt.instruction,
                }],
                role: None,
            },
            contents: vec![Content {
                parts: vec![Part { text: &prompt.text }],
                role: Some("user"),
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.8,
                top_k: 40,
                max_output_tokens: 1024,
            },
        };

        let url = format!("{}?alt=sse", self.config.stream_url);
        let response = self.post(&url, &request).await?;

        Ok(Box::pin(stream! {
            let mut events = Box::pin(sse_data(response));
            let mut finished = false;

            while let Some(event) = events.next().await {
                let data = match event {
                    Ok(data) => data,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let chunk: GenerateResponse = match serde_json::from_str(&data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(anyhow::Error::new(e).context("Malformed Gemini stream event"));
                        return;
                    }
                };
                if let Some(error) = chunk.error {
                    yield Err(anyhow::anyhow!("Gemini error: {}", error.message));
                    return;
                }
                for candidate in chunk.candidates {
                    for part in candidate.content.parts {
                        if !part.text.is_empty() {
                            yield Ok(part.text);
                        }
                    }
                    finished |= candidate.finish_reason.is_some();
                }
            }

            if !finished {
                yield Err(anyhow::anyhow!("Gemini stream ended before completion"));
            }
        }))
    }
}

// Shared request/response structures for the Gemini API

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbeddingRequest<'a> {
    model: &'a str,
    content: Content<'a>,
    output_dimensionality: usize,
}

#[derive(Serialize)]
struct BatchEmbeddingRequest<'a> {
    requests: Vec<EmbeddingRequest<'a>>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    embedding: EmbeddingData,
}

#[derive(Deserialize, Debug)]
struct BatchEmbeddingResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingData>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    values: Vec<f32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Deserialize, Debug, Default)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: ResponseContent,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GeminiConfig {
        GeminiConfig {
            api_key: "key".to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            generation_model: DEFAULT_GENERATION_MODEL.to_string(),
            embeddings_url: "http://localhost/embed".to_string(),
            batch_embeddings_url: "http://localhost/batch".to_string(),
            stream_url: "http://localhost/stream".to_string(),
        }
    }

    #[test]
    fn test_embedding_request_shape() {
        let client = GeminiClient::new(config(), 384);
        let request = serde_json::to_value(client.embedding_request("hello")).unwrap();

        assert_eq!(request["model"], DEFAULT_EMBEDDING_MODEL);
        assert_eq!(request["content"]["parts"][0]["text"], "hello");
        assert_eq!(request["outputDimensionality"], 384);
        assert!(request["content"].get("role").is_none());
    }

    #[test]
    fn test_large_batches_are_split_in_order() {
        let client = GeminiClient::new(config(), 384);
        let texts: Vec<String> = (0..250).map(|i| format!("chunk {}", i)).collect();

        let requests = client.batch_requests(&texts);
        let sizes: Vec<usize> = requests.iter().map(|r| r.requests.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);

        let sent: Vec<&str> = requests
            .iter()
            .flat_map(|r| r.requests.iter().map(|e| e.content.parts[0].text))
            .collect();
        let expected: Vec<&str> = texts.iter().map(|t| t.as_str()).collect();
        assert_eq!(sent, expected);

        assert!(client.batch_requests(&texts[..100]).len() == 1);
        assert!(client.batch_requests(&[]).is_empty());
    }

    #[test]
    fn test_model_id_tracks_model_and_dimension() {
        let small = GeminiClient::new(config(), 256);
        let large = GeminiClient::new(config(), 768);
        assert_ne!(Embedder::model_id(&small), Embedder::model_id(&large));
        assert_eq!(Embedder::dimension(&small), 256);
    }

    #[test]
    fn test_stream_event_parsing() {
        let event: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hello"}],"role":"model"}}]}"#,
        )
        .unwrap();
        assert_eq!(event.candidates[0].content.parts[0].text, "Hello");
        assert!(event.candidates[0].finish_reason.is_none());

        let last: GenerateResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"STOP"}]}"#).unwrap();
        assert!(last.candidates[0].content.parts.is_empty());
        assert_eq!(last.candidates[0].finish_reason.as_deref(), Some("STOP"));
    }
}
