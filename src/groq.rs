use crate::generation::{sse_data, LanguageModel, Prompt, TokenStream};
use anyhow::{Context, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::env;

const DEFAULT_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
const DEFAULT_MODEL: &str = "llama-3.1-8b-instant";
const DONE_MARKER: &str = "[DONE]";

/// Configuration for an OpenAI-compatible chat completion endpoint (Groq by default)
#[derive(Clone)]
pub struct GroqConfig {
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GroqConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("GROQ_API_KEY").context("GROQ_API_KEY not set")?;
        let api_url = env::var("GROQ_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let model = env::var("GROQ_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(GroqConfig {
            api_key,
            api_url,
            model,
            max_tokens: 500,
            temperature: 0.7,
        })
    }
}

/// Streaming chat client
#[derive(Clone)]
pub struct GroqClient {
    config: GroqConfig,
    client: reqwest::Client,
}

impl GroqClient {
    pub fn new(config: GroqConfig) -> Self {
        GroqClient {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn request<'a>(&'a self, prompt: &'a Prompt) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.config.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &prompt.instruction,
                },
                Message {
                    role: "user",
                    content: &prompt.text,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: true,
        }
    }
}

/// Parse one `data:` payload: `Ok(None)` on the terminal marker
fn parse_event(data: &str) -> Result<Option<Vec<String>>> {
    if data == DONE_MARKER {
        return Ok(None);
    }
    let chunk: ChatChunk = serde_json::from_str(data).context("Malformed chat stream event")?;
    if let Some(error) = chunk.error {
        return Err(anyhow::anyhow!("Chat completion error: {}", error.message));
    }
    Ok(Some(
        chunk
            .choices
            .into_iter()
            .filter_map(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .collect(),
    ))
}

#[async_trait]
impl LanguageModel for GroqClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<TokenStream> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&self.request(prompt))
            .send()
            .await
            .context("Chat completion request failed")?;

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

        Ok(Box::pin(stream! {
            let mut events = Box::pin(sse_data(response));
            while let Some(event) = events.next().await {
                let parsed = event.and_then(|data| parse_event(&data));
                match parsed {
                    Ok(None) => return,
                    Ok(Some(tokens)) => {
                        for token in tokens {
                            yield Ok(token);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            yield Err(anyhow::anyhow!("Chat stream ended without {}", DONE_MARKER));
        }))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize, Debug)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Debug, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_instruction_and_question() {
        let client = GroqClient::new(GroqConfig {
            api_key: "key".to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 500,
            temperature: 0.7,
        });
        let prompt = Prompt {
            instruction: "only the context".to_string(),
            text: "Question: why?".to_string(),
        };

        let request = serde_json::to_value(client.request(&prompt)).unwrap();
        assert_eq!(request["model"], DEFAULT_MODEL);
        assert_eq!(request["stream"], true);
        assert_eq!(request["messages"][0]["role"], "system");
        assert_eq!(request["messages"][0]["content"], "only the context");
        assert_eq!(request["messages"][1]["content"], "Question: why?");
    }

    #[test]
    fn test_parse_event() {
        let tokens = parse_event(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap();
        assert_eq!(tokens, Some(vec!["Hi".to_string()]));

        let role_only = parse_event(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert_eq!(role_only, Some(vec![]));

        assert_eq!(parse_event("[DONE]").unwrap(), None);
        assert!(parse_event(r#"{"error":{"message":"rate limited"}}"#).is_err());
        assert!(parse_event("not json").is_err());
    }
}
