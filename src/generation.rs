use crate::error::RagError;
use crate::retriever::RetrievalResult;
use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::debug;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant};

/// Fixed instruction sent with every grounded question
pub const ANSWER_INSTRUCTION: &str = "You answer questions about a blog article using only the \
provided context from that article. If the context does not contain the answer, say that the \
article does not cover it. Do not use outside knowledge.";

/// Deterministic reply when the article has nothing indexed
pub const NOT_INDEXED_MESSAGE: &str =
    "This article hasn't been indexed yet, so there is not enough context to answer. Please try again shortly.";

/// Raw tokens from a language model, in order; ends after the model's terminal marker
pub type TokenStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// Answer tokens as delivered to the reader
pub type AnswerStream = Pin<Box<dyn Stream<Item = Result<String, RagError>> + Send>>;

/// A single grounded prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// System-level instruction
    pub instruction: String,
    /// Retrieved context followed by the verbatim question
    pub text: String,
}

/// Language-model collaborator: one call per question, tokens streamed back.
///
/// Dropping the returned stream abandons the generation; implementations
/// must release the underlying request when that happens.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &Prompt) -> anyhow::Result<TokenStream>;
}

/// Assemble the instruction, ranked chunk texts and question into one prompt
pub fn build_prompt(question: &str, retrieved: &RetrievalResult) -> Prompt {
    let mut text = String::from("Context from the article:\n");
    for (rank, scored) in retrieved.chunks.iter().enumerate() {
        text.push_str(&format!("\n[{}] {}\n", rank + 1, scored.chunk.text));
    }
    text.push_str(&format!("\nQuestion: {}\nAnswer:", question));

    Prompt {
        instruction: ANSWER_INSTRUCTION.to_string(),
        text,
    }
}

/// Fires when the question it was issued for is superseded or its channel closes
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<u64>,
    ticket: u64,
    _sender: Option<Arc<watch::Sender<u64>>>,
}

impl CancelSignal {
    /// A signal for a question identified by `ticket` on a channel whose
    /// current question number is published through `receiver`
    pub fn new(receiver: watch::Receiver<u64>, ticket: u64) -> Self {
        CancelSignal {
            receiver,
            ticket,
            _sender: None,
        }
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (sender, receiver) = watch::channel(0);
        CancelSignal {
            receiver,
            ticket: 0,
            _sender: Some(Arc::new(sender)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow() != self.ticket || self.receiver.has_changed().is_err()
    }

    /// Resolves once the question is superseded or the channel is gone
    pub async fn cancelled(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() != self.ticket {
                return;
            }
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Token bucket bounding how often the language model is called
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `None` when `max_per_minute` is zero (unlimited)
    pub fn per_minute(max_per_minute: u32) -> Option<Self> {
        if max_per_minute == 0 {
            return None;
        }
        let capacity = max_per_minute as f64;
        Some(Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill_per_sec: max_per_minute as f64 / 60.0,
        })
    }

    pub async fn acquire(&self) -> bool {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
        guard.last_refill = now;
        guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if guard.tokens >= 1.0 {
            guard.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Stream holding a single fixed reply
pub fn fixed_answer(text: impl Into<String>) -> AnswerStream {
    let text = text.into();
    Box::pin(futures::stream::once(async move { Ok(text) }))
}

/// Turns retrieved chunks and a question into a streamed, grounded answer
#[derive(Clone)]
pub struct AnswerGenerator {
    model: Arc<dyn LanguageModel>,
    token_timeout: Duration,
    limiter: Option<RateLimiter>,
}

impl AnswerGenerator {
    /// `token_timeout` bounds the wait for the first token and between tokens
    pub fn new(model: Arc<dyn LanguageModel>, token_timeout: Duration) -> Self {
        AnswerGenerator {
            model,
            token_timeout,
            limiter: None,
        }
    }

    pub fn with_rate_limit(mut self, calls_per_minute: u32) -> Self {
        self.limiter = RateLimiter::per_minute(calls_per_minute);
        self
    }

    /// Stream the answer to `question`.
    ///
    /// An empty retrieval short-circuits to [`NOT_INDEXED_MESSAGE`] without
    /// calling the model. The model is called once and never retried; a
    /// failure mid-stream ends the stream with an error carrying everything
    /// produced so far. When `cancel` fires the stream simply ends.
    pub fn answer(
        &self,
        question: &str,
        retrieved: &RetrievalResult,
        mut cancel: CancelSignal,
    ) -> AnswerStream {
        if retrieved.is_empty() {
            debug!("No context for article {}, skipping model call", retrieved.article_id);
            return fixed_answer(NOT_INDEXED_MESSAGE);
        }

        let prompt = build_prompt(question, retrieved);
        let model = self.model.clone();
        let limiter = self.limiter.clone();
        let token_timeout = self.token_timeout;

        Box::pin(stream! {
            if let Some(limiter) = &limiter {
                if !limiter.acquire().await {
                    yield Err(RagError::RateLimited);
                    return;
                }
            }

            let started = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                started = timeout(token_timeout, model.generate(&prompt)) => Some(started),
            };
            let mut tokens = match started {
                None => {
                    debug!("Question superseded before {} responded", model.name());
                    return;
                }
                Some(Ok(Ok(tokens))) => tokens,
                Some(Ok(Err(e))) => {
                    yield Err(RagError::GenerationFailure {
                        partial: String::new(),
                        message: format!("{:#}", e),
                    });
                    return;
                }
                Some(Err(_)) => {
                    yield Err(RagError::GenerationTimeout {
                        partial: String::new(),
                    });
                    return;
                }
            };

            let mut produced = String::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = timeout(token_timeout, tokens.next()) => Some(next),
                };
                match next {
                    None => {
                        debug!("Question superseded after {} chars, abandoning", produced.len());
                        return;
                    }
                    Some(Err(_)) => {
                        yield Err(RagError::GenerationTimeout { partial: produced });
                        return;
                    }
                    Some(Ok(None)) => break,
                    Some(Ok(Some(Ok(token)))) => {
                        produced.push_str(&token);
                        yield Ok(token);
                    }
                    Some(Ok(Some(Err(e)))) => {
                        yield Err(RagError::GenerationFailure {
                            partial: produced,
                            message: format!("{:#}", e),
                        });
                        return;
                    }
                }
            }
        })
    }
}

/// Yield the payload of every `data:` line of a server-sent event stream
pub(crate) fn sse_data(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<String>> + Send {
    stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(anyhow::Error::new(e).context("Response stream interrupted"));
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(line_end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=line_end).collect();
                if let Some(data) = data_payload(&line) {
                    yield Ok(data);
                }
            }
        }

        if let Some(data) = data_payload(&buffer) {
            yield Ok(data);
        }
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    line.trim()
        .strip_prefix("data:")
        .map(|data| data.trim().to_string())
        .filter(|data| !data.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chunking::Chunk;
    use crate::retriever::ScoredChunk;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted model: emits `tokens`, then optionally fails
    pub(crate) struct ScriptedModel {
        pub tokens: Vec<&'static str>,
        pub fail_after: bool,
        pub token_delay: Duration,
        pub calls: AtomicUsize,
        pub last_prompt: std::sync::Mutex<Option<Prompt>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(tokens: Vec<&'static str>) -> Self {
            ScriptedModel {
                tokens,
                fail_after: false,
                token_delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                last_prompt: std::sync::Mutex::new(None),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, prompt: &Prompt) -> anyhow::Result<TokenStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = Some(prompt.clone());

            let delay = self.token_delay;
            let mut items: Vec<anyhow::Result<String>> =
                self.tokens.iter().map(|t| Ok(t.to_string())).collect();
            if self.fail_after {
                items.push(Err(anyhow::anyhow!("connection reset by peer")));
            }

            Ok(Box::pin(stream::iter(items).then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })))
        }
    }

    pub(crate) fn retrieved(texts: &[&str]) -> RetrievalResult {
        RetrievalResult {
            article_id: "post".to_string(),
            chunks: texts
                .iter()
                .enumerate()
                .map(|(i, text)| ScoredChunk {
                    chunk: Chunk {
                        index: i,
                        text: text.to_string(),
                        start_char: 0,
                        end_char: text.chars().count(),
                    },
                    score: 1.0 - i as f32 * 0.1,
                })
                .collect(),
        }
    }

    async fn collect(stream: AnswerStream) -> Vec<Result<String, RagError>> {
        stream.collect().await
    }

    #[test]
    fn test_prompt_keeps_rank_order_and_question() {
        let prompt = build_prompt(
            "What is pinning?",
            &retrieved(&["Pinning fixes a value in memory.", "Futures may be self-referential."]),
        );

        assert_eq!(prompt.instruction, ANSWER_INSTRUCTION);
        let first = prompt.text.find("[1] Pinning fixes").unwrap();
        let second = prompt.text.find("[2] Futures may").unwrap();
        assert!(first < second);
        assert!(prompt.text.ends_with("Question: What is pinning?\nAnswer:"));
    }

    #[tokio::test]
    async fn test_empty_retrieval_skips_model() {
        let model = Arc::new(ScriptedModel::new(vec!["unused"]));
        let generator = AnswerGenerator::new(model.clone(), Duration::from_secs(5));

        let answer = collect(generator.answer(
            "anything?",
            &RetrievalResult::empty("post"),
            CancelSignal::never(),
        ))
        .await;

        assert_eq!(answer.len(), 1);
        assert_eq!(answer[0].as_ref().unwrap(), NOT_INDEXED_MESSAGE);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_tokens_stream_in_order() {
        let model = Arc::new(ScriptedModel::new(vec!["Pinning ", "prevents ", "moves."]));
        let generator = AnswerGenerator::new(model.clone(), Duration::from_secs(5));

        let answer = collect(generator.answer(
            "What does pinning do?",
            &retrieved(&["Pinning prevents a value from moving."]),
            CancelSignal::never(),
        ))
        .await;

        let tokens: Vec<String> = answer.into_iter().map(|t| t.unwrap()).collect();
        assert_eq!(tokens, vec!["Pinning ", "prevents ", "moves."]);
        assert_eq!(model.calls(), 1);
        let prompt = model.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.text.contains("What does pinning do?"));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_keeps_partial_output() {
        let mut model = ScriptedModel::new(vec!["The article ", "says "]);
        model.fail_after = true;
        let model = Arc::new(model);
        let generator = AnswerGenerator::new(model.clone(), Duration::from_secs(5));

        let answer = collect(generator.answer(
            "question",
            &retrieved(&["context"]),
            CancelSignal::never(),
        ))
        .await;

        assert_eq!(answer.len(), 3);
        match &answer[2] {
            Err(RagError::GenerationFailure { partial, message }) => {
                assert_eq!(partial, "The article says ");
                assert!(message.contains("connection reset"));
            }
            other => panic!("expected generation failure, got {:?}", other),
        }
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_token_times_out() {
        let mut model = ScriptedModel::new(vec!["first", "second"]);
        model.token_delay = Duration::from_secs(10);
        let generator = AnswerGenerator::new(Arc::new(model), Duration::from_secs(2));

        let answer = collect(generator.answer(
            "question",
            &retrieved(&["context"]),
            CancelSignal::never(),
        ))
        .await;

        assert_eq!(answer.len(), 1);
        assert!(matches!(
            &answer[0],
            Err(RagError::GenerationTimeout { partial }) if partial.is_empty()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_question_stops_streaming() {
        let mut model = ScriptedModel::new(vec!["one ", "two ", "three "]);
        model.token_delay = Duration::from_millis(100);
        let generator = AnswerGenerator::new(Arc::new(model), Duration::from_secs(5));

        let (sender, receiver) = watch::channel(1u64);
        let mut answer = generator.answer(
            "question",
            &retrieved(&["context"]),
            CancelSignal::new(receiver, 1),
        );

        assert_eq!(answer.next().await.unwrap().unwrap(), "one ");
        sender.send_replace(2);
        assert!(answer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_excess_questions() {
        let model = Arc::new(ScriptedModel::new(vec!["ok"]));
        let generator =
            AnswerGenerator::new(model.clone(), Duration::from_secs(5)).with_rate_limit(1);
        let context = retrieved(&["context"]);

        let first = collect(generator.answer("q1", &context, CancelSignal::never())).await;
        let second = collect(generator.answer("q2", &context, CancelSignal::never())).await;

        assert!(first[0].is_ok());
        assert!(matches!(second[0], Err(RagError::RateLimited)));
        assert_eq!(model.calls(), 1);
    }

    #[test]
    fn test_cancel_signal_states() {
        let (sender, receiver) = watch::channel(3u64);
        let signal = CancelSignal::new(receiver, 3);
        assert!(!signal.is_cancelled());
        sender.send_replace(4);
        assert!(signal.is_cancelled());

        let (sender, receiver) = watch::channel(1u64);
        let signal = CancelSignal::new(receiver, 1);
        drop(sender);
        assert!(signal.is_cancelled());

        assert!(!CancelSignal::never().is_cancelled());
    }

    #[test]
    fn test_data_payload() {
        assert_eq!(data_payload(b"data: {\"a\":1}\n"), Some("{\"a\":1}".to_string()));
        assert_eq!(data_payload(b"data: [DONE]\r\n"), Some("[DONE]".to_string()));
        assert_eq!(data_payload(b": keep-alive\n"), None);
        assert_eq!(data_payload(b"\n"), None);
    }
}
