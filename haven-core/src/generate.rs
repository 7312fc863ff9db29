//! Generation invoker — wraps one call to a generative backend.
//!
//! Defines the `LlmProvider` trait for model-agnostic generation with both
//! blocking and streaming variants, a mock provider for tests and offline
//! mode, and the invoker that turns backend failures into the configured
//! apology reply instead of pipeline errors.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::LlmError;

/// A request to the generation backend.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System/persona preamble.
    pub system: String,
    /// Full user-turn prompt (context + question).
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
}

/// The result of a blocking completion.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
}

/// A stream event received during response streaming.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The next chunk of generated text.
    Token(String),
    /// Generation finished normally.
    Done,
    /// Generation failed mid-stream.
    Error(String),
}

/// Trait for generation providers, supporting both full and streaming
/// completions.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Perform a streaming completion, sending events to the channel.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// Tracks delivered reply text and yields only the new suffix of each
/// successive snapshot.
///
/// Callers see strictly increasing prefixes: the delta is the text past the
/// longest common prefix of the previous and current snapshots, so no
/// character is ever re-sent. If a backend rewinds its output (the snapshot
/// stops being an extension of what was delivered), the tracker re-syncs
/// from the common prefix rather than repeating delivered text.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    delivered: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to a new full-text snapshot, returning the undelivered
    /// suffix, or `None` when there is nothing new.
    pub fn advance(&mut self, full_text: &str) -> Option<String> {
        let common = longest_common_prefix_len(&self.delivered, full_text);
        if common >= full_text.len() {
            return None;
        }
        let delta = full_text[common..].to_string();
        self.delivered = full_text.to_string();
        Some(delta)
    }

    pub fn delivered(&self) -> &str {
        &self.delivered
    }
}

/// Byte length of the longest common prefix, backed off to a char boundary.
fn longest_common_prefix_len(a: &str, b: &str) -> usize {
    let mut len = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .take_while(|(x, y)| x == y)
        .count();
    while len > 0 && !b.is_char_boundary(len) {
        len -= 1;
    }
    len
}

/// Outcome of one generation attempt: the reply text that will be used
/// (generated or fallback) and the recoverable error, if any.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub reply: String,
    pub error: Option<String>,
}

/// Wraps an [`LlmProvider`] with timeout enforcement and failure fallback.
///
/// Generation failure is recoverable, never fatal: on any backend error the
/// invoker substitutes the configured apology reply (which carries a crisis
/// resource pointer) and records the error for the response object.
pub struct GenerationInvoker {
    provider: Arc<dyn LlmProvider>,
    config: LlmConfig,
}

impl GenerationInvoker {
    pub fn new(provider: Arc<dyn LlmProvider>, config: LlmConfig) -> Self {
        Self { provider, config }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    fn request(&self, prompt: &str) -> CompletionRequest {
        CompletionRequest {
            system: self.config.persona.clone(),
            prompt: prompt.to_string(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }

    /// Invoke the backend once, blocking until the full reply is available.
    pub async fn invoke(&self, prompt: &str) -> GenerationOutcome {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let result = tokio::time::timeout(timeout, self.provider.complete(self.request(prompt))).await;

        match result {
            Ok(Ok(response)) => {
                debug!(
                    model = %response.model,
                    chars = response.text.len(),
                    "Generation complete"
                );
                GenerationOutcome {
                    reply: response.text,
                    error: None,
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Generation backend failed, substituting fallback reply");
                GenerationOutcome {
                    reply: self.config.fallback_reply.clone(),
                    error: Some(e.to_string()),
                }
            }
            Err(_) => {
                let e = LlmError::Timeout {
                    timeout_secs: self.config.timeout_secs,
                };
                warn!(error = %e, "Generation backend timed out, substituting fallback reply");
                GenerationOutcome {
                    reply: self.config.fallback_reply.clone(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Invoke the backend with streaming delivery.
    ///
    /// Reply fragments are forwarded to `deltas` as strictly increasing
    /// suffix deltas. On cancellation the invoker stops forwarding
    /// immediately, aborts the provider task, and returns what was
    /// accumulated. On backend failure mid-stream the fallback reply
    /// replaces the partial text, so blocking and streaming callers observe
    /// the same degraded reply.
    pub async fn invoke_streaming(
        &self,
        prompt: &str,
        deltas: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> GenerationOutcome {
        let (event_tx, mut event_rx) = mpsc::channel::<StreamEvent>(64);
        let provider = Arc::clone(&self.provider);
        let request = self.request(prompt);

        // The provider task owns the backend call so that cancellation can
        // stop delivery without waiting for the backend to notice.
        let task = tokio::spawn(async move {
            if let Err(e) = provider.complete_streaming(request, event_tx.clone()).await {
                let _ = event_tx.send(StreamEvent::Error(e.to_string())).await;
            }
        });

        let timeout = tokio::time::sleep(Duration::from_secs(self.config.timeout_secs));
        tokio::pin!(timeout);

        let mut tracker = DeltaTracker::new();
        let mut full_text = String::new();
        let mut stream_error: Option<String> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Streaming consumer cancelled, stopping delivery");
                    task.abort();
                    break;
                }
                _ = &mut timeout => {
                    let e = LlmError::Timeout { timeout_secs: self.config.timeout_secs };
                    warn!(error = %e, "Streaming generation timed out");
                    stream_error = Some(e.to_string());
                    task.abort();
                    break;
                }
                event = event_rx.recv() => {
                    match event {
                        Some(StreamEvent::Token(token)) => {
                            full_text.push_str(&token);
                            if let Some(delta) = tracker.advance(&full_text)
                                && deltas.send(delta).await.is_err()
                            {
                                // Receiver hung up: same as cancellation.
                                task.abort();
                                break;
                            }
                        }
                        Some(StreamEvent::Done) | None => break,
                        Some(StreamEvent::Error(message)) => {
                            warn!(error = %message, "Generation backend failed mid-stream");
                            stream_error = Some(message);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(error) = stream_error {
            // Degrade exactly like the blocking path; deliver the fallback
            // to streaming consumers that have seen nothing yet.
            if tracker.delivered().is_empty() {
                let _ = deltas.send(self.config.fallback_reply.clone()).await;
            }
            return GenerationOutcome {
                reply: self.config.fallback_reply.clone(),
                error: Some(error),
            };
        }

        GenerationOutcome {
            reply: full_text,
            error: None,
        }
    }
}

/// A mock generation provider for testing and offline mode.
pub struct MockLlmProvider {
    model: String,
    responses: std::sync::Mutex<Vec<Result<String, LlmError>>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            responses: std::sync::Mutex::new(Vec::new()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Create a provider that always returns the given text.
    pub fn with_response(text: &str) -> Self {
        let provider = Self::new();
        for _ in 0..20 {
            provider.queue(Ok(text.to_string()));
        }
        provider
    }

    /// Create a provider whose every call fails with a connection error.
    pub fn always_failing() -> Self {
        let provider = Self::new();
        for _ in 0..20 {
            provider.queue(Err(LlmError::Connection {
                message: "backend unavailable".into(),
            }));
        }
        provider
    }

    /// Queue the outcome of the next call.
    pub fn queue(&self, outcome: Result<String, LlmError>) {
        self.responses.lock().unwrap().push(outcome);
    }

    /// Number of times the backend was invoked (either variant).
    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn next_response(&self) -> Result<String, LlmError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("I'm a mock model with no queued responses.".to_string())
        } else {
            responses.remove(0)
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.next_response().map(|text| CompletionResponse {
            text,
            model: self.model.clone(),
        })
    }

    async fn complete_streaming(
        &self,
        _request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        match self.next_response() {
            Ok(text) => {
                let mut first = true;
                for word in text.split(' ') {
                    let token = if first {
                        first = false;
                        word.to_string()
                    } else {
                        format!(" {word}")
                    };
                    let _ = tx.send(StreamEvent::Token(token)).await;
                }
                let _ = tx.send(StreamEvent::Done).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn invoker(provider: MockLlmProvider) -> GenerationInvoker {
        GenerationInvoker::new(Arc::new(provider), LlmConfig::default())
    }

    #[tokio::test]
    async fn test_invoke_returns_backend_reply() {
        let outcome = invoker(MockLlmProvider::with_response("Take slow breaths."))
            .invoke("prompt")
            .await;
        assert_eq!(outcome.reply, "Take slow breaths.");
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_invoke_failure_substitutes_fallback() {
        let inv = invoker(MockLlmProvider::always_failing());
        let outcome = inv.invoke("prompt").await;
        assert_eq!(outcome.reply, LlmConfig::default().fallback_reply);
        assert!(outcome.error.as_deref().unwrap().contains("backend unavailable"));
        // The fallback carries a crisis resource pointer.
        assert!(outcome.reply.contains("988"));
    }

    #[tokio::test]
    async fn test_streaming_deltas_concatenate_to_reply() {
        let inv = invoker(MockLlmProvider::with_response(
            "Deep breathing can calm your body quickly.",
        ));
        let (tx, mut rx) = mpsc::channel(64);
        let outcome = inv
            .invoke_streaming("prompt", tx, CancellationToken::new())
            .await;

        let mut collected = String::new();
        while let Ok(delta) = rx.try_recv() {
            collected.push_str(&delta);
        }
        assert_eq!(collected, outcome.reply);
        assert_eq!(outcome.reply, "Deep breathing can calm your body quickly.");
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_streaming_failure_delivers_fallback() {
        let inv = invoker(MockLlmProvider::always_failing());
        let (tx, mut rx) = mpsc::channel(64);
        let outcome = inv
            .invoke_streaming("prompt", tx, CancellationToken::new())
            .await;

        assert_eq!(outcome.reply, LlmConfig::default().fallback_reply);
        assert!(outcome.error.is_some());
        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered, LlmConfig::default().fallback_reply);
    }

    #[tokio::test]
    async fn test_streaming_cancellation_stops_delivery() {
        let inv = invoker(MockLlmProvider::with_response("one two three four"));
        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = inv.invoke_streaming("prompt", tx, cancel).await;
        // Cancelled before any event was consumed.
        assert!(outcome.error.is_none());
        assert!(outcome.reply.is_empty());
    }

    #[test]
    fn test_delta_tracker_strictly_increasing() {
        let mut tracker = DeltaTracker::new();
        assert_eq!(tracker.advance("Hel").as_deref(), Some("Hel"));
        assert_eq!(tracker.advance("Hello").as_deref(), Some("lo"));
        assert_eq!(tracker.advance("Hello"), None);
        assert_eq!(tracker.advance("Hello world").as_deref(), Some(" world"));
    }

    #[test]
    fn test_delta_tracker_resync_on_rewind() {
        let mut tracker = DeltaTracker::new();
        tracker.advance("Hello wor");
        // Snapshot no longer extends delivered text: re-sync from the
        // common prefix without repeating it.
        assert_eq!(tracker.advance("Hello WORLD").as_deref(), Some("WORLD"));
    }

    #[test]
    fn test_delta_tracker_multibyte_boundary() {
        let mut tracker = DeltaTracker::new();
        tracker.advance("caf");
        assert_eq!(tracker.advance("café").as_deref(), Some("é"));
    }

    proptest! {
        #[test]
        fn prop_deltas_reconstruct_final_text(
            words in proptest::collection::vec("[a-zA-Z]{1,8}", 1..40)
        ) {
            // Build monotonically growing prefixes and check concatenated
            // deltas equal the final text.
            let full = words.join(" ");
            let mut tracker = DeltaTracker::new();
            let mut collected = String::new();
            let mut snapshot = String::new();
            for word in &words {
                if !snapshot.is_empty() {
                    snapshot.push(' ');
                }
                snapshot.push_str(word);
                if let Some(delta) = tracker.advance(&snapshot) {
                    collected.push_str(&delta);
                }
            }
            prop_assert_eq!(collected, full);
        }
    }
}
