//! OpenAI-compatible generation provider.
//!
//! Supports OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio, and any endpoint
//! that follows the OpenAI chat completions API format, with SSE streaming.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::generate::{CompletionRequest, CompletionResponse, LlmProvider, StreamEvent};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible generation provider.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleProvider {
    /// Create a new provider from configuration.
    ///
    /// Reads the API key from the environment variable named in
    /// `config.api_key_env`. Local endpoints (localhost) do not require a
    /// key and fall back to a placeholder.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let is_local = base_url.contains("localhost") || base_url.contains("127.0.0.1");

        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) => key,
            Err(_) if is_local => "unused".to_string(),
            Err(_) => {
                return Err(LlmError::AuthFailed {
                    provider: format!("env var '{}' not set", config.api_key_env),
                });
            }
        };

        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "temperature": request.temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    /// Parse a single SSE data line. Returns the parsed JSON if valid.
    fn parse_sse_line(line: &str) -> Option<Value> {
        let data = line.strip_prefix("data: ")?;
        if data == "[DONE]" {
            return None;
        }
        serde_json::from_str(data).ok()
    }

    /// Map an HTTP status code to the appropriate LlmError.
    fn map_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 => {
                debug!(body = %body, "Authentication failed (401)");
                LlmError::AuthFailed {
                    provider: "OpenAI-compatible".to_string(),
                }
            }
            429 => {
                let retry_secs = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| {
                        v.get("error")?
                            .get("message")?
                            .as_str()
                            .map(|s| s.to_string())
                    })
                    .and_then(|msg| {
                        // "Rate limit... try again in Xs"
                        msg.split("in ")
                            .last()
                            .and_then(|s| s.trim_end_matches('s').parse::<u64>().ok())
                    })
                    .unwrap_or(5);
                LlmError::RateLimited {
                    retry_after_secs: retry_secs,
                }
            }
            status if status >= 500 => LlmError::ApiRequest {
                message: format!("Server error ({status}): {body}"),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {status}: {body}"),
            },
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(&request, false))
            .send()
            .await
            .map_err(|e| LlmError::ApiRequest {
                message: format!("Request failed: {e}"),
            })?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &response_body));
        }

        let body: Value =
            serde_json::from_str(&response_body).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON: {e}"),
            })?;

        let text = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Response missing choices[0].message.content".into(),
            })?
            .to_string();

        let model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&self.model)
            .to_string();

        Ok(CompletionResponse { text, model })
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(&request, true))
            .send()
            .await
            .map_err(|e| LlmError::Streaming {
                message: format!("Request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, &body_text));
        }

        // Read SSE chunks incrementally; a partial line is carried over to
        // the next chunk.
        let mut stream = response.bytes_stream();
        let mut pending = String::new();

        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LlmError::Streaming {
                message: format!("Failed to read stream: {e}"),
            })?;
            pending.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = pending.find('\n') {
                let line = pending[..newline].trim().to_string();
                pending.drain(..=newline);

                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if line == "data: [DONE]" {
                    let _ = tx.send(StreamEvent::Done).await;
                    return Ok(());
                }
                if let Some(data) = Self::parse_sse_line(&line)
                    && let Some(content) = data
                        .get("choices")
                        .and_then(|c| c.get(0))
                        .and_then(|c| c.get("delta"))
                        .and_then(|d| d.get("content"))
                        .and_then(|c| c.as_str())
                    && !content.is_empty()
                {
                    let _ = tx.send(StreamEvent::Token(content.to_string())).await;
                }
            }
        }

        let _ = tx.send(StreamEvent::Done).await;
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_line_token() {
        let line = r#"data: {"id":"chatcmpl-123","choices":[{"delta":{"content":"Hello"}}]}"#;
        let parsed = OpenAiCompatibleProvider::parse_sse_line(line).unwrap();
        assert_eq!(
            parsed["choices"][0]["delta"]["content"].as_str(),
            Some("Hello")
        );
    }

    #[test]
    fn test_parse_sse_line_done() {
        assert!(OpenAiCompatibleProvider::parse_sse_line("data: [DONE]").is_none());
    }

    #[test]
    fn test_parse_sse_line_non_data() {
        assert!(OpenAiCompatibleProvider::parse_sse_line(": keepalive").is_none());
    }

    #[test]
    fn test_map_http_error_auth() {
        let err = OpenAiCompatibleProvider::map_http_error(
            reqwest::StatusCode::UNAUTHORIZED,
            "{}",
        );
        assert!(matches!(err, LlmError::AuthFailed { .. }));
    }

    #[test]
    fn test_map_http_error_rate_limit_parses_retry() {
        let body = r#"{"error":{"message":"Rate limit reached, try again in 30s"}}"#;
        let err = OpenAiCompatibleProvider::map_http_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            body,
        );
        match err {
            LlmError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 30),
            other => panic!("Expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_map_http_error_server() {
        let err = OpenAiCompatibleProvider::map_http_error(
            reqwest::StatusCode::BAD_GATEWAY,
            "upstream down",
        );
        assert!(matches!(err, LlmError::ApiRequest { .. }));
    }

    #[test]
    fn test_request_body_shape() {
        let config = LlmConfig {
            provider: "ollama".into(),
            base_url: Some("http://localhost:11434/v1".into()),
            model: "llama3.2:3b".into(),
            ..LlmConfig::default()
        };
        let provider = OpenAiCompatibleProvider::new(&config).unwrap();
        let body = provider.request_body(
            &CompletionRequest {
                system: "persona".into(),
                prompt: "hello".into(),
                temperature: 0.4,
                max_tokens: Some(256),
            },
            true,
        );
        assert_eq!(body["model"], "llama3.2:3b");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
    }
}
