//! Error types for the Haven pipeline core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering input validation, LLM, retrieval, cache, and configuration
//! domains. Backend failures are recoverable inside the pipeline; only
//! input rejection and configuration problems surface to callers as errors.

/// Top-level error type for the Haven core library.
#[derive(Debug, thiserror::Error)]
pub enum HavenError {
    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from request validation, raised before the pipeline starts.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message exceeds maximum length of {max} characters (got {got})")]
    MessageTooLong { max: usize, got: usize },
}

/// Errors from generation backend interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

/// Errors from retrieval backends (vector index, knowledge graph, embedder).
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Embedding failed: {message}")]
    Embedding { message: String },

    #[error("Vector search failed: {message}")]
    VectorSearch { message: String },

    #[error("Graph expansion failed: {message}")]
    GraphExpansion { message: String },

    #[error("Backend timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Invalid risk pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `HavenError`.
pub type Result<T> = std::result::Result<T, HavenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_input() {
        let err = HavenError::Input(InputError::MessageTooLong { max: 2000, got: 2481 });
        assert_eq!(
            err.to_string(),
            "Input error: Message exceeds maximum length of 2000 characters (got 2481)"
        );
    }

    #[test]
    fn test_error_display_llm() {
        let err = HavenError::Llm(LlmError::ApiRequest {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "LLM error: API request failed: connection refused"
        );
    }

    #[test]
    fn test_error_display_retrieval() {
        let err = HavenError::Retrieval(RetrievalError::Timeout { timeout_secs: 3 });
        assert_eq!(err.to_string(), "Retrieval error: Backend timed out after 3s");
    }

    #[test]
    fn test_error_display_config() {
        let err = HavenError::Config(ConfigError::InvalidPattern {
            pattern: r"\b(".into(),
            message: "unclosed group".into(),
        });
        assert_eq!(
            err.to_string(),
            r"Configuration error: Invalid risk pattern '\b(': unclosed group"
        );
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: HavenError = serde_err.into();
        assert!(matches!(err, HavenError::Serialization(_)));
    }
}
