//! Generation provider implementations.
//!
//! Provides concrete implementations of the `LlmProvider` trait. Currently
//! one HTTP provider covers OpenAI, Azure, Ollama, vLLM, and any other
//! endpoint that follows the OpenAI chat completions API format. Use
//! [`create_provider`] to instantiate the provider selected by config.

pub mod openai_compat;

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::generate::{LlmProvider, MockLlmProvider};

pub use openai_compat::OpenAiCompatibleProvider;

/// Create a generation provider from configuration.
///
/// `"mock"` yields the in-process mock (offline mode); everything else is
/// treated as an OpenAI-compatible endpoint.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockLlmProvider::with_response(
            "Thanks for sharing that with me. Let's take it one step at a time.",
        ))),
        _ => Ok(Arc::new(OpenAiCompatibleProvider::new(config)?)),
    }
}
