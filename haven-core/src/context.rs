//! Context assembly — turns the fused ranking into a bounded prompt context.
//!
//! Takes the top items up to the combined snippet/fact budget, truncates
//! each item's text to a per-item character cap, and concatenates under a
//! hard token ceiling. If per-item truncation is not enough, trailing items
//! are dropped until the assembled context fits.

use tiktoken_rs::CoreBPE;
use tracing::debug;

use crate::config::ContextConfig;
use crate::types::{PipelineRequest, ScoredItem};

/// Result of context assembly: the bounded context string and the subset of
/// items that actually made it in, for provenance.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub text: String,
    pub used: Vec<ScoredItem>,
    pub token_estimate: usize,
    pub truncated: bool,
}

/// Token-aware context assembler.
pub struct ContextAssembler {
    config: ContextConfig,
    bpe: CoreBPE,
}

impl ContextAssembler {
    /// Create an assembler; tokenization uses the cl100k BPE vocabulary.
    pub fn new(config: ContextConfig) -> Self {
        let bpe = tiktoken_rs::cl100k_base().expect("cl100k_base vocabulary is bundled");
        Self { config, bpe }
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Assemble a context string from the ranked items.
    ///
    /// The returned text never exceeds `config.max_tokens`, for any
    /// combination of item count and item length, including a single
    /// oversized item (which is dropped rather than partially included
    /// beyond its character cap).
    pub fn assemble(&self, ranked: &[ScoredItem]) -> AssembledContext {
        let item_budget = self.config.max_snippets + self.config.max_facts;
        let candidates = &ranked[..ranked.len().min(item_budget)];

        let mut text = self.config.header.clone();
        let mut used = Vec::new();
        let mut tokens = self.count_tokens(&text);
        let mut truncated = ranked.len() > item_budget;

        for (index, item) in candidates.iter().enumerate() {
            if item.text.is_empty() {
                continue;
            }
            let snippet = truncate_chars(&item.text, self.config.snippet_chars);
            let line = format!("\n{}. {}", index + 1, snippet);
            let line_tokens = self.count_tokens(&line);

            // Hard ceiling: drop this and all trailing items once exceeded.
            if tokens + line_tokens > self.config.max_tokens {
                truncated = true;
                break;
            }

            text.push_str(&line);
            tokens += line_tokens;
            used.push(item.clone());
        }

        debug!(
            items = used.len(),
            tokens,
            truncated,
            "Assembled retrieval context"
        );

        AssembledContext {
            text,
            used,
            token_estimate: tokens,
            truncated,
        }
    }

    /// Build the final generation prompt from the assembled context and the
    /// incoming request.
    pub fn build_prompt(&self, context: &str, request: &PipelineRequest) -> String {
        format!(
            "Context:\n{context}\n\nUser ({} years old): {}\n\n\
Provide a supportive, age-appropriate response that helps the user understand \
and manage their feelings. Use the context provided to give evidence-based \
guidance.",
            request.age_range, request.message
        )
    }
}

/// Truncate to a character budget without splitting a UTF-8 code point.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
