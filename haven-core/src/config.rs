//! Configuration system for the Haven pipeline.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment. One `PipelineConfig` object carries risk thresholds, fusion
//! weights, retrieval parameters, context budgets, and timeouts, and is
//! injected into every stage so that the safety prefilter and postfilter
//! always agree on thresholds.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Top-level configuration for one pipeline instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub safety: SafetyConfig,
    pub fusion: FusionConfig,
    pub retrieval: RetrievalConfig,
    pub context: ContextConfig,
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
}

/// Risk classifier configuration: signal tiers, severity weights, level
/// thresholds, and the canned responses substituted on escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Patterns for the critical tier (word-boundary, case-insensitive).
    #[serde(default = "default_critical_patterns")]
    pub critical_patterns: Vec<String>,
    /// Patterns for the high tier.
    #[serde(default = "default_high_patterns")]
    pub high_patterns: Vec<String>,
    /// Patterns for the moderate tier.
    #[serde(default = "default_moderate_patterns")]
    pub moderate_patterns: Vec<String>,
    /// Severity weight assigned when a critical pattern matches.
    #[serde(default = "default_critical_weight")]
    pub critical_weight: f64,
    #[serde(default = "default_high_weight")]
    pub high_weight: f64,
    #[serde(default = "default_moderate_weight")]
    pub moderate_weight: f64,
    /// Score threshold at or above which a message is `critical`.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    #[serde(default = "default_moderate_threshold")]
    pub moderate_threshold: f64,
    /// Canned reply substituted when a critical-tier escalation fires.
    #[serde(default = "default_crisis_response")]
    pub crisis_response: String,
    /// Canned reply substituted when a high-tier escalation fires.
    #[serde(default = "default_high_risk_response")]
    pub high_risk_response: String,
}

fn default_critical_patterns() -> Vec<String> {
    [
        r"\bsuicide\b",
        r"\bsuicidal\b",
        r"\bkill myself\b",
        r"\bend my life\b",
        r"\bwant to die\b",
        r"\bdon'?t want to live\b",
        r"\bself[- ]?harm\b",
        r"\bcut myself\b",
        r"\bhurt myself\b",
        r"\boverdose\b",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_high_patterns() -> Vec<String> {
    [
        r"\babuse\b",
        r"\babused\b",
        r"\bviolence\b",
        r"\bviolent\b",
        r"\bhopeless\b",
        r"\bno hope\b",
        r"\bworthless\b",
        r"\bno reason to live\b",
        r"\bgive up\b",
        r"\bgiving up\b",
        r"\bcan'?t go on\b",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_moderate_patterns() -> Vec<String> {
    [
        r"\bdepressed\b",
        r"\bdepression\b",
        r"\banxiety\b",
        r"\banxious\b",
        r"\bpanic attack\b",
        r"\bscared\b",
        r"\bterrified\b",
        r"\btrauma\b",
        r"\bptsd\b",
        r"\beating disorder\b",
        r"\banorexia\b",
        r"\bbulimia\b",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_critical_weight() -> f64 {
    0.95
}
fn default_high_weight() -> f64 {
    0.75
}
fn default_moderate_weight() -> f64 {
    0.5
}
fn default_critical_threshold() -> f64 {
    0.9
}
fn default_high_threshold() -> f64 {
    0.7
}
fn default_moderate_threshold() -> f64 {
    0.4
}

fn default_crisis_response() -> String {
    "I'm really concerned about what you've shared with me. Your safety is the top \
priority right now.\n\n\
Please reach out for immediate support:\n\
- Emergency Services: 911 (US) or your local emergency number\n\
- 988 Suicide & Crisis Lifeline: call or text 988 (US)\n\
- Crisis Text Line: text HOME to 741741\n\n\
These services are available 24/7 and staffed by trained professionals. \
You're not alone, and there are people who care about you and want to help."
        .to_string()
}

fn default_high_risk_response() -> String {
    "I hear you, and what you're going through sounds really difficult. I want to \
make sure you have access to the right support.\n\n\
Support resources available to you:\n\
- SAMHSA Helpline: 1-800-662-4357 (24/7, free, confidential)\n\
- Crisis Text Line: text HOME to 741741\n\n\
It's okay to reach out for help. Would you like to talk more about what you're \
experiencing?"
        .to_string()
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            critical_patterns: default_critical_patterns(),
            high_patterns: default_high_patterns(),
            moderate_patterns: default_moderate_patterns(),
            critical_weight: default_critical_weight(),
            high_weight: default_high_weight(),
            moderate_weight: default_moderate_weight(),
            critical_threshold: default_critical_threshold(),
            high_threshold: default_high_threshold(),
            moderate_threshold: default_moderate_threshold(),
            crisis_response: default_crisis_response(),
            high_risk_response: default_high_risk_response(),
        }
    }
}

/// Weights used when fusing vector and graph result lists.
///
/// Weights are configuration constants, not computed at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default = "default_weight_vector")]
    pub weight_vector: f64,
    #[serde(default = "default_weight_graph")]
    pub weight_graph: f64,
    /// Relation score assumed when the graph backend supplies none.
    #[serde(default = "default_graph_score")]
    pub default_graph_score: f64,
}

fn default_weight_vector() -> f64 {
    0.6
}
fn default_weight_graph() -> f64 {
    0.3
}
fn default_graph_score() -> f64 {
    0.5
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            weight_vector: default_weight_vector(),
            weight_graph: default_weight_graph(),
            default_graph_score: default_graph_score(),
        }
    }
}

/// Retrieval backend parameters and per-call timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub vector_top_k: usize,
    #[serde(default = "default_max_hops")]
    pub graph_max_hops: usize,
    #[serde(default = "default_max_nodes")]
    pub graph_max_nodes: usize,
    /// Timeout for one vector search call, in seconds.
    #[serde(default = "default_vector_timeout")]
    pub vector_timeout_secs: u64,
    /// Timeout for seed lookup plus graph expansion, in seconds.
    #[serde(default = "default_graph_timeout")]
    pub graph_timeout_secs: u64,
}

fn default_top_k() -> usize {
    24
}
fn default_max_hops() -> usize {
    2
}
fn default_max_nodes() -> usize {
    200
}
fn default_vector_timeout() -> u64 {
    3
}
fn default_graph_timeout() -> u64 {
    2
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_top_k: default_top_k(),
            graph_max_hops: default_max_hops(),
            graph_max_nodes: default_max_nodes(),
            vector_timeout_secs: default_vector_timeout(),
            graph_timeout_secs: default_graph_timeout(),
        }
    }
}

/// Context assembly budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Item budget for passage snippets.
    #[serde(default = "default_max_snippets")]
    pub max_snippets: usize,
    /// Item budget for graph facts.
    #[serde(default = "default_max_facts")]
    pub max_facts: usize,
    /// Hard ceiling on the assembled context, in tokens.
    #[serde(default = "default_max_context_tokens")]
    pub max_tokens: usize,
    /// Per-item character cap before concatenation.
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    /// Header line prepended to the assembled context.
    #[serde(default = "default_context_header")]
    pub header: String,
}

fn default_max_snippets() -> usize {
    6
}
fn default_max_facts() -> usize {
    12
}
fn default_max_context_tokens() -> usize {
    1800
}
fn default_snippet_chars() -> usize {
    300
}
fn default_context_header() -> String {
    "Relevant supporting knowledge:".to_string()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_snippets: default_max_snippets(),
            max_facts: default_max_facts(),
            max_tokens: default_max_context_tokens(),
            snippet_chars: default_snippet_chars(),
            header: default_context_header(),
        }
    }
}

/// Generation backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: "openai" or any OpenAI-compatible endpoint.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Base URL override (Ollama, vLLM, Azure, ...).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Timeout for one generation call, in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Persona preamble used as the system prompt.
    #[serde(default = "default_persona")]
    pub persona: String,
    /// Apology text used when the backend is unavailable.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    /// When true, the pipeline stops after context assembly and never
    /// invokes the generation backend (retrieval-only / dry-run mode).
    #[serde(default)]
    pub skip_generation: bool,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_api_key_env() -> String {
    "HAVEN_API_KEY".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_llm_timeout() -> u64 {
    10
}

fn default_persona() -> String {
    "You are Haven, an empathetic wellness support companion for children and \
adolescents. Provide supportive, age-appropriate guidance grounded in the \
supplied context."
        .to_string()
}

fn default_fallback_reply() -> String {
    "I apologize, but I'm having trouble responding right now. Please try again in \
a moment. If you need support urgently, you can call or text 988 (US) to reach \
trained crisis counselors at any time."
        .to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: None,
            timeout_secs: default_llm_timeout(),
            persona: default_persona(),
            fallback_reply: default_fallback_reply(),
            skip_generation: false,
        }
    }
}

/// Response/embedding cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Entry time-to-live in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// Maximum number of entries kept per cache.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

fn default_cache_enabled() -> bool {
    true
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_cache_capacity() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            capacity: default_cache_capacity(),
        }
    }
}

/// Input validation limits applied before the pipeline starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum accepted message length, in characters.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

fn default_max_message_length() -> usize {
    2000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `HAVEN_`, `__` as separator)
/// 2. Config file, if one is given and exists
/// 3. Built-in defaults
pub fn load_config(config_file: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(path) = config_file
        && path.exists()
    {
        figment = figment.merge(Toml::file(path));
    }

    // HAVEN_FUSION__WEIGHT_VECTOR, HAVEN_LLM__MODEL, etc.
    figment = figment.merge(Env::prefixed("HAVEN_").split("__"));

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.fusion.weight_vector, 0.6);
        assert_eq!(config.fusion.weight_graph, 0.3);
        assert_eq!(config.retrieval.vector_top_k, 24);
        assert_eq!(config.retrieval.graph_max_hops, 2);
        assert_eq!(config.retrieval.graph_max_nodes, 200);
        assert_eq!(config.context.max_snippets, 6);
        assert_eq!(config.context.max_facts, 12);
        assert_eq!(config.context.max_tokens, 1800);
        assert_eq!(config.limits.max_message_length, 2000);
        assert_eq!(config.llm.timeout_secs, 10);
        assert!(!config.llm.skip_generation);
    }

    #[test]
    fn test_safety_defaults_agree_between_filters() {
        // Prefilter and postfilter both read the same SafetyConfig instance,
        // so the thresholds cannot drift apart.
        let config = SafetyConfig::default();
        assert!(config.critical_weight >= config.critical_threshold);
        assert!(config.high_weight >= config.high_threshold);
        assert!(config.moderate_weight >= config.moderate_threshold);
    }

    #[test]
    fn test_crisis_response_names_hotline() {
        let config = SafetyConfig::default();
        assert!(config.crisis_response.contains("988"));
        assert!(config.high_risk_response.contains("741741"));
    }

    #[test]
    fn test_load_config_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.fusion.weight_vector, 0.6);
    }

    #[test]
    fn test_load_config_merges_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haven.toml");
        std::fs::write(
            &path,
            "[fusion]\nweight_vector = 0.8\n\n[retrieval]\nvector_top_k = 5\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.fusion.weight_vector, 0.8);
        assert_eq!(config.retrieval.vector_top_k, 5);
        // Untouched sections keep their defaults
        assert_eq!(config.fusion.weight_graph, 0.3);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.context.max_tokens, config.context.max_tokens);
        assert_eq!(back.safety.critical_patterns, config.safety.critical_patterns);
    }
}
