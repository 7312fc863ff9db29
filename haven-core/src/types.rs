//! Fundamental types shared across the Haven pipeline.

use serde::{Deserialize, Serialize};

/// Discrete severity classification of a message.
///
/// Ordered from least to most severe so that `max()` and comparisons work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Safety level reported to callers.
///
/// Extends [`RiskLevel`] with an `Error` variant used only for the degraded
/// terminal response when the pipeline itself failed unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Safe,
    Low,
    Moderate,
    High,
    Critical,
    Error,
}

impl From<RiskLevel> for SafetyLevel {
    fn from(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Safe => SafetyLevel::Safe,
            RiskLevel::Low => SafetyLevel::Low,
            RiskLevel::Moderate => SafetyLevel::Moderate,
            RiskLevel::High => SafetyLevel::High,
            RiskLevel::Critical => SafetyLevel::Critical,
        }
    }
}

impl std::fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SafetyLevel::Safe => "safe",
            SafetyLevel::Low => "low",
            SafetyLevel::Moderate => "moderate",
            SafetyLevel::High => "high",
            SafetyLevel::Critical => "critical",
            SafetyLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// Immutable input to one pipeline run: one incoming user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    /// Session the message belongs to.
    pub session_id: String,
    /// Raw user text.
    pub message: String,
    /// BCP-47-ish language tag, used as a retrieval filter.
    #[serde(default = "default_language")]
    pub language: String,
    /// Audience age range tag, used for prompt shaping.
    #[serde(default = "default_age_range")]
    pub age_range: String,
}

fn default_language() -> String {
    "en".into()
}

fn default_age_range() -> String {
    "8-12".into()
}

impl PipelineRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            language: default_language(),
            age_range: default_age_range(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_age_range(mut self, age_range: impl Into<String>) -> Self {
        self.age_range = age_range.into();
        self
    }
}

/// A hit returned by the dense vector backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: String,
    pub text: String,
    /// Raw similarity score from the backend, typically in [0, 1].
    pub score: f64,
}

/// A hit produced by knowledge-graph expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphHit {
    pub id: String,
    pub text: String,
    /// Raw relation score; `None` means the backend supplied no score.
    pub score: Option<f64>,
}

/// A seed entity matched in the knowledge graph before expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedNode {
    pub id: String,
    pub node_type: String,
}

/// Which retrieval backend a fused item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Vector,
    Graph,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Vector => f.write_str("vector"),
            SourceKind::Graph => f.write_str("graph"),
        }
    }
}

/// Normalized result unit produced by hybrid fusion.
///
/// Created during fusion, consumed by context assembly and provenance
/// building, discarded after the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredItem {
    pub id: String,
    pub kind: SourceKind,
    pub text: String,
    /// Score as reported by the backend.
    pub raw_score: f64,
    /// Backend score multiplied by the configured source weight.
    pub weighted_score: f64,
}

/// One entry of the provenance list exposed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub source_id: String,
    pub source_type: SourceKind,
    /// Weighted score, rounded to 3 decimals.
    pub score: f64,
    /// Snippet of the source text, at most 200 characters.
    pub snippet: String,
}

/// Final summary record of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub reply: String,
    pub safety_level: SafetyLevel,
    pub safety_score: f64,
    pub provenance: Vec<ProvenanceEntry>,
    pub escalated: bool,
    /// Wall-clock seconds per stage, keyed by stage name.
    pub timings: std::collections::BTreeMap<String, f64>,
    /// Recoverable error recorded during the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A fragment of the reply delivered incrementally to a streaming caller.
///
/// Fragments are suffix deltas: concatenating them in order reproduces the
/// final reply text exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDelta {
    pub text: String,
}
