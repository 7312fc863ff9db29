//! Risk classifier — crisis screening for user input and model output.
//!
//! Pure, synchronous, and deterministic: three ordered signal tiers of
//! case-insensitive word-boundary patterns, scored by taking the maximum
//! matched tier weight rather than summing. The classifier never fails;
//! unmatched or empty input classifies as `Safe` with score 0.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::SafetyConfig;
use crate::error::ConfigError;
use crate::types::RiskLevel;

/// Result of one risk assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Risk score in [0, 1].
    pub score: f64,
    /// Patterns that matched, for audit logging.
    pub triggered: Vec<String>,
    /// Whether the pipeline must terminate early with a canned reply.
    pub escalate: bool,
    /// Canned reply for the matched tier; present only when escalating.
    pub safe_response: Option<String>,
}

impl RiskAssessment {
    fn safe() -> Self {
        Self {
            level: RiskLevel::Safe,
            score: 0.0,
            triggered: Vec::new(),
            escalate: false,
            safe_response: None,
        }
    }
}

struct Tier {
    patterns: Vec<Regex>,
    weight: f64,
}

/// Screens text against the configured signal tiers.
///
/// Compiled once from a [`SafetyConfig`] and shared by the prefilter and
/// postfilter stages, so both always agree on patterns and thresholds.
pub struct RiskClassifier {
    critical: Tier,
    high: Tier,
    moderate: Tier,
    critical_threshold: f64,
    high_threshold: f64,
    moderate_threshold: f64,
    crisis_response: String,
    high_risk_response: String,
}

impl RiskClassifier {
    /// Compile the classifier from configuration.
    ///
    /// Returns an error only for malformed patterns; a default
    /// configuration always compiles.
    pub fn new(config: &SafetyConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            critical: Tier {
                patterns: compile(&config.critical_patterns)?,
                weight: config.critical_weight,
            },
            high: Tier {
                patterns: compile(&config.high_patterns)?,
                weight: config.high_weight,
            },
            moderate: Tier {
                patterns: compile(&config.moderate_patterns)?,
                weight: config.moderate_weight,
            },
            critical_threshold: config.critical_threshold,
            high_threshold: config.high_threshold,
            moderate_threshold: config.moderate_threshold,
            crisis_response: config.crisis_response.clone(),
            high_risk_response: config.high_risk_response.clone(),
        })
    }

    /// Assess a piece of text and return its risk classification.
    ///
    /// Score assignment is max-over-tiers: when several tiers match, the
    /// highest severity wins regardless of match order. Escalation fires
    /// only at `Critical` and `High`, each carrying its tier's canned reply.
    pub fn assess(&self, text: &str) -> RiskAssessment {
        if text.trim().is_empty() {
            return RiskAssessment::safe();
        }

        let mut score: f64 = 0.0;
        let mut triggered = Vec::new();

        for tier in [&self.critical, &self.high, &self.moderate] {
            for pattern in &tier.patterns {
                if pattern.is_match(text) {
                    triggered.push(pattern.as_str().to_string());
                    score = score.max(tier.weight);
                }
            }
        }

        let (level, escalate, safe_response) = if score >= self.critical_threshold {
            (RiskLevel::Critical, true, Some(self.crisis_response.clone()))
        } else if score >= self.high_threshold {
            (RiskLevel::High, true, Some(self.high_risk_response.clone()))
        } else if score >= self.moderate_threshold {
            (RiskLevel::Moderate, false, None)
        } else if score > 0.0 {
            (RiskLevel::Low, false, None)
        } else {
            (RiskLevel::Safe, false, None)
        };

        RiskAssessment {
            level,
            score,
            triggered,
            escalate,
            safe_response,
        }
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    message: e.to_string(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RiskClassifier {
        RiskClassifier::new(&SafetyConfig::default()).unwrap()
    }

    #[test]
    fn test_critical_input_escalates() {
        let result = classifier().assess("I want to kill myself");
        assert_eq!(result.level, RiskLevel::Critical);
        assert!(result.escalate);
        assert!(result.score >= 0.9);
        assert!(result.safe_response.unwrap().contains("988"));
    }

    #[test]
    fn test_critical_wins_over_other_tiers() {
        // Matches moderate ("depressed"), high ("hopeless"), and critical.
        let result = classifier().assess("I'm depressed and hopeless and suicidal");
        assert_eq!(result.level, RiskLevel::Critical);
        assert!(result.escalate);
        assert!((result.score - 0.95).abs() < 1e-9);
        assert!(result.triggered.len() >= 3);
    }

    #[test]
    fn test_high_tier_escalates_with_tier_response() {
        let result = classifier().assess("everything feels hopeless");
        assert_eq!(result.level, RiskLevel::High);
        assert!(result.escalate);
        assert!(result.safe_response.unwrap().contains("SAMHSA"));
    }

    #[test]
    fn test_moderate_tier_flags_without_escalation() {
        let result = classifier().assess("I've been dealing with anxiety lately");
        assert_eq!(result.level, RiskLevel::Moderate);
        assert!(!result.escalate);
        assert!(result.safe_response.is_none());
    }

    #[test]
    fn test_unmatched_input_is_safe_with_zero_score() {
        let result = classifier().assess("How do I bake banana bread?");
        assert_eq!(result.level, RiskLevel::Safe);
        assert_eq!(result.score, 0.0);
        assert!(result.triggered.is_empty());
        assert!(!result.escalate);
    }

    #[test]
    fn test_empty_input_is_safe() {
        let result = classifier().assess("   ");
        assert_eq!(result.level, RiskLevel::Safe);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_case_insensitive_matching() {
        let result = classifier().assess("I WANT TO KILL MYSELF");
        assert_eq!(result.level, RiskLevel::Critical);
    }

    #[test]
    fn test_word_boundary_no_substring_false_positive() {
        // "anxious" must match only as a whole word.
        let result = classifier().assess("she wrote about anxiousness in general");
        assert_eq!(result.level, RiskLevel::Safe);
    }

    #[test]
    fn test_apostrophe_variants() {
        let with = classifier().assess("I don't want to live");
        let without = classifier().assess("I dont want to live");
        assert_eq!(with.level, RiskLevel::Critical);
        assert_eq!(without.level, RiskLevel::Critical);
    }

    #[test]
    fn test_deterministic() {
        let c = classifier();
        let a = c.assess("I feel worthless and scared");
        let b = c.assess("I feel worthless and scared");
        assert_eq!(a.level, b.level);
        assert_eq!(a.score, b.score);
        assert_eq!(a.triggered, b.triggered);
    }

    #[test]
    fn test_invalid_pattern_rejected_at_build() {
        let config = SafetyConfig {
            critical_patterns: vec![r"\b(".into()],
            ..SafetyConfig::default()
        };
        assert!(RiskClassifier::new(&config).is_err());
    }
}
