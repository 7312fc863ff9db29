//! Hybrid fusion — merges vector and graph result lists into one ranking.
//!
//! Each hit's weighted score is its raw backend score multiplied by the
//! configured source weight. The merged list is stable-sorted descending so
//! ties preserve original backend order, keeping output deterministic. When
//! the same id appears in both lists, the higher-weighted entry survives.

use crate::config::FusionConfig;
use crate::types::{GraphHit, ScoredItem, SourceKind, VectorHit};

/// Fuse the two backend result lists into one ranked list.
pub fn fuse(
    vector_hits: &[VectorHit],
    graph_hits: &[GraphHit],
    config: &FusionConfig,
) -> Vec<ScoredItem> {
    let mut combined: Vec<ScoredItem> =
        Vec::with_capacity(vector_hits.len() + graph_hits.len());

    for hit in vector_hits {
        combined.push(ScoredItem {
            id: hit.id.clone(),
            kind: SourceKind::Vector,
            text: hit.text.clone(),
            raw_score: hit.score,
            weighted_score: config.weight_vector * hit.score,
        });
    }

    for hit in graph_hits {
        let raw = hit.score.unwrap_or(config.default_graph_score);
        combined.push(ScoredItem {
            id: hit.id.clone(),
            kind: SourceKind::Graph,
            text: hit.text.clone(),
            raw_score: raw,
            weighted_score: config.weight_graph * raw,
        });
    }

    // Stable sort: equal weighted scores keep concatenation order
    // (vector hits before graph hits, backend order within each).
    combined.sort_by(|a, b| {
        b.weighted_score
            .partial_cmp(&a.weighted_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    dedupe_by_id(combined)
}

/// Drop lower-ranked duplicates of an id that appears in both sources.
///
/// The input is already sorted descending, so keeping the first occurrence
/// keeps the higher-weighted entry.
fn dedupe_by_id(ranked: Vec<ScoredItem>) -> Vec<ScoredItem> {
    let mut seen = std::collections::HashSet::with_capacity(ranked.len());
    ranked
        .into_iter()
        .filter(|item| seen.insert(item.id.clone()))
        .collect()
}
