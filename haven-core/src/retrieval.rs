//! Retrieval backend contracts and reference implementations.
//!
//! The pipeline consumes two abstract services: a dense vector index
//! (`VectorSearch`) and a knowledge graph (`GraphStore`). Both are queried
//! with bounded timeouts; a backend that times out or fails contributes an
//! empty partial result instead of failing the run. The in-memory
//! implementations back the offline CLI mode and the test suite.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::embeddings::cosine_similarity;
use crate::error::RetrievalError;
use crate::types::{GraphHit, SeedNode, VectorHit};

/// Filters applied to a vector search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Restrict hits to documents in this language.
    pub language: Option<String>,
}

/// Dense vector search backend.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<VectorHit>, RetrievalError>;
}

/// Knowledge graph backend: seed lookup plus bounded expansion.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Find entity nodes mentioned in the text.
    async fn find_seeds(
        &self,
        text: &str,
        language: &str,
    ) -> Result<Vec<SeedNode>, RetrievalError>;

    /// Expand outward from the seed nodes, bounded by hops and node count.
    async fn expand(
        &self,
        seed_ids: &[String],
        max_hops: usize,
        max_nodes: usize,
    ) -> Result<Vec<GraphHit>, RetrievalError>;
}

/// Await a retrieval future under a timeout, degrading to empty on
/// timeout or backend error. The pipeline never fails because one
/// retrieval backend is down.
pub async fn timed_retrieval<T, F>(label: &str, timeout_secs: u64, fut: F) -> Vec<T>
where
    F: Future<Output = Result<Vec<T>, RetrievalError>>,
{
    match tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await {
        Ok(Ok(hits)) => hits,
        Ok(Err(e)) => {
            warn!(backend = label, error = %e, "Retrieval backend failed, continuing with partial results");
            Vec::new()
        }
        Err(_) => {
            warn!(
                backend = label,
                timeout_secs, "Retrieval backend timed out, continuing with partial results"
            );
            Vec::new()
        }
    }
}

/// One document stored in the in-memory vector index.
#[derive(Debug, Clone)]
pub struct IndexedDocument {
    pub id: String,
    pub text: String,
    pub language: String,
    pub embedding: Vec<f32>,
}

/// In-memory cosine-similarity index for offline mode and tests.
#[derive(Debug, Default)]
pub struct StaticVectorIndex {
    documents: Vec<IndexedDocument>,
}

impl StaticVectorIndex {
    pub fn new(documents: Vec<IndexedDocument>) -> Self {
        Self { documents }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl VectorSearch for StaticVectorIndex {
    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<VectorHit>, RetrievalError> {
        let mut hits: Vec<VectorHit> = self
            .documents
            .iter()
            .filter(|doc| {
                filters
                    .language
                    .as_deref()
                    .is_none_or(|lang| doc.language == lang)
            })
            .map(|doc| VectorHit {
                id: doc.id.clone(),
                text: doc.text.clone(),
                score: cosine_similarity(embedding, &doc.embedding),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

/// An edge in the in-memory knowledge graph.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub relation: String,
    pub score: Option<f64>,
}

/// In-memory knowledge graph keyed by lowercase entity name.
///
/// Seed lookup is a whole-word text match over entity names; expansion is a
/// breadth-first walk over the adjacency list bounded by hops and nodes.
#[derive(Debug, Default)]
pub struct StaticGraphStore {
    adjacency: HashMap<String, Vec<GraphEdge>>,
}

impl StaticGraphStore {
    pub fn new(edges: Vec<GraphEdge>) -> Self {
        let mut adjacency: HashMap<String, Vec<GraphEdge>> = HashMap::new();
        for edge in edges {
            adjacency
                .entry(edge.from.to_lowercase())
                .or_default()
                .push(edge);
        }
        Self { adjacency }
    }
}

#[async_trait]
impl GraphStore for StaticGraphStore {
    async fn find_seeds(
        &self,
        text: &str,
        _language: &str,
    ) -> Result<Vec<SeedNode>, RetrievalError> {
        let lowered = text.to_lowercase();
        let words: std::collections::HashSet<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let mut seeds: Vec<SeedNode> = self
            .adjacency
            .keys()
            .filter(|entity| words.contains(entity.as_str()))
            .map(|entity| SeedNode {
                id: entity.clone(),
                node_type: "entity".into(),
            })
            .collect();
        seeds.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(seeds)
    }

    async fn expand(
        &self,
        seed_ids: &[String],
        max_hops: usize,
        max_nodes: usize,
    ) -> Result<Vec<GraphHit>, RetrievalError> {
        let mut visited: std::collections::HashSet<String> =
            seed_ids.iter().map(|s| s.to_lowercase()).collect();
        let mut frontier: Vec<String> = visited.iter().cloned().collect();
        frontier.sort();
        let mut hits = Vec::new();

        for _hop in 0..max_hops {
            let mut next_frontier = Vec::new();
            for node in &frontier {
                let Some(edges) = self.adjacency.get(node) else {
                    continue;
                };
                for edge in edges {
                    if hits.len() >= max_nodes {
                        return Ok(hits);
                    }
                    hits.push(GraphHit {
                        id: format!("{}->{}", edge.from, edge.to),
                        text: format!("{} {} {}", edge.from, edge.relation, edge.to),
                        score: edge.score,
                    });
                    if visited.insert(edge.to.to_lowercase()) {
                        next_frontier.push(edge.to.to_lowercase());
                    }
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{Embedder, HashEmbedder};

    async fn index(embedder: &HashEmbedder, docs: &[(&str, &str, &str)]) -> StaticVectorIndex {
        let mut documents = Vec::new();
        for (id, language, text) in docs {
            documents.push(IndexedDocument {
                id: (*id).into(),
                text: (*text).into(),
                language: (*language).into(),
                embedding: embedder.embed(text).await.unwrap(),
            });
        }
        StaticVectorIndex::new(documents)
    }

    #[tokio::test]
    async fn test_vector_index_ranks_by_similarity() {
        let embedder = HashEmbedder::new(256);
        let idx = index(
            &embedder,
            &[
                ("doc-anxiety", "en", "deep breathing reduces anxiety symptoms"),
                ("doc-volcano", "en", "volcanoes erupt molten rock from the mantle"),
            ],
        )
        .await;

        let query = embedder.embed("how to reduce anxiety").await.unwrap();
        let hits = idx
            .search(&query, 10, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits[0].id, "doc-anxiety");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_vector_index_language_filter() {
        let embedder = HashEmbedder::new(256);
        let idx = index(
            &embedder,
            &[
                ("en-doc", "en", "sleep routines help mood"),
                ("hi-doc", "hi", "sleep routines help mood"),
            ],
        )
        .await;

        let query = embedder.embed("sleep routines").await.unwrap();
        let filters = SearchFilters {
            language: Some("hi".into()),
        };
        let hits = idx.search(&query, 10, &filters).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "hi-doc");
    }

    #[tokio::test]
    async fn test_vector_index_top_k() {
        let embedder = HashEmbedder::new(64);
        let idx = index(
            &embedder,
            &[
                ("a", "en", "one"),
                ("b", "en", "two"),
                ("c", "en", "three"),
            ],
        )
        .await;
        let query = embedder.embed("one two three").await.unwrap();
        let hits = idx.search(&query, 2, &SearchFilters::default()).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    fn wellness_graph() -> StaticGraphStore {
        StaticGraphStore::new(vec![
            GraphEdge {
                from: "anxiety".into(),
                to: "breathing".into(),
                relation: "managed_by".into(),
                score: Some(0.8),
            },
            GraphEdge {
                from: "anxiety".into(),
                to: "sleep".into(),
                relation: "worsened_by_poor".into(),
                score: None,
            },
            GraphEdge {
                from: "breathing".into(),
                to: "relaxation".into(),
                relation: "induces".into(),
                score: Some(0.6),
            },
        ])
    }

    #[tokio::test]
    async fn test_graph_seed_lookup_whole_word() {
        let graph = wellness_graph();
        let seeds = graph
            .find_seeds("I struggle with anxiety at night", "en")
            .await
            .unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].id, "anxiety");

        let none = graph.find_seeds("nothing relevant here", "en").await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_graph_expansion_respects_hops() {
        let graph = wellness_graph();
        let one_hop = graph
            .expand(&["anxiety".into()], 1, 100)
            .await
            .unwrap();
        assert_eq!(one_hop.len(), 2);

        let two_hops = graph
            .expand(&["anxiety".into()], 2, 100)
            .await
            .unwrap();
        // Second hop reaches breathing -> relaxation.
        assert_eq!(two_hops.len(), 3);
        assert!(two_hops.iter().any(|h| h.id == "breathing->relaxation"));
    }

    #[tokio::test]
    async fn test_graph_expansion_respects_node_cap() {
        let graph = wellness_graph();
        let hits = graph.expand(&["anxiety".into()], 2, 1).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_timed_retrieval_degrades_on_timeout() {
        let hits: Vec<VectorHit> = timed_retrieval("vector", 0, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![VectorHit {
                id: "late".into(),
                text: "too late".into(),
                score: 1.0,
            }])
        })
        .await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_timed_retrieval_degrades_on_error() {
        let hits: Vec<VectorHit> = timed_retrieval("vector", 5, async {
            Err(RetrievalError::VectorSearch {
                message: "index offline".into(),
            })
        })
        .await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_timed_retrieval_passes_results_through() {
        let hits: Vec<VectorHit> = timed_retrieval("vector", 5, async {
            Ok(vec![VectorHit {
                id: "ok".into(),
                text: "fine".into(),
                score: 0.5,
            }])
        })
        .await;
        assert_eq!(hits.len(), 1);
    }
}
