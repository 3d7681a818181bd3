// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::embedder::Embedder;
use crate::modules::error::GroundEffectResult;
use crate::modules::search::planner::PlannedSearch;
use crate::modules::store::reader::{Snapshot, Table};
use ahash::AHashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Reciprocal Rank Fusion constant.
const RRF_K: f64 = 60.0;

#[derive(Clone, Debug)]
pub struct SearchHit {
    pub id: u64,
    pub score: f64,
}

#[derive(Clone, Debug)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub accounts_searched: Vec<String>,
    /// Distinct candidates considered across both rankings.
    pub candidates: usize,
    pub elapsed_ms: u64,
    /// Set when one ranking side was unavailable and the other carried
    /// the query alone.
    pub degraded: bool,
}

/// `score(d) = Σᵢ 1/(k + rankᵢ(d))`, k = 60, ranks starting at 1;
/// documents absent from a side contribute nothing from it. Ties break on
/// document id, so identical inputs produce byte-identical orderings.
pub fn fuse_rrf(
    keyword: &[(u64, f32)],
    vector: &[(u64, f32)],
    limit: usize,
) -> (Vec<SearchHit>, usize) {
    let mut scores: AHashMap<u64, f64> = AHashMap::new();
    for (rank, (id, _)) in keyword.iter().enumerate() {
        *scores.entry(*id).or_default() += 1.0 / (RRF_K + rank as f64 + 1.0);
    }
    for (rank, (id, _)) in vector.iter().enumerate() {
        *scores.entry(*id).or_default() += 1.0 / (RRF_K + rank as f64 + 1.0);
    }
    let candidates = scores.len();
    let mut fused: Vec<SearchHit> = scores
        .into_iter()
        .map(|(id, score)| SearchHit { id, score })
        .collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    fused.truncate(limit);
    (fused, candidates)
}

/// The hybrid keyword+semantic searcher, parameterised over the item
/// table. Query embedding reuses the ingest embedder, truncation policy
/// included.
pub struct HybridSearcher {
    embedder: Arc<Embedder>,
}

impl HybridSearcher {
    pub fn new(embedder: Arc<Embedder>) -> Self {
        Self { embedder }
    }

    pub async fn search(
        &self,
        snapshot: &Snapshot,
        table: Table,
        planned: &PlannedSearch,
    ) -> GroundEffectResult<SearchOutcome> {
        let started = Instant::now();

        // Empty query with structured filters: a plain date-descending
        // scan, both ranking sides skipped.
        if planned.query.is_empty() {
            let candidates = snapshot.filter_count(table, &planned.predicate);
            let hits = snapshot
                .filter_scan(table, &planned.predicate, planned.limit)
                .into_iter()
                .map(|id| SearchHit { id, score: 0.0 })
                .collect();
            return Ok(SearchOutcome {
                hits,
                accounts_searched: planned.accounts_searched.clone(),
                candidates,
                elapsed_ms: started.elapsed().as_millis() as u64,
                degraded: false,
            });
        }

        let fetch = planned.limit.saturating_mul(4).max(100);

        let query_vector = match self.embedder.embed(&planned.query).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!("query embedding failed, keyword ranking only: {}", e.message());
                None
            }
        };

        let (keyword_result, vector_result) = tokio::join!(
            async { snapshot.keyword_query(table, &planned.query, &planned.predicate, fetch) },
            async {
                match &query_vector {
                    Some(vector) => {
                        snapshot.vector_query(table, vector, &planned.predicate, fetch)
                    }
                    None => Ok(Vec::new()),
                }
            }
        );

        let vector_ranking = vector_result?;
        let (keyword_ranking, mut degraded) = match keyword_result {
            Ok(ranking) => (ranking, false),
            Err(e) => {
                warn!(
                    "keyword ranking unavailable, vector ranking only: {}",
                    e.message()
                );
                (Vec::new(), true)
            }
        };
        if query_vector.is_none() {
            degraded = true;
        }

        let (hits, candidates) = fuse_rrf(&keyword_ranking, &vector_ranking, planned.limit);
        Ok(SearchOutcome {
            hits,
            accounts_searched: planned.accounts_searched.clone(),
            candidates,
            elapsed_ms: started.elapsed().as_millis() as u64,
            degraded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_scores_follow_the_formula() {
        let keyword = vec![(1, 10.0), (2, 5.0)];
        let vector = vec![(2, 0.9), (3, 0.8)];
        let (hits, candidates) = fuse_rrf(&keyword, &vector, 10);
        assert_eq!(candidates, 3);
        // Document 2 appears on both sides: 1/62 + 1/61.
        assert_eq!(hits[0].id, 2);
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((hits[0].score - expected).abs() < 1e-12);
        // 1 (rank 1 keyword) beats 3 (rank 2 vector).
        assert_eq!(hits[1].id, 1);
        assert_eq!(hits[2].id, 3);
    }

    #[test]
    fn rrf_is_deterministic_with_ties() {
        let keyword = vec![(5, 1.0), (9, 1.0)];
        let vector = vec![(9, 1.0), (5, 1.0)];
        // Both documents score 1/61 + 1/62; the id breaks the tie.
        let (a, _) = fuse_rrf(&keyword, &vector, 10);
        let (b, _) = fuse_rrf(&keyword, &vector, 10);
        assert_eq!(a.iter().map(|h| h.id).collect::<Vec<_>>(), vec![5, 9]);
        assert_eq!(
            a.iter().map(|h| (h.id, h.score.to_bits())).collect::<Vec<_>>(),
            b.iter().map(|h| (h.id, h.score.to_bits())).collect::<Vec<_>>()
        );
    }

    #[test]
    fn absent_side_contributes_nothing() {
        let keyword: Vec<(u64, f32)> = Vec::new();
        let vector = vec![(7, 0.5)];
        let (hits, candidates) = fuse_rrf(&keyword, &vector, 10);
        assert_eq!(candidates, 1);
        assert_eq!(hits[0].id, 7);
        assert!((hits[0].score - 1.0 / 61.0).abs() < 1e-12);
    }
}
