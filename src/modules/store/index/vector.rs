// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::store::schema::EMBEDDING_DIM;

/// Nearest-neighbour index over the embedding column. Vectors arrive
/// unit-normalised from the embedder, so cosine similarity reduces to a dot
/// product. The layout is a flat, contiguous scan; at the tens-of-thousands
/// scale this store targets, the full sweep stays well inside the search
/// latency budget and is exactly reproducible.
pub struct VectorIndex {
    ids: Vec<u64>,
    vectors: Vec<f32>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn build<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (u64, Vec<f32>)>,
    {
        let mut index = Self::new();
        for (id, vector) in rows {
            index.add(id, &vector);
        }
        index
    }

    /// Zero vectors (rows still awaiting embedding) are excluded: they can
    /// never be a semantic neighbour.
    pub fn add(&mut self, id: u64, vector: &[f32]) {
        if vector.len() != EMBEDDING_DIM || vector.iter().all(|v| *v == 0.0) {
            return;
        }
        self.ids.push(id);
        self.vectors.extend_from_slice(vector);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Top-`limit` by cosine similarity among documents accepted by
    /// `filter`. Ordering is deterministic: score descending, id ascending.
    pub fn search<F>(&self, query: &[f32], limit: usize, filter: F) -> Vec<(u64, f32)>
    where
        F: Fn(u64) -> bool,
    {
        if query.len() != EMBEDDING_DIM {
            return Vec::new();
        }
        let mut scored: Vec<(u64, f32)> = Vec::new();
        for (row, id) in self.ids.iter().enumerate() {
            if !filter(*id) {
                continue;
            }
            let offset = row * EMBEDDING_DIM;
            let chunk = &self.vectors[offset..offset + EMBEDDING_DIM];
            let dot: f32 = chunk.iter().zip(query.iter()).map(|(a, b)| a * b).sum();
            scored.push((*id, dot));
        }
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(limit);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(direction: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[direction] = 1.0;
        v
    }

    #[test]
    fn nearest_neighbour_wins() {
        let mut blended = vec![0.0; EMBEDDING_DIM];
        blended[0] = 0.8;
        blended[1] = 0.6;
        let index = VectorIndex::build([(1, unit(0)), (2, unit(1)), (3, blended)]);
        let results = index.search(&unit(0), 2, |_| true);
        assert_eq!(results[0].0, 1);
        assert_eq!(results[1].0, 3);
    }

    #[test]
    fn zero_vectors_are_not_indexed() {
        let index = VectorIndex::build([(1, vec![0.0; EMBEDDING_DIM]), (2, unit(5))]);
        assert_eq!(index.len(), 1);
        let results = index.search(&unit(5), 10, |_| true);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 2);
    }

    #[test]
    fn wrong_width_vectors_are_rejected() {
        let index = VectorIndex::build([(1, vec![1.0; 12])]);
        assert!(index.is_empty());
    }

    #[test]
    fn filter_is_applied_before_ranking() {
        let index = VectorIndex::build([(1, unit(0)), (2, unit(0))]);
        let results = index.search(&unit(0), 10, |id| id == 2);
        assert_eq!(results.iter().map(|r| r.0).collect::<Vec<_>>(), vec![2]);
    }
}
