// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use ahash::AHashMap;

const K1: f32 = 1.2;
const B: f32 = 0.75;
const MAX_TOKEN_LEN: usize = 40;

/// Inverted keyword index with BM25 ranking over weighted fields: a term
/// hit in the subject counts for more than the same hit in the body.
/// Rebuilt incrementally as fragments are published; queries never observe
/// a partially-updated index because the owner swaps whole instances.
pub struct KeywordIndex {
    postings: AHashMap<String, Vec<(u64, f32)>>,
    doc_lengths: AHashMap<u64, f32>,
    total_length: f64,
}

pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase().chars().take(MAX_TOKEN_LEN).collect())
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self {
            postings: AHashMap::new(),
            doc_lengths: AHashMap::new(),
            total_length: 0.0,
        }
    }

    pub fn build<I>(docs: I) -> Self
    where
        I: IntoIterator<Item = (u64, Vec<(f32, String)>)>,
    {
        let mut index = Self::new();
        for (id, fields) in docs {
            index.add(id, &fields);
        }
        index
    }

    pub fn add(&mut self, id: u64, fields: &[(f32, String)]) {
        let mut term_weights: AHashMap<String, f32> = AHashMap::new();
        let mut length = 0.0f32;
        for (weight, text) in fields {
            for token in tokenize(text) {
                *term_weights.entry(token).or_default() += weight;
                length += weight;
            }
        }
        if length == 0.0 {
            return;
        }
        self.total_length += f64::from(length);
        self.doc_lengths.insert(id, length);
        for (term, tf) in term_weights {
            self.postings.entry(term).or_default().push((id, tf));
        }
    }

    pub fn doc_count(&self) -> usize {
        self.doc_lengths.len()
    }

    /// BM25 ranking of `query` over documents accepted by `filter`.
    /// Ordering is deterministic: score descending, id ascending.
    pub fn search<F>(&self, query: &str, limit: usize, filter: F) -> Vec<(u64, f32)>
    where
        F: Fn(u64) -> bool,
    {
        let doc_count = self.doc_count();
        if doc_count == 0 {
            return Vec::new();
        }
        let avg_len = (self.total_length / doc_count as f64) as f32;

        let mut scores: AHashMap<u64, f32> = AHashMap::new();
        for term in tokenize(query) {
            let Some(postings) = self.postings.get(&term) else {
                continue;
            };
            let df = postings.len() as f32;
            let idf = (1.0 + (doc_count as f32 - df + 0.5) / (df + 0.5)).ln();
            for (id, tf) in postings {
                if !filter(*id) {
                    continue;
                }
                let len = self.doc_lengths.get(id).copied().unwrap_or(avg_len);
                let norm = tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * len / avg_len));
                *scores.entry(*id).or_default() += idf * norm;
            }
        }

        let mut ranked: Vec<(u64, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(limit);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(subject: &str, body: &str) -> Vec<(f32, String)> {
        vec![(2.0, subject.to_string()), (1.0, body.to_string())]
    }

    #[test]
    fn subject_hits_outrank_body_hits() {
        let index = KeywordIndex::build([
            (1, doc("invoice for march", "see attached")),
            (2, doc("meeting notes", "the invoice is overdue and the invoice total grew")),
            (3, doc("lunch", "no relevant terms here")),
        ]);
        let results = index.search("invoice", 10, |_| true);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn filter_excludes_documents() {
        let index = KeywordIndex::build([
            (1, doc("invoice", "")),
            (2, doc("invoice", "")),
        ]);
        let results = index.search("invoice", 10, |id| id != 1);
        assert_eq!(results.iter().map(|r| r.0).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn ordering_is_deterministic_across_builds() {
        let docs = || {
            (1..=50u64)
                .map(|id| (id, doc("shared subject", "shared body text")))
                .collect::<Vec<_>>()
        };
        let a = KeywordIndex::build(docs()).search("shared", 50, |_| true);
        let b = KeywordIndex::build(docs()).search("shared", 50, |_| true);
        assert_eq!(a, b);
        // Equal scores fall back to ascending id.
        assert_eq!(a.first().map(|r| r.0), Some(1));
    }

    #[test]
    fn unknown_terms_return_nothing() {
        let index = KeywordIndex::build([(1, doc("hello", "world"))]);
        assert!(index.search("zebra", 10, |_| true).is_empty());
    }
}
