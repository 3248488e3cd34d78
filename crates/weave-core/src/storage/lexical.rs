//! BM25 lexical scoring.
//!
//! Score for document D and query Q:
//!
//! ```text
//! score(D, Q) = Σ IDF(qi) · (f(qi, D) · (k1 + 1)) / (f(qi, D) + k1 · (1 - b + b · |D| / avgdl))
//! ```
//!
//! IDF is computed per query over the candidate corpus handed in, so
//! no persistent inverted index is needed. Monotonic in term relevance,
//! which is all the driver contract asks for.

use std::collections::HashMap;
use uuid::Uuid;

/// Term-frequency saturation and length-normalization parameters.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Config {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Bm25Config { k1: 1.5, b: 0.75 }
    }
}

/// Words too common to carry signal. Filtered from both query and docs.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "its", "of", "on", "or", "that", "the", "to", "was", "were", "will", "with",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Lowercase, split on whitespace/punctuation, drop stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|t| !t.is_empty() && !is_stopword(t))
        .map(str::to_string)
        .collect()
}

pub struct Bm25Scorer {
    config: Bm25Config,
}

impl Bm25Scorer {
    pub fn new() -> Self {
        Bm25Scorer {
            config: Bm25Config::default(),
        }
    }

    pub fn with_config(config: Bm25Config) -> Self {
        Bm25Scorer { config }
    }

    /// Score `docs` against `query` and return the top `k` with
    /// positive scores, best first.
    pub fn rank(&self, query: &str, docs: &[(Uuid, String)], k: usize) -> Vec<(Uuid, f32)> {
        if k == 0 || docs.is_empty() {
            return Vec::new();
        }
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let tokenized: Vec<(Uuid, Vec<String>)> = docs
            .iter()
            .map(|(id, text)| (*id, tokenize(text)))
            .collect();

        let n = tokenized.len() as f32;
        let avgdl = tokenized.iter().map(|(_, t)| t.len() as f32).sum::<f32>() / n;
        if avgdl == 0.0 {
            return Vec::new();
        }

        // IDF(t) = ln(1 + (N - df + 0.5) / (df + 0.5))
        let mut idf: HashMap<&str, f32> = HashMap::new();
        for term in &query_terms {
            if idf.contains_key(term.as_str()) {
                continue;
            }
            let df = tokenized
                .iter()
                .filter(|(_, tokens)| tokens.iter().any(|t| t == term))
                .count() as f32;
            idf.insert(term.as_str(), ((n - df + 0.5) / (df + 0.5)).ln_1p());
        }

        let Bm25Config { k1, b } = self.config;
        let mut scored: Vec<(Uuid, f32)> = tokenized
            .iter()
            .filter_map(|(id, tokens)| {
                let dl = tokens.len() as f32;
                let mut score = 0.0;
                for term in &query_terms {
                    let tf = tokens.iter().filter(|t| *t == term).count() as f32;
                    if tf == 0.0 {
                        continue;
                    }
                    let norm = k1 * (1.0 - b + b * dl / avgdl);
                    score += idf[term.as_str()] * (tf * (k1 + 1.0)) / (tf + norm);
                }
                (score > 0.0).then_some((*id, score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

impl Default for Bm25Scorer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<(Uuid, String)> {
        vec![
            (Uuid::now_v7(), "Alice works at Acme Corporation".into()),
            (Uuid::now_v7(), "Bob studies graph databases".into()),
            (Uuid::now_v7(), "Acme ships a graph database product".into()),
        ]
    }

    #[test]
    fn matching_docs_rank_above_nonmatching() {
        let scorer = Bm25Scorer::new();
        let docs = corpus();
        let ranked = scorer.rank("Alice Acme", &docs, 10);
        assert!(!ranked.is_empty());
        assert_eq!(ranked[0].0, docs[0].0);
        // Bob's doc shares no terms and must not appear.
        assert!(ranked.iter().all(|(id, _)| *id != docs[1].0));
    }

    #[test]
    fn rarer_terms_score_higher() {
        let scorer = Bm25Scorer::new();
        let docs = corpus();
        // "graph" appears in two docs, "alice" in one: the Alice doc wins
        // a query containing both of its distinctive terms.
        let ranked = scorer.rank("alice graph", &docs, 10);
        assert_eq!(ranked[0].0, docs[0].0);
    }

    #[test]
    fn empty_query_and_stopword_query_yield_nothing() {
        let scorer = Bm25Scorer::new();
        let docs = corpus();
        assert!(scorer.rank("", &docs, 10).is_empty());
        assert!(scorer.rank("the of and", &docs, 10).is_empty());
    }

    #[test]
    fn zero_k_yields_nothing() {
        let scorer = Bm25Scorer::new();
        assert!(scorer.rank("alice", &corpus(), 0).is_empty());
    }

    #[test]
    fn truncates_to_k() {
        let scorer = Bm25Scorer::new();
        let docs = corpus();
        let ranked = scorer.rank("graph database", &docs, 1);
        assert_eq!(ranked.len(), 1);
    }
}
