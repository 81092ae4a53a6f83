//! C6 — Retriever. Hybrid-scored semantic search with optional re-rank and
//! token budgeting. `EmbeddingService`/`VectorStore`/`Reranker` are
//! injected traits so this module stays backend-agnostic; `vector-lancedb`
//! and `vector-qdrant` each supply one `VectorStore` impl elsewhere in the
//! crate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::types::{RetrievalRequest, RetrievalResult, RetrievedDocument};

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub doc_id: String,
    pub text: String,
    pub cosine: f64,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct CorpusStats {
    pub doc_count: usize,
    pub avg_doc_len: f64,
    pub doc_freq: HashMap<String, usize>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn search(&self, vector: &[f32], top_k: usize, filter: Option<&serde_json::Value>) -> Result<Vec<Candidate>, String>;
    async fn corpus_stats(&self) -> Option<CorpusStats> {
        None
    }
}

#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[Candidate]) -> Result<Vec<(String, f64)>, String>;
}

const SYNONYMS: &[(&str, &str)] = &[
    ("error", "problem"),
    ("fix", "solve"),
    ("create", "make"),
    ("analyze", "examine"),
];

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Up to `max_variants` expansions, always including the original verbatim
/// as the first entry.
fn expand_query(query: &str, max_variants: usize) -> Vec<String> {
    let mut variants = vec![query.to_string()];
    for (from, to) in SYNONYMS {
        if variants.len() >= max_variants {
            break;
        }
        if query.to_lowercase().contains(from) {
            variants.push(query.to_lowercase().replacen(from, to, 1));
        }
    }
    variants
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    use std::collections::HashSet;
    let sa: HashSet<&String> = a.iter().collect();
    let sb: HashSet<&String> = b.iter().collect();
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// `bm25_like(q, d)` exactly as specified: `k1=1.2, b=0.75`. Falls back to
/// Jaccard token overlap when corpus statistics are unavailable.
fn bm25_like(query_tokens: &[String], doc_tokens: &[String], stats: Option<&CorpusStats>) -> f64 {
    let stats = match stats {
        Some(s) if s.doc_count > 0 => s,
        _ => return jaccard(query_tokens, doc_tokens),
    };
    const K1: f64 = 1.2;
    const B: f64 = 0.75;
    let doc_len = doc_tokens.len() as f64;
    let mut tf: HashMap<&str, usize> = HashMap::new();
    for t in doc_tokens {
        *tf.entry(t.as_str()).or_insert(0) += 1;
    }
    let mut score = 0.0;
    for term in query_tokens {
        let f = *tf.get(term.as_str()).unwrap_or(&0) as f64;
        if f == 0.0 {
            continue;
        }
        let df = *stats.doc_freq.get(term).unwrap_or(&0) as f64;
        let n = stats.doc_count as f64;
        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
        let denom = f + K1 * (1.0 - B + B * doc_len / stats.avg_doc_len.max(1.0));
        score += idf * (f * (K1 + 1.0)) / denom;
    }
    score
}

pub struct Retriever {
    embedder: Arc<dyn EmbeddingService>,
    store: Arc<dyn VectorStore>,
    reranker: Option<Arc<dyn Reranker>>,
    query_expansion: bool,
    max_expansions: usize,
    rerank_enabled: bool,
    rerank_top_k: usize,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        store: Arc<dyn VectorStore>,
        reranker: Option<Arc<dyn Reranker>>,
        query_expansion: bool,
        max_expansions: usize,
        rerank_enabled: bool,
        rerank_top_k: usize,
    ) -> Self {
        Self { embedder, store, reranker, query_expansion, max_expansions, rerank_enabled, rerank_top_k }
    }

    /// The Retriever is advisory: any unexpected backend error yields an
    /// empty result rather than propagating.
    pub async fn retrieve(&self, req: &RetrievalRequest) -> RetrievalResult {
        match self.retrieve_inner(req).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "retrieval failed, returning empty advisory result");
                RetrievalResult { documents: vec![], truncated: false }
            }
        }
    }

    async fn retrieve_inner(&self, req: &RetrievalRequest) -> Result<RetrievalResult, RetrievalError> {
        let variants = if self.query_expansion {
            expand_query(&req.query, self.max_expansions)
        } else {
            vec![req.query.clone()]
        };

        let search_k = if self.rerank_enabled { self.rerank_top_k } else { req.top_k };

        let mut merged: HashMap<String, Candidate> = HashMap::new();
        for variant in &variants {
            let vector = self
                .embedder
                .embed(variant)
                .await
                .map_err(RetrievalError::EmbeddingUnavailable)?;
            let candidates = self.store.search(&vector, search_k, req.filter.as_ref()).await.unwrap_or_default();
            for c in candidates {
                merged
                    .entry(c.doc_id.clone())
                    .and_modify(|existing| {
                        if c.cosine > existing.cosine {
                            *existing = c.clone();
                        }
                    })
                    .or_insert(c);
            }
        }

        let stats = self.store.corpus_stats().await;
        let query_tokens = tokenize(&req.query);

        let mut scored: Vec<(Candidate, f64)> = merged
            .into_values()
            .map(|c| {
                let doc_tokens = tokenize(&c.text);
                let lexical = bm25_like(&query_tokens, &doc_tokens, stats.as_ref());
                let score = 0.7 * c.cosine + 0.3 * lexical;
                (c, score)
            })
            .collect();

        if self.rerank_enabled {
            if let Some(reranker) = &self.reranker {
                let candidates: Vec<Candidate> = scored.iter().map(|(c, _)| c.clone()).collect();
                if let Ok(reranked) = reranker.rerank(&req.query, &candidates).await {
                    let by_id: HashMap<String, f64> = reranked.into_iter().collect();
                    for (c, score) in scored.iter_mut() {
                        if let Some(new_score) = by_id.get(&c.doc_id) {
                            *score = *new_score;
                        }
                    }
                }
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let counter = tiktoken_rs::cl100k_base().ok();
        let mut documents = Vec::new();
        let mut token_total = 0usize;
        let mut truncated = false;

        for (candidate, score) in scored {
            let tokens = counter
                .as_ref()
                .map(|bpe| bpe.encode_with_special_tokens(&candidate.text).len())
                .unwrap_or_else(|| candidate.text.split_whitespace().count());
            if token_total + tokens > req.token_budget {
                truncated = true;
                break;
            }
            token_total += tokens;
            documents.push(RetrievedDocument { text: candidate.text, score, meta: candidate.meta });
        }

        Ok(RetrievalResult { documents, truncated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeEmbedder;
    #[async_trait]
    impl EmbeddingService for FakeEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct FailingEmbedder;
    #[async_trait]
    impl EmbeddingService for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
            Err("unavailable".into())
        }
    }

    struct FakeStore {
        candidates: Vec<Candidate>,
    }
    #[async_trait]
    impl VectorStore for FakeStore {
        async fn search(&self, _vector: &[f32], top_k: usize, _filter: Option<&serde_json::Value>) -> Result<Vec<Candidate>, String> {
            Ok(self.candidates.iter().take(top_k).cloned().collect())
        }
    }

    fn retriever(candidates: Vec<Candidate>) -> Retriever {
        Retriever::new(Arc::new(FakeEmbedder), Arc::new(FakeStore { candidates }), None, false, 3, false, 10)
    }

    #[tokio::test]
    async fn zero_token_budget_yields_empty_truncated_result() {
        let retriever = retriever(vec![Candidate { doc_id: "1".into(), text: "hello world".into(), cosine: 0.9, meta: json!({}) }]);
        let req = RetrievalRequest { query: "hello".into(), top_k: 5, token_budget: 0, filter: None };
        let result = retriever.retrieve(&req).await;
        assert!(result.documents.is_empty());
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn embedding_failure_returns_empty_untruncated_result() {
        let retriever = Retriever::new(Arc::new(FailingEmbedder), Arc::new(FakeStore { candidates: vec![] }), None, false, 3, false, 10);
        let req = RetrievalRequest { query: "hello".into(), top_k: 5, token_budget: 100, filter: None };
        let result = retriever.retrieve(&req).await;
        assert!(result.documents.is_empty());
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn expansion_with_zero_expansions_matches_disabled() {
        let candidates = vec![Candidate { doc_id: "1".into(), text: "a fix for the problem".into(), cosine: 0.5, meta: json!({}) }];
        let no_expand = retriever(candidates.clone());
        let mut expand = retriever(candidates);
        expand.query_expansion = true;
        expand.max_expansions = 1; // only the verbatim original is kept
        let req = RetrievalRequest { query: "unrelated query with no synonyms".into(), top_k: 5, token_budget: 1000, filter: None };
        let a = no_expand.retrieve(&req).await;
        let b = expand.retrieve(&req).await;
        assert_eq!(a.documents.len(), b.documents.len());
    }

    #[test]
    fn bm25_like_falls_back_to_jaccard_without_stats() {
        let q = tokenize("hello world");
        let d = tokenize("hello there world");
        let score = bm25_like(&q, &d, None);
        assert!(score > 0.0);
    }
}
