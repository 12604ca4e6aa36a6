//! Search & rank over the index store.
//!
//! Lexical relevance (bm25 from FTS5) is the base order. With
//! `retrieval.semantic_rerank` on and an embedder configured, a candidate
//! pool is blended with cosine similarity:
//!
//! ```text
//! score = (1 - alpha) * lexical_norm + alpha * cosine_norm
//! ```
//!
//! Both signals are min-max normalized over the pool. Chunks without a
//! stored vector get `cosine_norm = 0`. Ties break on chunk id, so paging
//! is stable for an unchanged index.

use anyhow::Result;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::RetrievalConfig;
use crate::embedding::{self, Embedder};
use crate::planner::{self, QueryPlan};
use crate::store::{Candidate, CandidateQuery, Store};

/// A candidate with its final score.
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub candidate: Candidate,
    pub score: f64,
}

/// One page of ranked hits plus the approximate total.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub hits: Vec<RankedHit>,
    /// Approximate; see `RetrievalConfig::total_estimate_cap`.
    pub total_estimate: usize,
    pub reranked: bool,
}

pub async fn search(
    store: &Store,
    retrieval: &RetrievalConfig,
    embedder: Option<&dyn Embedder>,
    plan: &QueryPlan,
    roots: Vec<PathBuf>,
    k: usize,
    offset: usize,
) -> Result<SearchPage> {
    let query = CandidateQuery {
        fts: plan.engine_query.clone(),
        extensions: plan.filters.extensions.clone(),
        mtime_ranges: planner::year_ranges(&plan.filters.years),
        roots,
    };

    let (hits, reranked) = match embedder.filter(|_| retrieval.semantic_rerank) {
        Some(embedder) => match rerank_page(store, retrieval, embedder, plan, &query, k, offset).await? {
            Some(hits) => (hits, true),
            None => (lexical_page(store, &query, k, offset).await?, false),
        },
        None => (lexical_page(store, &query, k, offset).await?, false),
    };

    let counted = store.estimate_matches(&query, retrieval.total_estimate_cap).await?;
    let total_estimate = counted.max(offset + hits.len());

    tracing::debug!(
        query = %plan.engine_query,
        returned = hits.len(),
        total_estimate,
        reranked,
        "search"
    );

    Ok(SearchPage {
        hits,
        total_estimate,
        reranked,
    })
}

async fn lexical_page(
    store: &Store,
    query: &CandidateQuery,
    k: usize,
    offset: usize,
) -> Result<Vec<RankedHit>> {
    let candidates = store.search_candidates(query, k, offset).await?;
    Ok(candidates
        .into_iter()
        .map(|c| RankedHit {
            score: c.lexical,
            candidate: c,
        })
        .collect())
}

/// `None` when the query cannot be embedded; the caller falls back to the
/// lexical page.
async fn rerank_page(
    store: &Store,
    retrieval: &RetrievalConfig,
    embedder: &dyn Embedder,
    plan: &QueryPlan,
    query: &CandidateQuery,
    k: usize,
    offset: usize,
) -> Result<Option<Vec<RankedHit>>> {
    let pool_size = retrieval.candidate_k.max(offset + k);
    let candidates = store.search_candidates(query, pool_size, 0).await?;
    if candidates.is_empty() {
        return Ok(Some(Vec::new()));
    }

    let query_text = plan.terms.join(" ");
    let query_vec = match embedder.embed(&[query_text]).await {
        Ok(mut v) if !v.is_empty() => v.swap_remove(0),
        Ok(_) => return Ok(None),
        Err(e) => {
            tracing::warn!(error = %e, "query embedding failed, using lexical order");
            return Ok(None);
        }
    };

    let ids: Vec<i64> = candidates.iter().map(|c| c.chunk_id).collect();
    let vectors = store.embeddings_for(&ids).await?;
    let similarities: HashMap<i64, f64> = vectors
        .iter()
        .map(|(id, v)| (*id, embedding::cosine_similarity(&query_vec, v) as f64))
        .collect();

    let hits = blend(candidates, &similarities, retrieval.semantic_alpha);
    Ok(Some(hits.into_iter().skip(offset).take(k).collect()))
}

/// Blend lexical and cosine scores and sort best-first.
pub fn blend(candidates: Vec<Candidate>, similarities: &HashMap<i64, f64>, alpha: f64) -> Vec<RankedHit> {
    let lexical: Vec<f64> = candidates.iter().map(|c| c.lexical).collect();
    let lexical_norm = normalize_scores(&lexical);

    let present: Vec<f64> = similarities.values().copied().collect();
    let (v_min, v_max) = min_max(&present);

    let mut hits: Vec<RankedHit> = candidates
        .into_iter()
        .zip(lexical_norm)
        .map(|(c, k)| {
            let v = similarities
                .get(&c.chunk_id)
                .map(|s| normalize_one(*s, v_min, v_max))
                .unwrap_or(0.0);
            RankedHit {
                score: (1.0 - alpha) * k + alpha * v,
                candidate: c,
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.candidate.chunk_id.cmp(&b.candidate.chunk_id))
    });
    hits
}

/// Min-max normalize to `[0, 1]`; all-equal inputs map to 1.0.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    let (min, max) = min_max(scores);
    scores.iter().map(|s| normalize_one(*s, min, max)).collect()
}

fn min_max(scores: &[f64]) -> (f64, f64) {
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (min, max)
}

fn normalize_one(score: f64, min: f64, max: f64) -> f64 {
    if (max - min).abs() < f64::EPSILON {
        1.0
    } else {
        (score - min) / (max - min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::hash_text;
    use crate::embed_cmd::testing::LetterEmbedder;
    use crate::models::{FileMeta, NewChunk, SearchFilters};
    use sqlx::sqlite::SqlitePoolOptions;

    fn candidate(id: i64, lexical: f64) -> Candidate {
        Candidate {
            chunk_id: id,
            path: format!("/r/{}.txt", id),
            pointer: "chunk 1".into(),
            content: String::new(),
            extension: ".txt".into(),
            mtime: 0,
            lexical,
        }
    }

    #[test]
    fn normalize_edges() {
        assert!(normalize_scores(&[]).is_empty());
        assert_eq!(normalize_scores(&[5.0]), vec![1.0]);
        assert_eq!(normalize_scores(&[10.0, 5.0, 0.0]), vec![1.0, 0.5, 0.0]);
        assert_eq!(normalize_scores(&[3.0, 3.0]), vec![1.0, 1.0]);
        for s in normalize_scores(&[-5.0, 100.0, 42.0]) {
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn alpha_zero_keeps_lexical_order() {
        let sims = HashMap::from([(1, 0.1), (2, 0.9)]);
        let hits = blend(vec![candidate(1, 10.0), candidate(2, 5.0), candidate(3, 1.0)], &sims, 0.0);
        let order: Vec<i64> = hits.iter().map(|h| h.candidate.chunk_id).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn alpha_one_follows_similarity() {
        let sims = HashMap::from([(1, 0.1), (2, 0.9), (3, 0.5)]);
        let hits = blend(vec![candidate(1, 10.0), candidate(2, 5.0), candidate(3, 1.0)], &sims, 1.0);
        let order: Vec<i64> = hits.iter().map(|h| h.candidate.chunk_id).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn ties_break_on_chunk_id() {
        let hits = blend(vec![candidate(7, 1.0), candidate(3, 1.0)], &HashMap::new(), 0.3);
        assert_eq!(hits[0].candidate.chunk_id, 3);
    }

    async fn store_with(texts: &[&str]) -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let store = Store::new(pool);
        for (i, t) in texts.iter().enumerate() {
            let meta = FileMeta {
                path: PathBuf::from(format!("/r/f{}.txt", i)),
                size: t.len() as i64,
                mtime: 1_700_000_000_000,
                extension: ".txt".into(),
            };
            let chunk = NewChunk {
                seq: 0,
                pointer: "chunk 1".into(),
                content: t.to_string(),
                hash: hash_text(t),
            };
            store.replace_file(&meta, &[chunk]).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn lexical_paging_is_disjoint() {
        let texts: Vec<String> = (0..25).map(|i| format!("budget line {}", i)).collect();
        let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        let store = store_with(&refs).await;
        let plan = planner::plan("budget", &SearchFilters::default()).unwrap();
        let cfg = RetrievalConfig::default();

        let first = search(&store, &cfg, None, &plan, vec![PathBuf::from("/r")], 10, 0).await.unwrap();
        let second = search(&store, &cfg, None, &plan, vec![PathBuf::from("/r")], 10, 10).await.unwrap();
        assert_eq!(first.hits.len(), 10);
        assert_eq!(second.hits.len(), 10);
        assert_eq!(second.total_estimate, 25);
        for h in &second.hits {
            assert!(!first.hits.iter().any(|f| f.candidate.chunk_id == h.candidate.chunk_id));
        }
    }

    #[tokio::test]
    async fn rerank_without_vectors_keeps_all_hits() {
        let store = store_with(&["budget aaaa", "budget zzzz", "nothing here"]).await;
        let plan = planner::plan("budget", &SearchFilters::default()).unwrap();
        let cfg = RetrievalConfig {
            semantic_rerank: true,
            ..RetrievalConfig::default()
        };
        let page = search(&store, &cfg, Some(&LetterEmbedder), &plan, vec![PathBuf::from("/r")], 10, 0)
            .await
            .unwrap();
        assert!(page.reranked);
        assert_eq!(page.hits.len(), 2);
    }
}
