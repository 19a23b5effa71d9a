//! Hybrid search engine: lexical FTS, semantic k-NN, reciprocal-rank fusion,
//! MMR diversity reranking, and optional semantic rerank.
//!
//! - **Lexical** — FTS5 full-text search via [`crate::store::Store::fts_search`]
//!   (BM25-derived, higher is better).
//! - **Semantic** — cosine similarity over stored chunk embeddings via
//!   [`crate::vector_store::VectorStore`].
//! - **Hybrid** — reciprocal rank fusion of both, position-based rather than
//!   score-based so the two scales never need to be normalized against each
//!   other.
//!
//! Degraded mode: a hybrid search silently falls back to lexical-only when
//! the vector store or embedder is unavailable. Only an unreachable
//! relational store is a terminal failure.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::embedding::{cosine_similarity, embed_query, EmbeddingProvider};
use crate::error::Result;
use crate::store::Store;
use crate::vector_store::{VectorStore, CHUNKS_COLLECTION};

const K_RRF: f64 = 60.0;
const BIAS_DELTA: f64 = 0.2;
const MIN_WEIGHT: f64 = 0.1;
const MAX_WEIGHT: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Hybrid,
    Semantic,
    Lexical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveSearchMode {
    Full,
    LexicalOnly,
    SemanticOnly,
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub limit: usize,
    pub min_score: f64,
    pub semantic_weight: f64,
    pub mmr_lambda: f64,
    pub enable_mmr: bool,
    pub enable_rerank: bool,
    pub raw: bool,
    pub context_chunks: i64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Hybrid,
            limit: 10,
            min_score: 0.0,
            semantic_weight: 0.5,
            mmr_lambda: 0.5,
            enable_mmr: false,
            enable_rerank: false,
            raw: false,
            context_chunks: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub path: String,
    pub content: String,
    pub confidence: f64,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultItem>,
    pub total_hits: usize,
    pub search_mode: EffectiveSearchMode,
    pub processed: bool,
}

struct Candidate {
    chunk_id: String,
    document_id: String,
    ordinal: i64,
    content: String,
    lexical_rank: Option<usize>,
    semantic_rank: Option<usize>,
    semantic_score: Option<f32>,
    embedding_hint: Option<Vec<f32>>,
}

pub struct Searcher<'a> {
    pub store: &'a Store,
    pub vector_store: Option<&'a VectorStore>,
    pub embedder: Option<&'a dyn EmbeddingProvider>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bias {
    Lexical,
    LexicalBoost,
    Balanced,
}

impl<'a> Searcher<'a> {
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        if !self.store.is_reachable().await {
            return Ok(SearchResponse {
                results: Vec::new(),
                total_hits: 0,
                search_mode: EffectiveSearchMode::Unavailable,
                processed: false,
            });
        }

        let bias = detect_intent(query);
        let k = options.limit.saturating_mul(3).max(options.limit);

        let want_lexical = matches!(options.mode, SearchMode::Hybrid | SearchMode::Lexical);
        let want_semantic = matches!(options.mode, SearchMode::Hybrid | SearchMode::Semantic);
        let semantic_available = self.vector_store.is_some() && self.embedder.is_some();

        let lexical_hits = if want_lexical {
            self.store.fts_search(query, k as i64).await?
        } else {
            Vec::new()
        };

        let query_vector = if want_semantic && semantic_available {
            embed_query(self.embedder.unwrap(), query).await.ok()
        } else {
            None
        };

        let semantic_hits = if let (true, Some(qv)) = (want_semantic, query_vector.clone()) {
            self.vector_store
                .unwrap()
                .search(CHUNKS_COLLECTION, qv, k as u64)
                .await
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut effective_mode = match options.mode {
            SearchMode::Lexical => EffectiveSearchMode::LexicalOnly,
            SearchMode::Semantic => EffectiveSearchMode::SemanticOnly,
            SearchMode::Hybrid => {
                if semantic_available && !semantic_hits.is_empty() {
                    EffectiveSearchMode::Full
                } else {
                    EffectiveSearchMode::LexicalOnly
                }
            }
        };
        if matches!(options.mode, SearchMode::Semantic) && !semantic_available {
            effective_mode = EffectiveSearchMode::LexicalOnly;
        }

        let mut candidates: HashMap<String, Candidate> = HashMap::new();

        for (rank, hit) in lexical_hits.iter().enumerate() {
            if let Some(chunk) = self.store.get_chunk(&hit.chunk_id).await? {
                candidates.insert(
                    chunk.id.clone(),
                    Candidate {
                        chunk_id: chunk.id,
                        document_id: chunk.document_id,
                        ordinal: chunk.ordinal,
                        content: chunk.content,
                        lexical_rank: Some(rank),
                        semantic_rank: None,
                        semantic_score: None,
                        embedding_hint: None,
                    },
                );
            }
        }

        for (rank, hit) in semantic_hits.iter().enumerate() {
            candidates
                .entry(hit.id.clone())
                .and_modify(|c| {
                    c.semantic_rank = Some(rank);
                    c.semantic_score = Some(hit.score);
                })
                .or_insert_with(|| Candidate {
                    chunk_id: hit.id.clone(),
                    document_id: hit
                        .payload
                        .get("document_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    ordinal: hit.payload.get("ordinal").and_then(|v| v.as_i64()).unwrap_or(0),
                    content: String::new(),
                    lexical_rank: None,
                    semantic_rank: Some(rank),
                    semantic_score: Some(hit.score),
                    embedding_hint: None,
                });
        }

        // Semantic-only candidates don't carry content from the vector payload;
        // hydrate from the relational store.
        for candidate in candidates.values_mut() {
            if candidate.content.is_empty() {
                if let Ok(Some(chunk)) = self.store.get_chunk(&candidate.chunk_id).await {
                    candidate.content = chunk.content;
                }
            }
        }

        let (w_lex, w_sem) = fusion_weights(options.semantic_weight, bias);

        let mut scored: Vec<(Candidate, f64)> = candidates
            .into_values()
            .map(|c| {
                let mut score = 0.0;
                if let Some(r) = c.lexical_rank {
                    score += w_lex / (K_RRF + r as f64 + 1.0);
                }
                if let Some(r) = c.semantic_rank {
                    score += w_sem / (K_RRF + r as f64 + 1.0);
                }
                (c, score)
            })
            .filter(|(_, score)| *score >= options.min_score)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let total_hits = scored.len();

        let mut selected: Vec<(Candidate, f64)> = if options.enable_mmr && !scored.is_empty() {
            mmr_rerank(scored, options.mmr_lambda, options.limit)
        } else {
            scored.into_iter().take(options.limit).collect()
        };

        if options.enable_rerank && semantic_available && want_lexical && want_semantic {
            if let Some(qv) = query_vector.clone() {
                if let Some(embedder) = self.embedder {
                    selected = semantic_rerank(embedder, &qv, selected).await;
                }
            }
        }

        let mut results = Vec::with_capacity(selected.len());
        for (candidate, score) in &selected {
            let mut content = candidate.content.clone();
            if options.context_chunks > 0 {
                for offset in 1..=options.context_chunks {
                    if let Ok(Some(adjacent)) = self
                        .store
                        .adjacent_chunk(&candidate.document_id, candidate.ordinal + offset)
                        .await
                    {
                        content.push_str("\n\n");
                        content.push_str(&adjacent.content);
                    }
                }
            }

            let path = self
                .store
                .get_document(&candidate.document_id)
                .await
                .ok()
                .flatten()
                .map(|d| d.relative_path)
                .unwrap_or_else(|| candidate.document_id.clone());

            results.push(SearchResultItem {
                path,
                content,
                confidence: *score,
                chunk_count: 1,
            });
        }

        let processed = !options.raw;
        if processed {
            results = merge_adjacent_and_filter_boilerplate(results);
        }

        Ok(SearchResponse {
            results,
            total_hits,
            search_mode: effective_mode,
            processed,
        })
    }
}

/// Quoted phrases bias toward lexical matching; runs of capitalized tokens or
/// tokens with internal caps/digits (acronyms, identifiers) boost lexical too.
fn detect_intent(query: &str) -> Bias {
    if query.contains('"') {
        return Bias::Lexical;
    }

    let tokens: Vec<&str> = query.split_whitespace().collect();
    let mut consecutive_caps = 0;
    for token in &tokens {
        let starts_cap = token.chars().next().map(|c| c.is_uppercase()).unwrap_or(false);
        let has_internal_caps_or_digit = token.chars().skip(1).any(|c| c.is_uppercase() || c.is_ascii_digit());
        if has_internal_caps_or_digit {
            return Bias::LexicalBoost;
        }
        if starts_cap {
            consecutive_caps += 1;
            if consecutive_caps >= 2 {
                return Bias::LexicalBoost;
            }
        } else {
            consecutive_caps = 0;
        }
    }
    Bias::Balanced
}

fn fusion_weights(semantic_weight: f64, bias: Bias) -> (f64, f64) {
    let sem = semantic_weight.clamp(0.0, 1.0);
    let lex = 1.0 - sem;
    let (lex, sem) = match bias {
        Bias::Lexical | Bias::LexicalBoost => (lex + BIAS_DELTA, sem - BIAS_DELTA),
        Bias::Balanced => (lex, sem),
    };
    (lex.clamp(MIN_WEIGHT, MAX_WEIGHT), sem.clamp(MIN_WEIGHT, MAX_WEIGHT))
}

/// Iteratively pick the candidate maximizing `lambda*relevance -
/// (1-lambda)*max_sim_to_selected`, using Jaccard token overlap as the
/// similarity measure (cheap, no embeddings required at this stage).
fn mmr_rerank(mut pool: Vec<(Candidate, f64)>, lambda: f64, limit: usize) -> Vec<(Candidate, f64)> {
    let mut selected: Vec<(Candidate, f64)> = Vec::new();
    let token_sets: Vec<HashSet<String>> = pool.iter().map(|(c, _)| tokenize(&c.content)).collect();
    let mut selected_indices: Vec<usize> = Vec::new();

    while selected.len() < limit && !pool.is_empty() {
        let mut best_idx = 0usize;
        let mut best_score = f64::MIN;
        for (i, (_, relevance)) in pool.iter().enumerate() {
            let max_sim = selected_indices
                .iter()
                .map(|&si| jaccard(&token_sets[i], &token_sets[si]))
                .fold(0.0f64, f64::max);
            let mmr_score = lambda * relevance - (1.0 - lambda) * max_sim;
            if mmr_score > best_score {
                best_score = mmr_score;
                best_idx = i;
            }
        }
        selected_indices.push(best_idx);
        selected.push(pool.remove(best_idx));
        // keep token_sets aligned is unnecessary past this point since we only
        // read by original index stored in selected_indices before removal;
        // recompute is avoided by not removing from token_sets.
        if pool.is_empty() {
            break;
        }
    }
    selected
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace().map(|t| t.to_lowercase()).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Re-embed the query once and re-rank the top results by cosine similarity
/// against a freshly computed embedding of their own content.
async fn semantic_rerank(
    embedder: &dyn EmbeddingProvider,
    query_vector: &[f32],
    mut candidates: Vec<(Candidate, f64)>,
) -> Vec<(Candidate, f64)> {
    let texts: Vec<String> = candidates.iter().map(|(c, _)| c.content.clone()).collect();
    if let Ok(vectors) = embedder.embed_batch(&texts).await {
        for ((candidate, score), vector) in candidates.iter_mut().zip(vectors.into_iter()) {
            candidate.embedding_hint = Some(vector.clone());
            *score = cosine_similarity(query_vector, &vector) as f64;
        }
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    }
    candidates
}

/// Merge results that are adjacent chunks of the same document, and drop
/// results that are only boilerplate (very short, no alphabetic content).
fn merge_adjacent_and_filter_boilerplate(results: Vec<SearchResultItem>) -> Vec<SearchResultItem> {
    let mut merged: Vec<SearchResultItem> = Vec::new();
    for result in results {
        if is_boilerplate(&result.content) {
            continue;
        }
        if let Some(last) = merged.last_mut() {
            if last.path == result.path {
                last.content.push_str("\n\n");
                last.content.push_str(&result.content);
                last.chunk_count += 1;
                last.confidence = last.confidence.max(result.confidence);
                continue;
            }
        }
        merged.push(result);
    }
    merged
}

fn is_boilerplate(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.chars().count() < 8 {
        return true;
    }
    !trimmed.chars().any(|c| c.is_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use crate::models::{Document, SyncMode};
    use crate::schema;
    use chrono::Utc;

    async fn test_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.db");
        let pool = crate::db::connect(&path).await.unwrap();
        schema::run_migrations(&pool).await.unwrap();
        std::mem::forget(dir);
        Store::new(pool)
    }

    async fn seed(store: &Store, source_id: &str, rel_path: &str, text: &str) {
        store
            .upsert_source(&crate::models::Source {
                id: source_id.into(),
                name: source_id.into(),
                absolute_path: "/tmp".into(),
                patterns: vec![],
                excludes: vec![],
                sync_mode: SyncMode::Manual,
                added_at: Utc::now(),
                last_synced_at: None,
            })
            .await
            .ok();
        let doc_id = format!("{source_id}:{rel_path}");
        let doc = Document {
            id: doc_id.clone(),
            source_id: source_id.into(),
            relative_path: rel_path.into(),
            title: rel_path.into(),
            content_hash: "h".into(),
            size_bytes: text.len() as i64,
            mtime: Utc::now(),
            indexed_at: Utc::now(),
        };
        let chunks = chunk_text(&doc_id, text, 1200, 150);
        store.replace_document_chunks(&doc, &chunks).await.unwrap();
    }

    #[tokio::test]
    async fn lexical_only_search_finds_term() {
        let store = test_store().await;
        seed(&store, "s1", "a.md", "The Oak Ridge laboratory studies neutrons.").await;

        let searcher = Searcher { store: &store, vector_store: None, embedder: None };
        let options = SearchOptions { mode: SearchMode::Lexical, ..Default::default() };
        let response = searcher.search("Oak Ridge", &options).await.unwrap();

        assert_eq!(response.search_mode, EffectiveSearchMode::LexicalOnly);
        assert_eq!(response.results.len(), 1);
        assert!(response.results[0].content.contains("Oak Ridge"));
    }

    #[tokio::test]
    async fn hybrid_without_vector_store_degrades_to_lexical() {
        let store = test_store().await;
        seed(&store, "s1", "a.md", "Authentication uses OAuth2 end to end.").await;

        let searcher = Searcher { store: &store, vector_store: None, embedder: None };
        let options = SearchOptions::default();
        let response = searcher.search("OAuth2", &options).await.unwrap();

        assert_eq!(response.search_mode, EffectiveSearchMode::LexicalOnly);
        assert!(!response.results.is_empty());
    }

    #[tokio::test]
    async fn unreachable_store_returns_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.db");
        let pool = crate::db::connect(&path).await.unwrap();
        schema::run_migrations(&pool).await.unwrap();
        let store = Store::new(pool);
        store.pool().close().await;

        let searcher = Searcher { store: &store, vector_store: None, embedder: None };
        let response = searcher.search("anything", &SearchOptions::default()).await.unwrap();
        assert_eq!(response.search_mode, EffectiveSearchMode::Unavailable);
        assert!(response.results.is_empty());
    }

    #[test]
    fn quoted_phrase_biases_lexical() {
        assert_eq!(detect_intent("\"oauth2 flow\""), Bias::Lexical);
    }

    #[test]
    fn consecutive_caps_bias_lexical_boost() {
        assert_eq!(detect_intent("Oak Ridge National Laboratory"), Bias::LexicalBoost);
    }

    #[test]
    fn plain_query_is_balanced() {
        assert_eq!(detect_intent("how does auth work"), Bias::Balanced);
    }

    #[test]
    fn fusion_weights_sum_near_one_when_balanced() {
        let (lex, sem) = fusion_weights(0.5, Bias::Balanced);
        assert!((lex + sem - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fusion_weights_respect_semantic_weight_extremes() {
        let (lex, _sem) = fusion_weights(1.0, Bias::Balanced);
        assert!((lex - MIN_WEIGHT).abs() < 1e-9);
        let (_lex, sem) = fusion_weights(0.0, Bias::Balanced);
        assert!((sem - MIN_WEIGHT).abs() < 1e-9);
    }

    #[test]
    fn boilerplate_is_flagged() {
        assert!(is_boilerplate("- - -"));
        assert!(is_boilerplate("12345"));
        assert!(!is_boilerplate("Oak Ridge studies neutrons"));
    }
}
