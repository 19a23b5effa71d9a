//! Capability detector.
//!
//! Explicitly constructed and passed around rather than a hidden singleton:
//! consumers hold a `&CapabilityDetector` and call [`CapabilityDetector::probe`]
//! whenever they need current reachability, and must not cache the result
//! beyond that one call — stores can flap between probe cycles.

use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::graph_store::GraphStore;
use crate::store::Store;
use crate::vector_store::{CollectionStatus, VectorStore, CHUNKS_COLLECTION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Full,
    LexicalOnly,
    SemanticOnly,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct Statuses {
    pub relational: bool,
    pub fts: bool,
    pub vector_store: bool,
    pub embedder: bool,
    pub graph_store: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilitySnapshot {
    pub fts_available: bool,
    pub semantic_available: bool,
    pub graph_available: bool,
    pub embedding_model: Option<String>,
    pub statuses: Statuses,
    pub search_mode: SearchMode,
}

pub struct CapabilityDetector<'a> {
    pub store: &'a Store,
    pub vector_store: Option<&'a VectorStore>,
    pub embedder: Option<&'a dyn EmbeddingProvider>,
    pub graph_store: Option<&'a GraphStore>,
}

impl<'a> CapabilityDetector<'a> {
    pub async fn probe(&self) -> CapabilitySnapshot {
        let relational = self.store.fts_search("__capability_probe__", 1).await.is_ok();
        // fts_search exercises both the relational connection and the FTS5
        // virtual table in one round trip; relational failure implies FTS failure.
        let fts = relational;

        let vector_reachable = match self.vector_store {
            Some(vs) => vs.is_reachable().await && matches!(vs.collection_status(CHUNKS_COLLECTION).await.status, CollectionStatus::Green | CollectionStatus::Yellow),
            None => false,
        };

        let embedder_reachable = match self.embedder {
            Some(e) => e.probe_availability().await.is_ok(),
            None => false,
        };

        let semantic_available = vector_reachable && embedder_reachable;

        let graph_available = match self.graph_store {
            Some(g) => g.is_connected().await,
            None => false,
        };

        let embedding_model = self.embedder.map(|e| e.model_name().to_string());

        let search_mode = if !relational {
            SearchMode::Unavailable
        } else if fts && semantic_available {
            SearchMode::Full
        } else if semantic_available {
            SearchMode::SemanticOnly
        } else if fts {
            SearchMode::LexicalOnly
        } else {
            SearchMode::Unavailable
        };

        CapabilitySnapshot {
            fts_available: fts,
            semantic_available,
            graph_available,
            embedding_model,
            statuses: Statuses {
                relational,
                fts,
                vector_store: vector_reachable,
                embedder: embedder_reachable,
                graph_store: graph_available,
            },
            search_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    async fn test_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.db");
        let pool = crate::db::connect(&path).await.unwrap();
        schema::run_migrations(&pool).await.unwrap();
        std::mem::forget(dir);
        Store::new(pool)
    }

    #[tokio::test]
    async fn no_collaborators_yields_lexical_only() {
        let store = test_store().await;
        let detector = CapabilityDetector { store: &store, vector_store: None, embedder: None, graph_store: None };
        let snapshot = detector.probe().await;
        assert!(snapshot.fts_available);
        assert!(!snapshot.semantic_available);
        assert!(!snapshot.graph_available);
        assert_eq!(snapshot.search_mode, SearchMode::LexicalOnly);
    }

    #[tokio::test]
    async fn closed_pool_is_unavailable() {
        let store = test_store().await;
        store.pool().close().await;
        let detector = CapabilityDetector { store: &store, vector_store: None, embedder: None, graph_store: None };
        let snapshot = detector.probe().await;
        assert_eq!(snapshot.search_mode, SearchMode::Unavailable);
    }
}
