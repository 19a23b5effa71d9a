//! Knowledge-augmented-generation query engine.
//!
//! Resolves a free-text query to a seed set of entities (relational
//! substring match, optionally fused with vector k-NN over entity
//! embeddings), then expands outward through the entity graph by BFS,
//! preferring the dedicated graph store and falling back to the relational
//! `relations` table when it is unavailable.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::Result;
use crate::graph_store::GraphStore;
use crate::models::{Entity, Relation};
use crate::store::Store;
use crate::vector_store::{VectorStore, ENTITIES_COLLECTION};

const K_RRF: f64 = 60.0;

#[derive(Debug, Clone, Serialize)]
pub struct RankedEntity {
    pub entity: Entity,
    pub hop: u32,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct KagResponse {
    pub entities: Vec<RankedEntity>,
    pub relations: Vec<Relation>,
}

pub struct KagEngine<'a> {
    pub store: &'a Store,
    pub graph_store: Option<&'a GraphStore>,
    pub vector_store: Option<&'a VectorStore>,
    pub embedder: Option<&'a dyn EmbeddingProvider>,
}

impl<'a> KagEngine<'a> {
    pub async fn kag_search(
        &self,
        query: &str,
        max_hops: u32,
        limit: usize,
        include_relations: bool,
        hybrid: bool,
    ) -> Result<KagResponse> {
        let lexical_matches = self.store.search_entities(query, (limit * 3) as i64).await?;

        let mut ranked: HashMap<String, (Entity, f64, Option<usize>, Option<usize>)> = HashMap::new();
        for (rank, entity) in lexical_matches.into_iter().enumerate() {
            ranked.insert(entity.id.clone(), (entity, 0.0, Some(rank), None));
        }

        let vector_available = self.vector_store.is_some() && self.embedder.is_some();
        if hybrid && vector_available {
            if let Ok(qv) = embed_query(self.embedder.unwrap(), query).await {
                if let Ok(hits) = self
                    .vector_store
                    .unwrap()
                    .search(ENTITIES_COLLECTION, qv, (limit * 3) as u64)
                    .await
                {
                    for (rank, hit) in hits.iter().enumerate() {
                        if let Ok(Some(entity)) = self.store.get_entity(&hit.id).await {
                            ranked
                                .entry(entity.id.clone())
                                .and_modify(|e| e.3 = Some(rank))
                                .or_insert((entity, 0.0, None, Some(rank)));
                        }
                    }
                }
            }
        }

        for (_, score, lex_rank, sem_rank) in ranked.values_mut() {
            let mut s = 0.0;
            if let Some(r) = lex_rank {
                s += 0.5 / (K_RRF + *r as f64 + 1.0);
            }
            if let Some(r) = sem_rank {
                s += 0.5 / (K_RRF + *r as f64 + 1.0);
            }
            *score = s;
        }

        let mut seeds: Vec<(Entity, f64)> = ranked.into_values().map(|(e, s, _, _)| (e, s)).collect();
        seeds.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        seeds.truncate(limit);

        let mut seen: HashSet<String> = seeds.iter().map(|(e, _)| e.id.clone()).collect();
        let mut all_ranked: Vec<RankedEntity> = seeds
            .iter()
            .map(|(e, s)| RankedEntity { entity: e.clone(), hop: 0, score: *s })
            .collect();
        let mut relations: Vec<Relation> = Vec::new();

        if max_hops >= 1 {
            let expansion_cap = limit * 3;
            for (seed_entity, _) in &seeds {
                let (neighbours, seed_relations) = self.expand(seed_entity, max_hops).await?;
                relations.extend(seed_relations);

                for neighbour_id in neighbours {
                    if seen.contains(&neighbour_id.entity_id) || all_ranked.len() >= expansion_cap {
                        continue;
                    }
                    if let Ok(Some(entity)) = self.store.get_entity(&neighbour_id.entity_id).await {
                        seen.insert(entity.id.clone());
                        all_ranked.push(RankedEntity {
                            score: entity.confidence / (neighbour_id.hop as f64 + 1.0),
                            entity,
                            hop: neighbour_id.hop,
                        });
                    }
                }
            }
        }

        all_ranked.sort_by(|a, b| {
            a.hop
                .cmp(&b.hop)
                .then(b.entity.confidence.partial_cmp(&a.entity.confidence).unwrap_or(std::cmp::Ordering::Equal))
        });
        all_ranked.truncate(limit.max(1) * 4);

        if !include_relations {
            relations.clear();
        } else {
            relations.sort_by(|a, b| a.id.cmp(&b.id));
            relations.dedup_by(|a, b| a.id == b.id);
        }

        Ok(KagResponse { entities: all_ranked, relations })
    }

    async fn expand(
        &self,
        seed: &Entity,
        max_hops: u32,
    ) -> Result<(Vec<crate::graph_store::Neighbour>, Vec<Relation>)> {
        if let Some(graph) = self.graph_store {
            if graph.is_connected().await {
                let neighbours = graph.neighbours(&seed.id, max_hops, 50).await.unwrap_or_default();
                return Ok((neighbours, Vec::new()));
            }
        }

        // Relational fallback: one-hop only, since the relations table has no
        // native path traversal.
        let relations = self.store.relations_for_entities(&[seed.id.clone()]).await?;
        let neighbours = relations
            .iter()
            .map(|r| {
                let other = if r.subject_entity_id == seed.id { &r.object_entity_id } else { &r.subject_entity_id };
                crate::graph_store::Neighbour {
                    entity_id: other.clone(),
                    name: String::new(),
                    entity_type: String::new(),
                    predicate: r.predicate.clone(),
                    hop: 1,
                }
            })
            .collect();
        Ok((neighbours, relations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;
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

    #[tokio::test]
    async fn finds_seed_entity_by_substring() {
        let store = test_store().await;
        let now = Utc::now();
        store
            .upsert_entity(&Entity {
                id: "e1".into(),
                name: "OAuth2".into(),
                entity_type: EntityType::Tech,
                description: "auth protocol".into(),
                source_document_ids: vec!["doc1".into()],
                confidence: 0.8,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let kag = KagEngine { store: &store, graph_store: None, vector_store: None, embedder: None };
        let response = kag.kag_search("oauth", 0, 10, false, false).await.unwrap();
        assert_eq!(response.entities.len(), 1);
        assert_eq!(response.entities[0].entity.name, "OAuth2");
    }

    #[tokio::test]
    async fn one_hop_expansion_via_relational_fallback() {
        let store = test_store().await;
        let now = Utc::now();
        let a = Entity {
            id: "a".into(),
            name: "ServiceA".into(),
            entity_type: EntityType::Tech,
            description: "".into(),
            source_document_ids: vec![],
            confidence: 0.9,
            created_at: now,
            updated_at: now,
        };
        let b = Entity {
            id: "b".into(),
            name: "ServiceB".into(),
            entity_type: EntityType::Tech,
            description: "".into(),
            source_document_ids: vec![],
            confidence: 0.6,
            created_at: now,
            updated_at: now,
        };
        store.upsert_entity(&a).await.unwrap();
        store.upsert_entity(&b).await.unwrap();
        store
            .upsert_relation(&Relation {
                id: "r1".into(),
                subject_entity_id: "a".into(),
                predicate: "calls".into(),
                object_entity_id: "b".into(),
                source_chunk_id: "c1".into(),
                confidence: 0.7,
            })
            .await
            .unwrap();

        let kag = KagEngine { store: &store, graph_store: None, vector_store: None, embedder: None };
        let response = kag.kag_search("ServiceA", 1, 10, true, false).await.unwrap();
        assert!(response.entities.iter().any(|r| r.entity.id == "b"));
        assert_eq!(response.relations.len(), 1);
    }
}
