//! Entity deduplicator.
//!
//! Groups entities by `(lower(trim(name)), type)`, picks the
//! highest-confidence member as canonical, merges descriptions (keeping the
//! longest) and unions `source_document_ids`, then deletes the non-canonical
//! duplicates and repoints their relations at the canonical id. Idempotent:
//! running twice on an already-deduplicated store is a no-op.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::models::{Entity, EntityType};
use crate::store::Store;

#[derive(Debug, Clone, Serialize, Default)]
pub struct DedupReport {
    pub groups_examined: u64,
    pub duplicates_removed: u64,
}

pub struct Deduplicator<'a> {
    pub store: &'a Store,
}

impl<'a> Deduplicator<'a> {
    pub async fn run(&self) -> Result<DedupReport> {
        let entities = self.store.all_entities_grouped_for_dedup().await?;

        let mut groups: HashMap<(String, EntityType), Vec<Entity>> = HashMap::new();
        for entity in entities {
            let key = (entity.name.trim().to_lowercase(), entity.entity_type);
            groups.entry(key).or_default().push(entity);
        }

        let mut report = DedupReport::default();

        for (_, mut members) in groups {
            report.groups_examined += 1;
            if members.len() <= 1 {
                continue;
            }

            members.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
            let canonical_id = crate::models::canonical_entity_id(&members[0].name, members[0].entity_type);

            let mut merged_description = members[0].description.clone();
            let mut merged_doc_ids = members[0].source_document_ids.clone();
            let mut merged_confidence = members[0].confidence;

            for duplicate in &members[1..] {
                if duplicate.description.chars().count() > merged_description.chars().count() {
                    merged_description = duplicate.description.clone();
                }
                for doc_id in &duplicate.source_document_ids {
                    if !merged_doc_ids.contains(doc_id) {
                        merged_doc_ids.push(doc_id.clone());
                    }
                }
                merged_confidence = merged_confidence.max(duplicate.confidence);
            }

            let canonical = Entity {
                id: canonical_id.clone(),
                name: members[0].name.clone(),
                entity_type: members[0].entity_type,
                description: merged_description,
                source_document_ids: merged_doc_ids,
                confidence: merged_confidence,
                created_at: members[0].created_at,
                updated_at: Utc::now(),
            };
            self.store.upsert_entity(&canonical).await?;

            for duplicate in &members {
                if duplicate.id == canonical_id {
                    continue;
                }
                self.store.replace_entity_id_in_relations(&duplicate.id, &canonical_id).await?;
                self.store.delete_entity(&duplicate.id).await?;
                report.duplicates_removed += 1;
            }
        }

        info!(
            "dedup pass complete: {} groups examined, {} duplicates removed",
            report.groups_examined, report.duplicates_removed
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    async fn merges_case_and_whitespace_variants() {
        let store = test_store().await;
        let now = Utc::now();

        store
            .upsert_entity(&Entity {
                id: "id-a".into(),
                name: "OAuth2".into(),
                entity_type: EntityType::Tech,
                description: "short".into(),
                source_document_ids: vec!["doc1".into()],
                confidence: 0.6,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        store
            .upsert_entity(&Entity {
                id: "id-b".into(),
                name: " oauth2 ".into(),
                entity_type: EntityType::Tech,
                description: "a much longer description of the protocol".into(),
                source_document_ids: vec!["doc2".into()],
                confidence: 0.9,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let dedup = Deduplicator { store: &store };
        let report = dedup.run().await.unwrap();
        // Neither original row was keyed by its canonical id, so both are
        // replaced by the single canonical row.
        assert_eq!(report.duplicates_removed, 2);

        let canonical_id = crate::models::canonical_entity_id("OAuth2", EntityType::Tech);
        let canonical = store.get_entity(&canonical_id).await.unwrap().unwrap();
        assert_eq!(canonical.confidence, 0.9);
        assert_eq!(canonical.source_document_ids.len(), 2);
        assert_eq!(canonical.description, "a much longer description of the protocol");
    }

    #[tokio::test]
    async fn idempotent_on_second_run() {
        let store = test_store().await;
        let now = Utc::now();
        store
            .upsert_entity(&Entity {
                id: "id-a".into(),
                name: "Rust".into(),
                entity_type: EntityType::Tech,
                description: "a language".into(),
                source_document_ids: vec!["doc1".into()],
                confidence: 0.7,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let dedup = Deduplicator { store: &store };
        let first = dedup.run().await.unwrap();
        let second = dedup.run().await.unwrap();
        assert_eq!(first.duplicates_removed, 0);
        assert_eq!(second.duplicates_removed, 0);
    }
}
