//! Entity/relation extraction pipeline: selects eligible chunks, runs them
//! through the LLM extractor with bounded worker concurrency, canonicalises
//! extracted entities, writes them in one relational transaction per chunk,
//! and mirrors the result to the graph store.
//!
//! Chunks are loaded into memory before any processing starts, so the
//! worker tasks never hold a cursor open against the same connection pool
//! that mirroring writes use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::Result;
use crate::events::{Event, EventBus, ExtractCompleted, ExtractProgress};
use crate::extractor::Extractor;
use crate::graph_store::GraphStore;
use crate::models::{canonical_entity_id, Chunk, Entity, EntityType, ExtractionState, Relation};
use crate::store::Store;

const DEFAULT_MAX_ATTEMPTS: i64 = 2;

#[derive(Debug, Clone, Copy)]
pub enum ChunkSelection {
    /// Chunks with no extraction_status row.
    Pending,
    /// Chunks whose status is `error` (retry).
    Retry,
    /// All chunks regardless of status.
    Force,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ExtractionReport {
    pub processed: u64,
    pub entities: u64,
    pub relations: u64,
    pub errors: u64,
}

pub struct ExtractionPipeline {
    pub store: Store,
    pub extractor: Extractor,
    pub graph_store: Option<GraphStore>,
    pub events: Option<EventBus>,
    pub workers: usize,
    pub max_attempts: i64,
}

impl ExtractionPipeline {
    pub async fn run(&self, selection: ChunkSelection, limit: i64) -> Result<ExtractionReport> {
        let chunks = self.select_chunks(selection, limit).await?;
        let total = chunks.len() as u64;
        if total == 0 {
            return Ok(ExtractionReport::default());
        }

        let semaphore = Arc::new(Semaphore::new(self.workers.max(1)));
        let processed = Arc::new(AtomicU64::new(0));
        let entities_count = Arc::new(AtomicU64::new(0));
        let relations_count = Arc::new(AtomicU64::new(0));
        let errors_count = Arc::new(AtomicU64::new(0));
        let started = Instant::now();

        let mut join_set = tokio::task::JoinSet::new();

        for chunk in chunks {
            let permit = semaphore.clone();
            let store = self.store.clone();
            let extractor = self.extractor.clone();
            let graph_store = self.graph_store.clone();
            let events = self.events.clone();
            let max_attempts = self.max_attempts;
            let processed = processed.clone();
            let entities_count = entities_count.clone();
            let relations_count = relations_count.clone();
            let errors_count = errors_count.clone();

            join_set.spawn(async move {
                let _permit = permit.acquire_owned().await;
                let result = process_chunk(&store, &extractor, graph_store.as_ref(), &chunk, max_attempts).await;

                match result {
                    Ok((n_entities, n_relations)) => {
                        entities_count.fetch_add(n_entities as u64, Ordering::Relaxed);
                        relations_count.fetch_add(n_relations as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("extraction failed for chunk {}: {e}", chunk.id);
                        errors_count.fetch_add(1, Ordering::Relaxed);
                    }
                }

                let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(events) = &events {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    let mean = if done > 0 { elapsed_ms / done } else { 0 };
                    let remaining = total.saturating_sub(done);
                    events.publish(Event::new(
                        "kag_extract_progress",
                        ExtractProgress { processed: done, total, eta_ms: mean * remaining },
                    ));
                }
            });
        }

        while join_set.join_next().await.is_some() {}

        let report = ExtractionReport {
            processed: processed.load(Ordering::Relaxed),
            entities: entities_count.load(Ordering::Relaxed),
            relations: relations_count.load(Ordering::Relaxed),
            errors: errors_count.load(Ordering::Relaxed),
        };

        if let Some(events) = &self.events {
            events.publish(Event::new(
                "kag_extract_completed",
                ExtractCompleted {
                    processed: report.processed,
                    entities: report.entities,
                    relations: report.relations,
                    errors: report.errors,
                },
            ));
        }

        info!(
            "extraction run complete: {} chunks, {} entities, {} relations, {} errors",
            report.processed, report.entities, report.relations, report.errors
        );

        Ok(report)
    }

    async fn select_chunks(&self, selection: ChunkSelection, limit: i64) -> Result<Vec<Chunk>> {
        match selection {
            ChunkSelection::Pending => self.store.chunks_without_extraction_status(limit).await,
            ChunkSelection::Retry => self.store.chunks_with_status(ExtractionState::Error, limit).await,
            ChunkSelection::Force => self.store.all_chunks(limit).await,
        }
    }
}

async fn process_chunk(
    store: &Store,
    extractor: &Extractor,
    graph_store: Option<&GraphStore>,
    chunk: &Chunk,
    max_attempts: i64,
) -> Result<(usize, usize)> {
    store.set_extraction_pending(&chunk.id).await?;

    let document = store.get_document(&chunk.document_id).await?;
    let title = document.map(|d| d.title).unwrap_or_else(|| chunk.document_id.clone());

    let extraction = match extractor.extract(&title, &chunk.content).await {
        Ok(result) => result,
        Err(e) => {
            store.record_extraction_error(&chunk.id, &e.to_string(), max_attempts).await?;
            return Err(e);
        }
    };

    let now = Utc::now();
    let mut canonical_ids = Vec::with_capacity(extraction.entities.len());
    let mut entity_records = Vec::with_capacity(extraction.entities.len());

    for entity in &extraction.entities {
        let entity_type = EntityType::parse(&entity.entity_type);
        let id = canonical_entity_id(&entity.name, entity_type);
        canonical_ids.push((entity.name.clone(), id.clone()));

        entity_records.push(Entity {
            id,
            name: entity.name.clone(),
            entity_type,
            description: entity.description.clone(),
            source_document_ids: vec![chunk.document_id.clone()],
            confidence: entity.confidence,
            created_at: now,
            updated_at: now,
        });
    }

    let mut relation_records = Vec::with_capacity(extraction.relations.len());
    for relation in &extraction.relations {
        let subject_id = canonical_ids
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&relation.subject))
            .map(|(_, id)| id.clone());
        let object_id = canonical_ids
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&relation.object))
            .map(|(_, id)| id.clone());

        let (Some(subject_id), Some(object_id)) = (subject_id, object_id) else {
            continue;
        };

        let relation_id = crate::models::content_hash(
            format!("{subject_id}\0{}\0{object_id}", relation.predicate).as_bytes(),
        );
        relation_records.push(Relation {
            id: relation_id,
            subject_entity_id: subject_id,
            predicate: relation.predicate.clone(),
            object_entity_id: object_id,
            source_chunk_id: chunk.id.clone(),
            confidence: relation.confidence,
        });
    }

    store.upsert_entities_and_relations(&entity_records, &relation_records).await?;

    // Graph mirroring is best-effort against a separate external store and
    // happens only after the relational transaction has committed.
    if let Some(graph) = graph_store {
        for entity in &entity_records {
            if let Err(e) = graph.upsert_entity(&entity.id, &entity.name, entity.entity_type.as_str()).await {
                warn!("graph mirror failed for entity {}: {e}", entity.id);
            }
        }
        for relation in &relation_records {
            if let Err(e) = graph.upsert_relation(relation).await {
                warn!("graph mirror failed for relation {}: {e}", relation.id);
            }
        }
    }

    store.set_extraction_completed(&chunk.id).await?;
    Ok((entity_records.len(), relation_records.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AiConfig;
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
    async fn pipeline_with_no_chunks_is_a_noop() {
        let store = test_store().await;
        let ai = AiConfig { provider: "ollama".into(), model: Some("llama3".into()), ..Default::default() };
        let extractor = Extractor::new(&ai).unwrap();
        let pipeline = ExtractionPipeline {
            store,
            extractor,
            graph_store: None,
            events: None,
            workers: 2,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        };
        let report = pipeline.run(ChunkSelection::Pending, 10).await.unwrap();
        assert_eq!(report.processed, 0);
    }
}
