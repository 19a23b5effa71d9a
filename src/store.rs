//! Relational store: transactional CRUD over sources, documents, chunks, FTS,
//! entities, relations, and extraction status.
//!
//! All multi-table writes happen in a single transaction. The only fatal
//! error class for mutating operations is an unreachable store itself —
//! callers translate `sqlx::Error` into [`crate::error::ConduitError::StoreUnavailable`]
//! at the edges that need to report degraded mode.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::error::Result;
use crate::models::{
    Chunk, Document, Entity, EntityType, ExtractionState, ExtractionStatus, Relation, Source,
    SyncMode,
};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// One FTS hit: chunk id, BM25-like rank score, and a highlighted snippet.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub chunk_id: String,
    pub rank_score: f64,
    pub snippet: String,
}

#[derive(Debug, Clone, Default)]
pub struct SourceDeleteCounts {
    pub documents_deleted: i64,
    pub vectors_deleted: i64,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn is_reachable(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    // ---- Sources ----

    pub async fn upsert_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, name, absolute_path, patterns, excludes, sync_mode, added_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                absolute_path = excluded.absolute_path,
                patterns = excluded.patterns,
                excludes = excluded.excludes,
                sync_mode = excluded.sync_mode,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(&source.id)
        .bind(&source.name)
        .bind(&source.absolute_path)
        .bind(serde_json::to_string(&source.patterns).unwrap_or_default())
        .bind(serde_json::to_string(&source.excludes).unwrap_or_default())
        .bind(match source.sync_mode {
            SyncMode::Manual => "manual",
            SyncMode::Auto => "auto",
        })
        .bind(source.added_at.timestamp())
        .bind(source.last_synced_at.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_source_synced(&self, source_id: &str) -> Result<()> {
        sqlx::query("UPDATE sources SET last_synced_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            "SELECT id, name, absolute_path, patterns, excludes, sync_mode, added_at, last_synced_at FROM sources ORDER BY added_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_source).collect())
    }

    pub async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        let row = sqlx::query(
            "SELECT id, name, absolute_path, patterns, excludes, sync_mode, added_at, last_synced_at FROM sources WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_source))
    }

    /// Delete a source and everything beneath it (documents, chunks, FTS rows,
    /// extraction status). Returns counts; vector deletion is the caller's
    /// responsibility (the relational store doesn't know about the vector
    /// store), so `vectors_deleted` here is always the count of chunks that
    /// the caller should also remove from the vector store.
    pub async fn delete_source(&self, source_id: &str) -> Result<SourceDeleteCounts> {
        let mut tx = self.pool.begin().await?;

        let doc_ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE source_id = ?")
                .bind(source_id)
                .fetch_all(&mut *tx)
                .await?;

        let mut chunk_count: i64 = 0;
        for doc_id in &doc_ids {
            let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE document_id = ?")
                .bind(doc_id)
                .fetch_all(&mut *tx)
                .await?;
            chunk_count += ids.len() as i64;

            for chunk_id in &ids {
                sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                    .bind(chunk_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM extraction_status WHERE chunk_id = ?")
                    .bind(chunk_id)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
        }

        let documents_deleted =
            sqlx::query("DELETE FROM documents WHERE source_id = ?")
                .bind(source_id)
                .execute(&mut *tx)
                .await?
                .rows_affected() as i64;

        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(SourceDeleteCounts {
            documents_deleted,
            vectors_deleted: chunk_count,
        })
    }

    // ---- Documents ----

    pub async fn get_document_by_path(
        &self,
        source_id: &str,
        relative_path: &str,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, source_id, relative_path, title, content_hash, size_bytes, mtime, indexed_at FROM documents WHERE source_id = ? AND relative_path = ?",
        )
        .bind(source_id)
        .bind(relative_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_document))
    }

    pub async fn list_documents(&self, source_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, source_id, relative_path, title, content_hash, size_bytes, mtime, indexed_at FROM documents WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_document).collect())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, source_id, relative_path, title, content_hash, size_bytes, mtime, indexed_at FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_document))
    }

    /// Upsert a document and atomically replace its chunks + FTS rows in one
    /// transaction. Returns the ids of chunks removed (for vector-store cleanup)
    /// and the newly written chunks (for vector-store upsert, outside this txn).
    pub async fn replace_document_chunks(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_id, relative_path, title, content_hash, size_bytes, mtime, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, relative_path) DO UPDATE SET
                title = excluded.title,
                content_hash = excluded.content_hash,
                size_bytes = excluded.size_bytes,
                mtime = excluded.mtime,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&document.id)
        .bind(&document.source_id)
        .bind(&document.relative_path)
        .bind(&document.title)
        .bind(&document.content_hash)
        .bind(document.size_bytes)
        .bind(document.mtime.timestamp())
        .bind(document.indexed_at.timestamp())
        .execute(&mut *tx)
        .await?;

        let old_chunk_ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM chunks WHERE document_id = ?")
                .bind(&document.id)
                .fetch_all(&mut *tx)
                .await?;

        for chunk_id in &old_chunk_ids {
            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM extraction_status WHERE chunk_id = ?")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&document.id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, ordinal, content, char_offset, char_length) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.ordinal)
            .bind(&chunk.content)
            .bind(chunk.char_offset)
            .bind(chunk.char_length)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunks_fts (chunk_id, document_id, content) VALUES (?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(old_chunk_ids)
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let chunk_ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM chunks WHERE document_id = ?")
                .bind(document_id)
                .fetch_all(&mut *tx)
                .await?;

        for chunk_id in &chunk_ids {
            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM extraction_status WHERE chunk_id = ?")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(chunk_ids)
    }

    // ---- Chunks ----

    pub async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(
            "SELECT id, document_id, ordinal, content, char_offset, char_length FROM chunks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_chunk))
    }

    pub async fn list_chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, ordinal, content, char_offset, char_length FROM chunks WHERE document_id = ? ORDER BY ordinal",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    /// Adjacent chunk by ordinal offset (for context expansion in search).
    pub async fn adjacent_chunk(&self, document_id: &str, ordinal: i64) -> Result<Option<Chunk>> {
        let row = sqlx::query(
            "SELECT id, document_id, ordinal, content, char_offset, char_length FROM chunks WHERE document_id = ? AND ordinal = ?",
        )
        .bind(document_id)
        .bind(ordinal)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_chunk))
    }

    pub async fn chunks_without_extraction_status(&self, limit: i64) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.ordinal, c.content, c.char_offset, c.char_length
            FROM chunks c
            LEFT JOIN extraction_status es ON es.chunk_id = c.id
            WHERE es.chunk_id IS NULL
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    pub async fn chunks_with_status(&self, status: ExtractionState, limit: i64) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.ordinal, c.content, c.char_offset, c.char_length
            FROM chunks c
            JOIN extraction_status es ON es.chunk_id = c.id
            WHERE es.status = ?
            LIMIT ?
            "#,
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    pub async fn all_chunks(&self, limit: i64) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, ordinal, content, char_offset, char_length FROM chunks LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    // ---- Full-text search ----

    pub async fn fts_search(&self, query: &str, limit: i64) -> Result<Vec<FtsHit>> {
        let sanitized = sanitize_fts_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT
                chunk_id,
                bm25(chunks_fts) AS rank_score,
                snippet(chunks_fts, 2, '[', ']', '…', 12) AS snippet
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank_score
            LIMIT ?
            "#,
        )
        .bind(&sanitized)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FtsHit {
                chunk_id: row.get("chunk_id"),
                // bm25() returns lower-is-better; invert so higher means more relevant,
                // matching the convention the rest of the pipeline uses for scores.
                rank_score: -row.get::<f64, _>("rank_score"),
                snippet: row.get("snippet"),
            })
            .collect())
    }

    // ---- Entities & relations ----

    pub async fn upsert_entity(&self, entity: &Entity) -> Result<()> {
        let existing: Option<(String, f64)> =
            sqlx::query_as("SELECT source_document_ids, confidence FROM entities WHERE id = ?")
                .bind(&entity.id)
                .fetch_optional(&self.pool)
                .await?;

        let (merged_doc_ids, merged_confidence) = match existing {
            Some((doc_ids_json, existing_confidence)) => {
                let mut doc_ids: Vec<String> =
                    serde_json::from_str(&doc_ids_json).unwrap_or_default();
                for id in &entity.source_document_ids {
                    if !doc_ids.contains(id) {
                        doc_ids.push(id.clone());
                    }
                }
                (doc_ids, existing_confidence.max(entity.confidence))
            }
            None => (entity.source_document_ids.clone(), entity.confidence),
        };

        sqlx::query(
            r#"
            INSERT INTO entities (id, name, entity_type, description, source_document_ids, confidence, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                description = CASE WHEN length(excluded.description) > length(entities.description) THEN excluded.description ELSE entities.description END,
                source_document_ids = ?,
                confidence = ?,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entity.id)
        .bind(&entity.name)
        .bind(entity.entity_type.as_str())
        .bind(&entity.description)
        .bind(serde_json::to_string(&merged_doc_ids).unwrap_or_default())
        .bind(merged_confidence)
        .bind(entity.created_at.timestamp())
        .bind(entity.updated_at.timestamp())
        .bind(serde_json::to_string(&merged_doc_ids).unwrap_or_default())
        .bind(merged_confidence)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_relation(&self, relation: &Relation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relations (id, subject_entity_id, predicate, object_entity_id, source_chunk_id, confidence)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET confidence = MAX(relations.confidence, excluded.confidence)
            "#,
        )
        .bind(&relation.id)
        .bind(&relation.subject_entity_id)
        .bind(&relation.predicate)
        .bind(&relation.object_entity_id)
        .bind(&relation.source_chunk_id)
        .bind(relation.confidence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upserts a chunk's entire batch of entities and relations in one
    /// transaction, so a failure partway through never leaves a chunk's
    /// extraction half-applied.
    pub async fn upsert_entities_and_relations(
        &self,
        entities: &[Entity],
        relations: &[Relation],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for entity in entities {
            let existing: Option<(String, f64)> =
                sqlx::query_as("SELECT source_document_ids, confidence FROM entities WHERE id = ?")
                    .bind(&entity.id)
                    .fetch_optional(&mut *tx)
                    .await?;

            let (merged_doc_ids, merged_confidence) = match existing {
                Some((doc_ids_json, existing_confidence)) => {
                    let mut doc_ids: Vec<String> =
                        serde_json::from_str(&doc_ids_json).unwrap_or_default();
                    for id in &entity.source_document_ids {
                        if !doc_ids.contains(id) {
                            doc_ids.push(id.clone());
                        }
                    }
                    (doc_ids, existing_confidence.max(entity.confidence))
                }
                None => (entity.source_document_ids.clone(), entity.confidence),
            };

            sqlx::query(
                r#"
                INSERT INTO entities (id, name, entity_type, description, source_document_ids, confidence, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    description = CASE WHEN length(excluded.description) > length(entities.description) THEN excluded.description ELSE entities.description END,
                    source_document_ids = ?,
                    confidence = ?,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entity.id)
            .bind(&entity.name)
            .bind(entity.entity_type.as_str())
            .bind(&entity.description)
            .bind(serde_json::to_string(&merged_doc_ids).unwrap_or_default())
            .bind(merged_confidence)
            .bind(entity.created_at.timestamp())
            .bind(entity.updated_at.timestamp())
            .bind(serde_json::to_string(&merged_doc_ids).unwrap_or_default())
            .bind(merged_confidence)
            .execute(&mut *tx)
            .await?;
        }

        for relation in relations {
            sqlx::query(
                r#"
                INSERT INTO relations (id, subject_entity_id, predicate, object_entity_id, source_chunk_id, confidence)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET confidence = MAX(relations.confidence, excluded.confidence)
                "#,
            )
            .bind(&relation.id)
            .bind(&relation.subject_entity_id)
            .bind(&relation.predicate)
            .bind(&relation.object_entity_id)
            .bind(&relation.source_chunk_id)
            .bind(relation.confidence)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query(
            "SELECT id, name, entity_type, description, source_document_ids, confidence, created_at, updated_at FROM entities WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_entity))
    }

    pub async fn search_entities(&self, needle: &str, limit: i64) -> Result<Vec<Entity>> {
        let pattern = format!("%{}%", needle.to_lowercase());
        let rows = sqlx::query(
            r#"
            SELECT id, name, entity_type, description, source_document_ids, confidence, created_at, updated_at
            FROM entities
            WHERE lower(name) LIKE ? OR lower(description) LIKE ?
            ORDER BY confidence DESC
            LIMIT ?
            "#,
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_entity).collect())
    }

    pub async fn relations_for_entities(&self, entity_ids: &[String]) -> Result<Vec<Relation>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = entity_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, subject_entity_id, predicate, object_entity_id, source_chunk_id, confidence FROM relations WHERE subject_entity_id IN ({placeholders}) OR object_entity_id IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql);
        for id in entity_ids {
            q = q.bind(id);
        }
        for id in entity_ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_relation).collect())
    }

    pub async fn all_entities_grouped_for_dedup(&self) -> Result<Vec<Entity>> {
        let rows = sqlx::query(
            "SELECT id, name, entity_type, description, source_document_ids, confidence, created_at, updated_at FROM entities",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_entity).collect())
    }

    pub async fn delete_entity(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM entities WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn replace_entity_id_in_relations(&self, old_id: &str, new_id: &str) -> Result<()> {
        sqlx::query("UPDATE relations SET subject_entity_id = ? WHERE subject_entity_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE relations SET object_entity_id = ? WHERE object_entity_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- Extraction status ----

    pub async fn set_extraction_pending(&self, chunk_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_status (chunk_id, status, error_message, attempts, last_attempt_at)
            VALUES (?, 'pending', NULL, 0, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET status = 'pending', last_attempt_at = excluded.last_attempt_at
            "#,
        )
        .bind(chunk_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_extraction_completed(&self, chunk_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_status (chunk_id, status, error_message, attempts, last_attempt_at)
            VALUES (?, 'completed', NULL, 1, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET status = 'completed', error_message = NULL, last_attempt_at = excluded.last_attempt_at
            "#,
        )
        .bind(chunk_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_extraction_error(
        &self,
        chunk_id: &str,
        message: &str,
        max_attempts: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let attempts: i64 = sqlx::query_scalar(
            "SELECT attempts FROM extraction_status WHERE chunk_id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(0);

        let new_attempts = attempts + 1;
        let status = if new_attempts >= max_attempts {
            "error"
        } else {
            "pending"
        };

        sqlx::query(
            r#"
            INSERT INTO extraction_status (chunk_id, status, error_message, attempts, last_attempt_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                status = excluded.status,
                error_message = excluded.error_message,
                attempts = excluded.attempts,
                last_attempt_at = excluded.last_attempt_at
            "#,
        )
        .bind(chunk_id)
        .bind(status)
        .bind(message)
        .bind(new_attempts)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_extraction_status(&self, chunk_id: &str) -> Result<Option<ExtractionStatus>> {
        let row = sqlx::query(
            "SELECT chunk_id, status, error_message, attempts, last_attempt_at FROM extraction_status WHERE chunk_id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_extraction_status))
    }

    // ---- Counters ----

    pub async fn source_document_count(&self, source_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn source_chunk_count(&self, source_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks c JOIN documents d ON d.id = c.document_id WHERE d.source_id = ?",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn total_counts(&self) -> Result<(i64, i64, i64, i64)> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let entities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await?;
        let relations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relations")
            .fetch_one(&self.pool)
            .await?;
        Ok((documents, chunks, entities, relations))
    }
}

/// FTS5 MATCH syntax treats punctuation specially; quote each token so
/// arbitrary user queries (including `:`, `-`, `"`) can't break the query or
/// be interpreted as FTS5 operators.
fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|tok| format!("\"{}\"", tok.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn row_to_source(row: sqlx::sqlite::SqliteRow) -> Source {
    let patterns: String = row.get("patterns");
    let excludes: String = row.get("excludes");
    let sync_mode: String = row.get("sync_mode");
    Source {
        id: row.get("id"),
        name: row.get("name"),
        absolute_path: row.get("absolute_path"),
        patterns: serde_json::from_str(&patterns).unwrap_or_default(),
        excludes: serde_json::from_str(&excludes).unwrap_or_default(),
        sync_mode: if sync_mode == "auto" {
            SyncMode::Auto
        } else {
            SyncMode::Manual
        },
        added_at: chrono::DateTime::from_timestamp(row.get("added_at"), 0).unwrap_or_default(),
        last_synced_at: row
            .get::<Option<i64>, _>("last_synced_at")
            .and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
    }
}

fn row_to_document(row: sqlx::sqlite::SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        source_id: row.get("source_id"),
        relative_path: row.get("relative_path"),
        title: row.get("title"),
        content_hash: row.get("content_hash"),
        size_bytes: row.get("size_bytes"),
        mtime: chrono::DateTime::from_timestamp(row.get("mtime"), 0).unwrap_or_default(),
        indexed_at: chrono::DateTime::from_timestamp(row.get("indexed_at"), 0).unwrap_or_default(),
    }
}

fn row_to_chunk(row: sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        ordinal: row.get("ordinal"),
        content: row.get("content"),
        char_offset: row.get("char_offset"),
        char_length: row.get("char_length"),
    }
}

fn row_to_entity(row: sqlx::sqlite::SqliteRow) -> Entity {
    let doc_ids: String = row.get("source_document_ids");
    let entity_type: String = row.get("entity_type");
    Entity {
        id: row.get("id"),
        name: row.get("name"),
        entity_type: EntityType::parse(&entity_type),
        description: row.get("description"),
        source_document_ids: serde_json::from_str(&doc_ids).unwrap_or_default(),
        confidence: row.get("confidence"),
        created_at: chrono::DateTime::from_timestamp(row.get("created_at"), 0).unwrap_or_default(),
        updated_at: chrono::DateTime::from_timestamp(row.get("updated_at"), 0).unwrap_or_default(),
    }
}

fn row_to_relation(row: sqlx::sqlite::SqliteRow) -> Relation {
    Relation {
        id: row.get("id"),
        subject_entity_id: row.get("subject_entity_id"),
        predicate: row.get("predicate"),
        object_entity_id: row.get("object_entity_id"),
        source_chunk_id: row.get("source_chunk_id"),
        confidence: row.get("confidence"),
    }
}

fn row_to_extraction_status(row: sqlx::sqlite::SqliteRow) -> ExtractionStatus {
    let status: String = row.get("status");
    ExtractionStatus {
        chunk_id: row.get("chunk_id"),
        status: ExtractionState::parse(&status),
        error_message: row.get("error_message"),
        attempts: row.get("attempts"),
        last_attempt_at: row
            .get::<Option<i64>, _>("last_attempt_at")
            .and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
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

    fn sample_source() -> Source {
        Source {
            id: "src1".into(),
            name: "docs".into(),
            absolute_path: "/tmp/docs".into(),
            patterns: vec!["**/*.md".into()],
            excludes: vec![],
            sync_mode: SyncMode::Manual,
            added_at: Utc::now(),
            last_synced_at: None,
        }
    }

    #[tokio::test]
    async fn fts_coherence_write_and_query() {
        let store = test_store().await;
        store.upsert_source(&sample_source()).await.unwrap();

        let doc = Document {
            id: "doc1".into(),
            source_id: "src1".into(),
            relative_path: "a.md".into(),
            title: "a.md".into(),
            content_hash: "h1".into(),
            size_bytes: 100,
            mtime: Utc::now(),
            indexed_at: Utc::now(),
        };
        let chunk = Chunk {
            id: crate::models::chunk_id("doc1", 0, "Oak Ridge is a place"),
            document_id: "doc1".into(),
            ordinal: 0,
            content: "Oak Ridge is a place".into(),
            char_offset: 0,
            char_length: 21,
        };
        store.replace_document_chunks(&doc, &[chunk.clone()]).await.unwrap();

        let hits = store.fts_search("Oak Ridge", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, chunk.id);
    }

    #[tokio::test]
    async fn replace_chunks_removes_stale_rows() {
        let store = test_store().await;
        store.upsert_source(&sample_source()).await.unwrap();
        let doc = Document {
            id: "doc1".into(),
            source_id: "src1".into(),
            relative_path: "a.md".into(),
            title: "a.md".into(),
            content_hash: "h1".into(),
            size_bytes: 10,
            mtime: Utc::now(),
            indexed_at: Utc::now(),
        };
        let chunk_a = Chunk {
            id: crate::models::chunk_id("doc1", 0, "hello"),
            document_id: "doc1".into(),
            ordinal: 0,
            content: "hello".into(),
            char_offset: 0,
            char_length: 5,
        };
        store.replace_document_chunks(&doc, &[chunk_a]).await.unwrap();

        let chunk_b = Chunk {
            id: crate::models::chunk_id("doc1", 0, "goodbye"),
            document_id: "doc1".into(),
            ordinal: 0,
            content: "goodbye".into(),
            char_offset: 0,
            char_length: 7,
        };
        store.replace_document_chunks(&doc, &[chunk_b]).await.unwrap();

        let hits = store.fts_search("hello", 10).await.unwrap();
        assert!(hits.is_empty());
        let hits = store.fts_search("goodbye", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_source_cascades() {
        let store = test_store().await;
        store.upsert_source(&sample_source()).await.unwrap();
        let doc = Document {
            id: "doc1".into(),
            source_id: "src1".into(),
            relative_path: "a.md".into(),
            title: "a.md".into(),
            content_hash: "h1".into(),
            size_bytes: 10,
            mtime: Utc::now(),
            indexed_at: Utc::now(),
        };
        let chunk = Chunk {
            id: crate::models::chunk_id("doc1", 0, "hello"),
            document_id: "doc1".into(),
            ordinal: 0,
            content: "hello".into(),
            char_offset: 0,
            char_length: 5,
        };
        store.replace_document_chunks(&doc, &[chunk]).await.unwrap();

        let counts = store.delete_source("src1").await.unwrap();
        assert_eq!(counts.documents_deleted, 1);
        assert_eq!(counts.vectors_deleted, 1);
        assert!(store.get_source("src1").await.unwrap().is_none());
        assert!(store.fts_search("hello", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entity_upsert_unions_documents_and_takes_max_confidence() {
        let store = test_store().await;
        let now = Utc::now();
        let e1 = Entity {
            id: "e1".into(),
            name: "OAuth2".into(),
            entity_type: EntityType::Tech,
            description: "short".into(),
            source_document_ids: vec!["doc1".into()],
            confidence: 0.5,
            created_at: now,
            updated_at: now,
        };
        store.upsert_entity(&e1).await.unwrap();

        let e2 = Entity {
            id: "e1".into(),
            name: "OAuth2".into(),
            entity_type: EntityType::Tech,
            description: "a much longer description of OAuth2".into(),
            source_document_ids: vec!["doc2".into()],
            confidence: 0.9,
            created_at: now,
            updated_at: now,
        };
        store.upsert_entity(&e2).await.unwrap();

        let merged = store.get_entity("e1").await.unwrap().unwrap();
        assert_eq!(merged.confidence, 0.9);
        assert_eq!(merged.source_document_ids.len(), 2);
        assert_eq!(merged.description, "a much longer description of OAuth2");
    }

    #[tokio::test]
    async fn extraction_status_error_progression() {
        let store = test_store().await;
        store.set_extraction_pending("c1").await.unwrap();
        store.record_extraction_error("c1", "boom", 2).await.unwrap();
        let status = store.get_extraction_status("c1").await.unwrap().unwrap();
        assert_eq!(status.status, ExtractionState::Pending);
        assert_eq!(status.attempts, 1);

        store.record_extraction_error("c1", "boom again", 2).await.unwrap();
        let status = store.get_extraction_status("c1").await.unwrap().unwrap();
        assert_eq!(status.status, ExtractionState::Error);
        assert_eq!(status.attempts, 2);
    }

    #[tokio::test]
    async fn upsert_entities_and_relations_commits_both_in_one_batch() {
        let store = test_store().await;
        let now = Utc::now();
        let subject = Entity {
            id: "e-subject".into(),
            name: "ServiceA".into(),
            entity_type: EntityType::Tech,
            description: "a service".into(),
            source_document_ids: vec!["doc1".into()],
            confidence: 0.7,
            created_at: now,
            updated_at: now,
        };
        let object = Entity {
            id: "e-object".into(),
            name: "ServiceB".into(),
            entity_type: EntityType::Tech,
            description: "another service".into(),
            source_document_ids: vec!["doc1".into()],
            confidence: 0.7,
            created_at: now,
            updated_at: now,
        };
        let relation = Relation {
            id: "r1".into(),
            subject_entity_id: "e-subject".into(),
            predicate: "depends_on".into(),
            object_entity_id: "e-object".into(),
            source_chunk_id: "c1".into(),
            confidence: 0.6,
        };

        store
            .upsert_entities_and_relations(&[subject, object], &[relation])
            .await
            .unwrap();

        assert!(store.get_entity("e-subject").await.unwrap().is_some());
        assert!(store.get_entity("e-object").await.unwrap().is_some());
        let relations = store.relations_for_entities(&["e-subject".into()]).await.unwrap();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].predicate, "depends_on");
    }
}
