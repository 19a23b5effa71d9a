//! Filesystem ingestion pipeline.
//!
//! Walks a source's tree, diffs it against stored documents by content hash
//! (add/update/skip/delete), replaces changed documents' chunks atomically
//! in the relational store, and upserts their vectors — non-fatally, since
//! semantic indexing is a best-effort enhancement over lexical search.

use std::collections::HashSet;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunk::chunk_text;
use crate::config::KbConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{ConduitError, Result};
use crate::events::{Event, EventBus, SyncCompleted, SyncProgress, SyncStarted};
use crate::models::{content_hash, Chunk, Document, Source};
use crate::store::Store;
use crate::vector_store::{VectorPoint, VectorStore, CHUNKS_COLLECTION};

const TEXT_EXTENSIONS: &[&str] = &[
    "md", "txt", "rs", "py", "js", "ts", "go", "java", "c", "cpp", "h", "hpp", "json", "yaml",
    "yml", "toml", "html", "css", "sh", "rb", "php", "sql", "csv", "log",
];

#[derive(Debug, Clone, Serialize)]
pub struct SyncError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SyncReport {
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub semantic_enabled: bool,
    pub semantic_errors: u64,
    pub errors: Vec<SyncError>,
}

pub struct Ingestor<'a> {
    pub store: &'a Store,
    pub vector_store: Option<&'a VectorStore>,
    pub embedder: Option<&'a dyn EmbeddingProvider>,
    pub events: Option<&'a EventBus>,
    pub kb: &'a KbConfig,
}

impl<'a> Ingestor<'a> {
    /// Sync a single source: walk its tree, diff against stored documents,
    /// and reconcile the relational and vector stores.
    pub async fn sync(&self, source: &Source) -> Result<SyncReport> {
        if let Some(events) = self.events {
            events.publish(Event::new("kb_sync_started", SyncStarted { source_id: &source.id }));
        }

        let mut report = SyncReport {
            semantic_enabled: self.embedder.is_some(),
            ..Default::default()
        };

        let root = Path::new(&source.absolute_path);
        let files = match walk_source(root, &source.patterns, &source.excludes) {
            Ok(files) => files,
            Err(e) => {
                report.errors.push(SyncError {
                    path: source.absolute_path.clone(),
                    message: e.to_string(),
                });
                return Ok(report);
            }
        };

        let existing_docs = self.store.list_documents(&source.id).await?;
        let mut seen_paths: HashSet<String> = HashSet::new();
        let total = files.len() as u64;

        for (i, rel_path) in files.iter().enumerate() {
            seen_paths.insert(rel_path.clone());
            let abs_path = root.join(rel_path);

            let metadata = match std::fs::metadata(&abs_path) {
                Ok(m) => m,
                Err(e) => {
                    report.errors.push(SyncError { path: rel_path.clone(), message: e.to_string() });
                    continue;
                }
            };
            if metadata.len() > self.kb.max_file_size {
                debug!("skipping {rel_path}: exceeds max_file_size");
                continue;
            }

            let text = match extract_text(&abs_path) {
                Ok(Some(t)) => t,
                Ok(None) => {
                    debug!("skipping {rel_path}: unsupported or unreadable file");
                    continue;
                }
                Err(e) => {
                    warn!("failed to extract text from {rel_path}: {e}");
                    report.errors.push(SyncError { path: rel_path.clone(), message: e.to_string() });
                    continue;
                }
            };

            let hash = content_hash(text.as_bytes());
            let existing = existing_docs.iter().find(|d| d.relative_path == *rel_path);

            let is_update = match existing {
                Some(doc) if doc.content_hash == hash => continue,
                Some(_) => true,
                None => false,
            };

            let document_id = existing
                .map(|d| d.id.clone())
                .unwrap_or_else(|| format!("{}:{}", source.id, hash));

            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .and_then(|d| chrono::DateTime::from_timestamp(d.as_secs() as i64, 0))
                .unwrap_or_else(chrono::Utc::now);

            let title = Path::new(rel_path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| rel_path.clone());

            let document = Document {
                id: document_id.clone(),
                source_id: source.id.clone(),
                relative_path: rel_path.clone(),
                title,
                content_hash: hash,
                size_bytes: metadata.len() as i64,
                mtime: modified,
                indexed_at: chrono::Utc::now(),
            };

            let chunks = chunk_text(&document_id, &text, self.kb.chunk_size, self.kb.chunk_overlap);
            let stale_chunk_ids = self.store.replace_document_chunks(&document, &chunks).await?;

            if let Some(vs) = self.vector_store {
                if !stale_chunk_ids.is_empty() {
                    if let Err(e) = vs.delete_points(CHUNKS_COLLECTION, &stale_chunk_ids).await {
                        warn!("vector cleanup failed for {rel_path}: {e}");
                    }
                }
            }

            if let (Some(vs), Some(embedder)) = (self.vector_store, self.embedder) {
                if !chunks.is_empty() {
                    if let Err(e) = embed_and_upsert_chunks(vs, embedder, &document, &chunks).await {
                        warn!("embedding failed for {rel_path}: {e}");
                        report.semantic_errors += 1;
                    }
                }
            }

            if is_update {
                report.updated += 1;
            } else {
                report.added += 1;
            }

            if let Some(events) = self.events {
                events.publish(Event::new(
                    "kb_sync_progress",
                    SyncProgress { source_id: &source.id, processed: i as u64 + 1, total },
                ));
            }
        }

        for doc in &existing_docs {
            if !seen_paths.contains(&doc.relative_path) {
                let chunk_ids = self.store.delete_document(&doc.id).await?;
                if let Some(vs) = self.vector_store {
                    if let Err(e) = vs.delete_points(CHUNKS_COLLECTION, &chunk_ids).await {
                        warn!("vector cleanup failed deleting {}: {e}", doc.relative_path);
                    }
                }
                report.deleted += 1;
            }
        }

        self.store.mark_source_synced(&source.id).await?;

        if let Some(events) = self.events {
            events.publish(Event::new(
                "kb_sync_completed",
                SyncCompleted {
                    source_id: &source.id,
                    added: report.added,
                    updated: report.updated,
                    deleted: report.deleted,
                },
            ));
        }

        info!(
            "sync '{}' complete: +{} ~{} -{} ({} semantic errors)",
            source.name, report.added, report.updated, report.deleted, report.semantic_errors
        );

        Ok(report)
    }
}

async fn embed_and_upsert_chunks(
    vs: &VectorStore,
    embedder: &dyn EmbeddingProvider,
    document: &Document,
    chunks: &[Chunk],
) -> Result<()> {
    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let vectors = embedder.embed_batch(&texts).await?;

    let points: Vec<VectorPoint> = chunks
        .iter()
        .zip(vectors.into_iter())
        .map(|(chunk, vector)| {
            let mut payload = std::collections::HashMap::new();
            payload.insert("document_id".to_string(), serde_json::json!(document.id));
            payload.insert("source_id".to_string(), serde_json::json!(document.source_id));
            payload.insert("ordinal".to_string(), serde_json::json!(chunk.ordinal));
            VectorPoint { id: chunk.id.clone(), vector, payload }
        })
        .collect();

    let report = vs.upsert_points_batched(CHUNKS_COLLECTION, points, 64).await;
    if report.failed > 0 {
        return Err(ConduitError::EmbedBatchFailed(format!(
            "{} of {} chunk vectors failed to upsert",
            report.failed,
            report.failed + report.succeeded
        )));
    }
    Ok(())
}

/// Walk `root` honouring include patterns (default `**/*` when empty) and
/// exclude patterns, always skipping `.git`, `target`, and `node_modules`.
fn walk_source(root: &Path, patterns: &[String], excludes: &[String]) -> anyhow::Result<Vec<String>> {
    if !root.exists() {
        anyhow::bail!("source path does not exist: {}", root.display());
    }
    if !root.is_dir() {
        anyhow::bail!("source path is not a directory: {}", root.display());
    }

    let include_patterns = if patterns.is_empty() {
        vec!["**/*".to_string()]
    } else {
        patterns.to_vec()
    };
    let include_set = build_globset(&include_patterns)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(excludes.iter().cloned());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push(rel_str);
    }
    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Extract plain text from a file. Returns `Ok(None)` for files we don't
/// recognise at all, so the caller can skip+debug-log rather than abort the
/// sync; returns `Err` when a recognised binary format fails to parse, so
/// the caller can skip+warn with a `SyncError` entry instead.
fn extract_text(path: &Path) -> anyhow::Result<Option<String>> {
    let ext = path.extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default();

    let mime = match ext.as_str() {
        "pdf" => Some(crate::extract::MIME_PDF),
        "docx" => Some(crate::extract::MIME_DOCX),
        "pptx" => Some(crate::extract::MIME_PPTX),
        "xlsx" => Some(crate::extract::MIME_XLSX),
        _ => None,
    };

    if let Some(mime) = mime {
        let bytes = std::fs::read(path)?;
        return match crate::extract::extract_text(&bytes, mime) {
            Ok(text) => Ok(Some(text)),
            Err(e) => Err(anyhow::anyhow!("{ext} extraction failed: {e}")),
        };
    }

    if ext.is_empty() || TEXT_EXTENSIONS.contains(&ext.as_str()) {
        return match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(_) => Ok(None),
        };
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncMode;
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

    fn sample_source(path: &str) -> Source {
        Source {
            id: "src1".into(),
            name: "docs".into(),
            absolute_path: path.to_string(),
            patterns: vec![],
            excludes: vec![],
            sync_mode: SyncMode::Manual,
            added_at: Utc::now(),
            last_synced_at: None,
        }
    }

    #[tokio::test]
    async fn add_sync_search_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "The Oak Ridge laboratory studies neutrons.").unwrap();
        std::fs::write(dir.path().join("b.md"), "Authentication uses OAuth2.").unwrap();

        let store = test_store().await;
        let source = sample_source(dir.path().to_str().unwrap());
        store.upsert_source(&source).await.unwrap();

        let kb = KbConfig::default();
        let ingestor = Ingestor { store: &store, vector_store: None, embedder: None, events: None, kb: &kb };
        let report = ingestor.sync(&source).await.unwrap();

        assert_eq!(report.added, 2);
        assert_eq!(report.deleted, 0);

        let hits = store.fts_search("Oak Ridge", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn update_invalidates_stale_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "The Oak Ridge laboratory studies neutrons.").unwrap();

        let store = test_store().await;
        let source = sample_source(dir.path().to_str().unwrap());
        store.upsert_source(&source).await.unwrap();
        let kb = KbConfig::default();
        let ingestor = Ingestor { store: &store, vector_store: None, embedder: None, events: None, kb: &kb };
        ingestor.sync(&source).await.unwrap();

        std::fs::write(dir.path().join("a.md"), "No mention here.").unwrap();
        let report = ingestor.sync(&source).await.unwrap();
        assert_eq!(report.updated, 1);

        let hits = store.fts_search("Oak Ridge", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn deleted_file_removes_document() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.md");
        std::fs::write(&file_path, "content here").unwrap();

        let store = test_store().await;
        let source = sample_source(dir.path().to_str().unwrap());
        store.upsert_source(&source).await.unwrap();
        let kb = KbConfig::default();
        let ingestor = Ingestor { store: &store, vector_store: None, embedder: None, events: None, kb: &kb };
        ingestor.sync(&source).await.unwrap();

        std::fs::remove_file(&file_path).unwrap();
        let report = ingestor.sync(&source).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(store.list_documents(&source.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn excluded_pattern_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.md"), "keep me").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules/skip.md"), "skip me").unwrap();

        let store = test_store().await;
        let source = sample_source(dir.path().to_str().unwrap());
        store.upsert_source(&source).await.unwrap();
        let kb = KbConfig::default();
        let ingestor = Ingestor { store: &store, vector_store: None, embedder: None, events: None, kb: &kb };
        let report = ingestor.sync(&source).await.unwrap();

        assert_eq!(report.added, 1);
    }

    #[test]
    fn extract_text_reads_known_text_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "hello world").unwrap();
        assert_eq!(extract_text(&path).unwrap().as_deref(), Some("hello world"));
    }

    #[test]
    fn extract_text_skips_unrecognised_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");
        std::fs::write(&path, [0u8, 1, 2, 3]).unwrap();
        assert!(extract_text(&path).unwrap().is_none());
    }

    #[test]
    fn extract_text_errors_on_malformed_docx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.docx");
        std::fs::write(&path, b"not a zip file").unwrap();
        assert!(extract_text(&path).is_err());
    }
}
