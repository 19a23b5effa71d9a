//! End-to-end pipeline tests exercising the library directly: no binary is
//! exec'd, since ingest/search/dedup/kag are library entry points, not CLI
//! subcommands.

use chrono::Utc;
use conduit_kb::config::KbConfig;
use conduit_kb::dedup::Deduplicator;
use conduit_kb::db;
use conduit_kb::ingest::Ingestor;
use conduit_kb::models::{Entity, EntityType, Source, SyncMode};
use conduit_kb::schema;
use conduit_kb::search::{SearchMode, SearchOptions, Searcher};
use conduit_kb::store::Store;
use std::fs;
use tempfile::TempDir;

async fn test_store(data_dir: &std::path::Path) -> Store {
    let pool = db::connect(&data_dir.join("conduit.db")).await.unwrap();
    schema::run_migrations(&pool).await.unwrap();
    Store::new(pool)
}

fn test_source(root: &std::path::Path) -> Source {
    Source {
        id: "src-1".into(),
        name: "docs".into(),
        absolute_path: root.to_string_lossy().to_string(),
        patterns: vec!["**/*".into()],
        excludes: vec![],
        sync_mode: SyncMode::Manual,
        added_at: Utc::now(),
        last_synced_at: None,
    }
}

#[tokio::test]
async fn sync_then_search_finds_ingested_content() {
    let data_dir = TempDir::new().unwrap();
    let files_dir = TempDir::new().unwrap();
    fs::write(
        files_dir.path().join("oauth.md"),
        "# OAuth2 Integration\n\nThis document explains how the service authenticates \
         clients using the OAuth2 authorization code flow against Keycloak.",
    )
    .unwrap();
    fs::write(
        files_dir.path().join("deploy.md"),
        "# Deployment\n\nWe deploy with Kubernetes and Helm charts across two regions.",
    )
    .unwrap();

    let store = test_store(data_dir.path()).await;
    let kb = KbConfig::default();
    let source = test_source(files_dir.path());
    store.upsert_source(&source).await.unwrap();

    let ingestor = Ingestor { store: &store, vector_store: None, embedder: None, events: None, kb: &kb };
    let report = ingestor.sync(&source).await.unwrap();
    assert_eq!(report.added, 2);
    assert_eq!(report.updated, 0);
    assert!(!report.semantic_enabled);

    let searcher = Searcher { store: &store, vector_store: None, embedder: None };
    let options = SearchOptions { mode: SearchMode::Lexical, ..Default::default() };
    let response = searcher.search("OAuth2 Keycloak", &options).await.unwrap();

    assert!(!response.results.is_empty());
    assert!(response.results[0].content.contains("OAuth2"));
}

#[tokio::test]
async fn resync_with_unchanged_content_is_a_noop() {
    let data_dir = TempDir::new().unwrap();
    let files_dir = TempDir::new().unwrap();
    fs::write(files_dir.path().join("a.md"), "Static content that never changes.").unwrap();

    let store = test_store(data_dir.path()).await;
    let kb = KbConfig::default();
    let source = test_source(files_dir.path());
    store.upsert_source(&source).await.unwrap();
    let ingestor = Ingestor { store: &store, vector_store: None, embedder: None, events: None, kb: &kb };

    let first = ingestor.sync(&source).await.unwrap();
    assert_eq!(first.added, 1);

    let second = ingestor.sync(&source).await.unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.deleted, 0);
}

#[tokio::test]
async fn deleting_a_file_removes_its_document_on_next_sync() {
    let data_dir = TempDir::new().unwrap();
    let files_dir = TempDir::new().unwrap();
    let doomed = files_dir.path().join("doomed.md");
    fs::write(&doomed, "This file is about to be removed.").unwrap();

    let store = test_store(data_dir.path()).await;
    let kb = KbConfig::default();
    let source = test_source(files_dir.path());
    store.upsert_source(&source).await.unwrap();
    let ingestor = Ingestor { store: &store, vector_store: None, embedder: None, events: None, kb: &kb };

    ingestor.sync(&source).await.unwrap();
    fs::remove_file(&doomed).unwrap();
    let report = ingestor.sync(&source).await.unwrap();

    assert_eq!(report.deleted, 1);
    assert!(store.list_documents(&source.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn dedup_runs_cleanly_after_a_sync_with_no_entities() {
    let data_dir = TempDir::new().unwrap();
    let store = test_store(data_dir.path()).await;

    let now = Utc::now();
    store
        .upsert_entity(&Entity {
            id: "legacy-1".into(),
            name: "Keycloak".into(),
            entity_type: EntityType::Tech,
            description: "identity provider".into(),
            source_document_ids: vec!["doc-a".into()],
            confidence: 0.8,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
    store
        .upsert_entity(&Entity {
            id: "legacy-2".into(),
            name: "keycloak ".into(),
            entity_type: EntityType::Tech,
            description: "used for SSO across services".into(),
            source_document_ids: vec!["doc-b".into()],
            confidence: 0.6,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    let dedup = Deduplicator { store: &store };
    let report = dedup.run().await.unwrap();
    assert_eq!(report.duplicates_removed, 2);

    let second = dedup.run().await.unwrap();
    assert_eq!(second.duplicates_removed, 0);
}
