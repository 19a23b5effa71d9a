//! # Conduit
//!
//! **A local-first knowledge base daemon: ingestion, hybrid retrieval, and
//! knowledge-graph augmentation.**
//!
//! Conduit watches filesystem sources, chunks and optionally embeds their
//! content, indexes it for lexical (FTS5) and semantic (Qdrant) search, and
//! can run an LLM extraction pass over the chunks to build an entity/relation
//! graph (mirrored into FalkorDB when configured) that a separate
//! knowledge-augmented-generation query path traverses.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌──────────────┐
//! │ ingest    │──▶│  chunk    │──▶│ SQLite        │
//! │ (fs walk) │   │ + embed   │   │ FTS5 + chunks │
//! └───────────┘   └───────────┘   └──────┬────────┘
//!                                        │
//!              ┌─────────────────────────┼──────────────┐
//!              ▼                         ▼              ▼
//!        ┌───────────┐            ┌────────────┐  ┌───────────┐
//!        │  search   │            │ extraction │  │    kag    │
//!        │  (RRF)    │            │  pipeline  │─▶│  (graph)  │
//!        └───────────┘            └────────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | YAML configuration parsing and validation |
//! | [`models`] | Core data types: `Source`, `Document`, `Chunk`, `Entity`, `Relation` |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`schema`] | Relational + FTS5 schema migrations (idempotent) |
//! | [`store`] | Relational CRUD over sources, documents, chunks, entities, relations |
//! | [`chunk`] | Paragraph-boundary text chunker |
//! | [`embedding`] | Embedding provider trait and backends (OpenAI, Ollama, local) |
//! | [`vector_store`] | Qdrant-backed chunk/entity vector store |
//! | [`graph_store`] | FalkorDB-backed entity/relation graph client |
//! | [`extract`] | Binary document text extraction (PDF, DOCX, PPTX, XLSX) |
//! | [`extractor`] | LLM entity/relation extraction client |
//! | [`ingest`] | Filesystem sync pipeline: walk → diff → chunk → embed → store |
//! | [`search`] | Hybrid lexical/semantic search with RRF fusion and MMR reranking |
//! | [`extraction_pipeline`] | Bounded-concurrency entity/relation extraction over chunks |
//! | [`dedup`] | Entity deduplication by normalized name + type |
//! | [`kag`] | Knowledge-augmented-generation query engine |
//! | [`capability`] | Reachability probes for every external collaborator |
//! | [`supervisor`] | Container lifecycle management for vector/graph stores |
//! | [`events`] | Server-sent event bus for daemon progress streaming |
//! | [`server`] | HTTP API bound to a Unix domain socket (Axum) |
//!
//! ## Configuration
//!
//! Conduit is configured via a YAML file (default: `~/.conduit/conduit.yaml`).
//! See [`config`] for all available options and [`config::load_config`] for
//! validation rules.

pub mod capability;
pub mod chunk;
pub mod config;
pub mod db;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod events;
pub mod extract;
pub mod extraction_pipeline;
pub mod extractor;
pub mod graph_store;
pub mod ingest;
pub mod kag;
pub mod models;
pub mod schema;
pub mod search;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod vector_store;
