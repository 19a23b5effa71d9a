//! Conduit daemon entry point.
//!
//! Loads YAML configuration, initializes structured logging, runs relational
//! migrations, constructs every collaborator (capability-aware: optional
//! services degrade to `None` rather than panicking), spawns the SSE
//! heartbeat, and serves the HTTP API over a Unix domain socket until the
//! process is terminated.

use std::path::PathBuf;
use std::sync::Arc;

use conduit_kb::capability::CapabilityDetector;
use conduit_kb::config::{self, Config};
use conduit_kb::db;
use conduit_kb::embedding::{create_provider, EmbeddingProvider};
use conduit_kb::events::EventBus;
use conduit_kb::graph_store::GraphStore;
use conduit_kb::schema;
use conduit_kb::server::{run_server, AppContext};
use conduit_kb::store::Store;
use conduit_kb::vector_store::VectorStore;
use tracing::{info, warn};

fn parse_config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    dirs_home().join(".conduit").join("conduit.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = parse_config_path();
    let config: Config = if config_path.exists() {
        config::load_config(&config_path)?
    } else {
        config::default_config()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .init();

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(config.data_dir.join("logs"))?;

    let db_path = config.data_dir.join("conduit.db");
    let pool = db::connect(&db_path).await?;
    schema::run_migrations(&pool).await?;
    let store = Store::new(pool);
    info!("relational store ready at {}", db_path.display());

    let vector_store = match VectorStore::connect(&config.kb.vector_store.url).await {
        Ok(vs) => {
            let dims = config.kb.embedding.dims.unwrap_or(384) as u64;
            if let Err(e) = vs.ensure_collections(dims).await {
                warn!("vector store collections not ready: {e}");
            }
            info!("vector store connected at {}", config.kb.vector_store.url);
            Some(vs)
        }
        Err(e) => {
            warn!("vector store unavailable, search will run lexical-only: {e}");
            None
        }
    };

    let embedder: Option<Box<dyn EmbeddingProvider>> = if config.kb.embedding.is_enabled() {
        match create_provider(&config.kb.embedding) {
            Ok(provider) => {
                if let Err(e) = provider.probe_availability().await {
                    warn!("embedding provider probe failed: {e}");
                }
                Some(provider)
            }
            Err(e) => {
                warn!("failed to construct embedding provider: {e}");
                None
            }
        }
    } else {
        None
    };

    let graph_store = if config.kb.kag.enabled {
        let graph = &config.kb.kag.graph;
        match GraphStore::connect(&graph.host, graph.port, &graph.graph_name).await {
            Ok(gs) => {
                info!("graph store connected at {}:{}", graph.host, graph.port);
                Some(gs)
            }
            Err(e) => {
                warn!("graph store unavailable, kag queries fall back to relational joins: {e}");
                None
            }
        }
    } else {
        None
    };

    let events = EventBus::new();
    events.spawn_heartbeat();

    {
        let detector = CapabilityDetector {
            store: &store,
            vector_store: vector_store.as_ref(),
            embedder: embedder.as_deref(),
            graph_store: graph_store.as_ref(),
        };
        let snapshot = detector.probe().await;
        info!("startup capability snapshot: {:?}", snapshot.search_mode);
    }

    let ctx = Arc::new(AppContext { config, store, vector_store, embedder, graph_store, events });

    run_server(ctx).await
}
