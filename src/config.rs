//! Daemon configuration.
//!
//! Conduit is configured via a YAML file (default: `~/.conduit/conduit.yaml`).
//! The config defines the data directory, socket path, log level, AI provider
//! settings, knowledge-base tuning (chunking, workers, KAG/graph), and the
//! egress/path policy.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub kb: KbConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_data_dir() -> PathBuf {
    dirs_home().join(".conduit")
}

fn default_socket() -> PathBuf {
    dirs_home().join(".conduit").join("conduit.sock")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    #[serde(default = "default_ai_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_ai_provider(),
            model: None,
            endpoint: None,
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_ai_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_seconds() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}
fn default_confidence_threshold() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct KbConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default)]
    pub kag: KagConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_file_size: default_max_file_size(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            kag: KagConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig::default(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}
fn default_chunk_size() -> usize {
    1200
}
fn default_chunk_overlap() -> usize {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct KagConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_kag_provider")]
    pub provider: String,
    #[serde(default)]
    pub preload_model: bool,
    #[serde(default)]
    pub graph: GraphConfig,
}

impl Default for KagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_kag_provider(),
            preload_model: false,
            graph: GraphConfig::default(),
        }
    }
}

fn default_kag_provider() -> String {
    "disabled".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_graph_host")]
    pub host: String,
    #[serde(default = "default_graph_port")]
    pub port: u16,
    #[serde(default = "default_graph_name")]
    pub graph_name: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            host: default_graph_host(),
            port: default_graph_port(),
            graph_name: default_graph_name(),
        }
    }
}

fn default_graph_host() -> String {
    "127.0.0.1".to_string()
}
fn default_graph_port() -> u16 {
    6379
}
fn default_graph_name() -> String {
    "conduit_kb".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            url: None,
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_embed_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_qdrant_url")]
    pub url: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: default_qdrant_url(),
        }
    }
}

fn default_qdrant_url() -> String {
    "http://127.0.0.1:6334".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    #[serde(default)]
    pub allow_network_egress: bool,
    #[serde(default)]
    pub forbidden_paths: Vec<PathBuf>,
    #[serde(default)]
    pub warn_paths: Vec<PathBuf>,
}

/// Load and validate configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config =
        serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

/// Build a config with all defaults applied (used when no config file is present).
pub fn default_config() -> Config {
    serde_yaml::from_str("{}").expect("default config must parse")
}

fn validate(config: &Config) -> Result<()> {
    if config.kb.chunk_size == 0 {
        anyhow::bail!("kb.chunk_size must be > 0");
    }
    if config.kb.chunk_overlap >= config.kb.chunk_size {
        anyhow::bail!("kb.chunk_overlap must be smaller than kb.chunk_size");
    }
    if config.kb.workers == 0 {
        anyhow::bail!("kb.workers must be > 0");
    }
    if !(0.0..=1.0).contains(&config.ai.confidence_threshold) {
        anyhow::bail!("ai.confidence_threshold must be in [0.0, 1.0]");
    }

    if config.kb.embedding.is_enabled() {
        if config.kb.embedding.dims.is_none() || config.kb.embedding.dims == Some(0) {
            anyhow::bail!(
                "kb.embedding.dims must be > 0 when provider is '{}'",
                config.kb.embedding.provider
            );
        }
        if config.kb.embedding.model.is_none() {
            anyhow::bail!(
                "kb.embedding.model must be specified when provider is '{}'",
                config.kb.embedding.provider
            );
        }
    }

    match config.kb.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = default_config();
        assert!(validate(&cfg).is_ok());
        assert_eq!(cfg.kb.chunk_size, 1200);
        assert_eq!(cfg.ai.provider, "disabled");
    }

    #[test]
    fn rejects_overlap_ge_chunk_size() {
        let mut cfg = default_config();
        cfg.kb.chunk_overlap = cfg.kb.chunk_size;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_embedding_enabled_without_dims() {
        let mut cfg = default_config();
        cfg.kb.embedding.provider = "openai".to_string();
        cfg.kb.embedding.model = Some("text-embedding-3-small".to_string());
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn parses_full_yaml() {
        let yaml = r#"
data_dir: /tmp/conduit
socket: /tmp/conduit/conduit.sock
log_level: debug
ai:
  provider: openai
  model: gpt-4o-mini
  timeout_seconds: 60
  max_retries: 3
  confidence_threshold: 0.7
kb:
  workers: 4
  max_file_size: 5000000
  chunk_size: 800
  chunk_overlap: 100
  kag:
    enabled: true
    provider: openai
    graph:
      host: 127.0.0.1
      port: 6379
      graph_name: kb
  embedding:
    provider: local
    model: all-minilm-l6-v2
    dims: 384
policy:
  allow_network_egress: false
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.kb.workers, 4);
        assert_eq!(cfg.kb.kag.graph.graph_name, "kb");
        assert!(validate(&cfg).is_ok());
    }
}
