//! Core data types for the knowledge base.
//!
//! Mirrors the relational schema in [`crate::schema`]: sources own documents,
//! documents own chunks, and chunks fan out into FTS rows, vectors, extraction
//! status, and relations. Entities are not owned by a single chunk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub absolute_path: String,
    pub patterns: Vec<String>,
    pub excludes: Vec<String>,
    pub sync_mode: SyncMode,
    pub added_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    pub relative_path: String,
    pub title: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub mtime: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub content: String,
    pub char_offset: i64,
    pub char_length: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Concept,
    Person,
    Org,
    Tech,
    Location,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Concept => "concept",
            EntityType::Person => "person",
            EntityType::Org => "org",
            EntityType::Tech => "tech",
            EntityType::Location => "location",
            EntityType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "concept" => EntityType::Concept,
            "person" => EntityType::Person,
            "org" => EntityType::Org,
            "tech" => EntityType::Tech,
            "location" => EntityType::Location,
            _ => EntityType::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub entity_type: EntityType,
    pub description: String,
    pub source_document_ids: Vec<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub subject_entity_id: String,
    pub predicate: String,
    pub object_entity_id: String,
    pub source_chunk_id: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionState {
    Pending,
    Completed,
    Error,
}

impl ExtractionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionState::Pending => "pending",
            ExtractionState::Completed => "completed",
            ExtractionState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => ExtractionState::Pending,
            "completed" => ExtractionState::Completed,
            _ => ExtractionState::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionStatus {
    pub chunk_id: String,
    pub status: ExtractionState,
    pub error_message: Option<String>,
    pub attempts: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Canonical entity id: `hash(lower(trim(name)) ‖ type)`.
pub fn canonical_entity_id(name: &str, entity_type: EntityType) -> String {
    use sha2::{Digest, Sha256};
    let normalized = name.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"\0");
    hasher.update(entity_type.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic chunk id: `hash(document_id ‖ ordinal ‖ content)`.
pub fn chunk_id(document_id: &str, ordinal: i64, content: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(ordinal.to_le_bytes());
    hasher.update(b"\0");
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Content hash of raw document bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_id_normalizes_case_and_whitespace() {
        let a = canonical_entity_id("  Threat Model ", EntityType::Concept);
        let b = canonical_entity_id("threat model", EntityType::Concept);
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_id_differs_by_type() {
        let a = canonical_entity_id("OAuth2", EntityType::Tech);
        let b = canonical_entity_id("OAuth2", EntityType::Concept);
        assert_ne!(a, b);
    }

    #[test]
    fn chunk_id_is_deterministic() {
        let a = chunk_id("doc1", 0, "hello world");
        let b = chunk_id("doc1", 0, "hello world");
        assert_eq!(a, b);
        let c = chunk_id("doc1", 1, "hello world");
        assert_ne!(a, c);
    }
}
