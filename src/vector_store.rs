//! Qdrant-backed vector store for chunk and entity embeddings.
//!
//! Two collections are managed: `chunks` (semantic retrieval over document
//! chunks) and `entities` (semantic retrieval over extracted entities for
//! hybrid KAG search). Points are keyed by the caller's own content-derived
//! id (chunk id / canonical entity id), passed through Qdrant's UUID point
//! id by deterministic derivation so upserts are idempotent.

use qdrant_client::qdrant::{
    point_id::PointIdOptions, vectors_config::Config, CreateCollectionBuilder,
    DeletePointsBuilder, Distance, PointId, PointStruct, PointsIdsList, ScrollPointsBuilder,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParams, VectorsConfig,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{ConduitError, Result};

pub const CHUNKS_COLLECTION: &str = "chunks";
pub const ENTITIES_COLLECTION: &str = "entities";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionStatus {
    Green,
    Yellow,
    Missing,
}

#[derive(Debug, Clone)]
pub struct CollectionHealth {
    pub status: CollectionStatus,
    pub total_points: u64,
    pub indexed_vectors: u64,
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, serde_json::Value>,
}

/// Errors upserting a subset of a batch; the whole request did not roll back.
#[derive(Debug, Clone)]
pub struct BatchUpsertReport {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct VectorStore {
    client: Qdrant,
}

impl VectorStore {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("connecting to vector store at {url}");
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| ConduitError::SemanticUnavailable(format!("build qdrant client: {e}")))?;

        client
            .list_collections()
            .await
            .map_err(|e| ConduitError::SemanticUnavailable(format!("connect: {e}")))?;

        Ok(Self { client })
    }

    pub async fn is_reachable(&self) -> bool {
        self.client.list_collections().await.is_ok()
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        self.client
            .collection_exists(name)
            .await
            .map_err(|e| ConduitError::SemanticUnavailable(e.to_string()))
    }

    async fn ensure_collection(&self, name: &str, dims: u64) -> Result<()> {
        if self.collection_exists(name).await? {
            debug!("collection '{name}' already exists");
            return Ok(());
        }

        info!("creating vector collection '{name}' (dim={dims}, distance=cosine)");
        let vectors_config = VectorsConfig {
            config: Some(Config::Params(VectorParams {
                size: dims,
                distance: Distance::Cosine.into(),
                ..Default::default()
            })),
        };

        self.client
            .create_collection(CreateCollectionBuilder::new(name).vectors_config(vectors_config))
            .await
            .map_err(|e| ConduitError::SemanticUnavailable(format!("create collection: {e}")))?;

        Ok(())
    }

    /// Ensure both the `chunks` and `entities` collections exist at `dims`.
    pub async fn ensure_collections(&self, dims: u64) -> Result<()> {
        self.ensure_collection(CHUNKS_COLLECTION, dims).await?;
        self.ensure_collection(ENTITIES_COLLECTION, dims).await?;
        Ok(())
    }

    /// Delete and recreate a collection, discarding all vectors in it.
    pub async fn purge_collection(&self, name: &str, dims: u64) -> Result<()> {
        if self.collection_exists(name).await? {
            self.client
                .delete_collection(name)
                .await
                .map_err(|e| ConduitError::SemanticUnavailable(format!("delete collection: {e}")))?;
        }
        self.ensure_collection(name, dims).await
    }

    fn to_point_struct(point: &VectorPoint) -> Result<PointStruct> {
        let point_id = deterministic_point_id(&point.id);
        let mut map = serde_json::Map::new();
        map.insert("external_id".to_string(), json!(point.id));
        for (k, v) in &point.payload {
            map.insert(k.clone(), v.clone());
        }
        let payload = Payload::try_from(serde_json::Value::Object(map))
            .map_err(|e| ConduitError::SemanticUnavailable(format!("build payload: {e}")))?;
        Ok(PointStruct::new(point_id, point.vector.clone(), payload))
    }

    async fn upsert_batch(&self, collection: &str, points: &[VectorPoint]) -> usize {
        let structs: Vec<PointStruct> = points.iter().filter_map(|p| Self::to_point_struct(p).ok()).collect();
        if structs.is_empty() {
            return points.len();
        }
        match self
            .client
            .upsert_points(UpsertPointsBuilder::new(collection, structs).wait(true))
            .await
        {
            Ok(_) => 0,
            Err(e) => {
                warn!("upsert batch to '{collection}' failed: {e}");
                points.len()
            }
        }
    }

    /// Upsert points in batches. Idempotent: re-upserting the same id replaces
    /// its vector and payload. A failing batch does not roll back points
    /// already committed by prior batches; the caller gets a failure count.
    pub async fn upsert_points_batched(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
        batch_size: usize,
    ) -> BatchUpsertReport {
        let total = points.len();
        let mut failed = 0usize;
        for batch in points.chunks(batch_size.max(1)) {
            failed += self.upsert_batch(collection, batch).await;
        }
        BatchUpsertReport {
            succeeded: total - failed,
            failed,
        }
    }

    /// k-NN search. Returns hits with score in `[0, 1]`, higher is closer
    /// (Qdrant reports raw cosine similarity for the `Cosine` distance metric).
    pub async fn search(&self, collection: &str, query_vector: Vec<f32>, limit: u64) -> Result<Vec<VectorHit>> {
        let response = self
            .client
            .search_points(SearchPointsBuilder::new(collection, query_vector, limit).with_payload(true))
            .await
            .map_err(|e| ConduitError::SemanticUnavailable(format!("search: {e}")))?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload;
                let external_id = payload
                    .get("external_id")
                    .and_then(|v| v.as_str().map(|s| s.to_string()))?;
                let mut out = HashMap::new();
                for (k, v) in payload {
                    if k != "external_id" {
                        out.insert(k, qdrant_value_to_json(v));
                    }
                }
                Some(VectorHit {
                    id: external_id,
                    score: point.score,
                    payload: out,
                })
            })
            .collect())
    }

    /// Delete points by their external (caller-assigned) ids.
    pub async fn delete_points(&self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let point_ids: Vec<PointId> = ids.iter().map(|id| deterministic_point_id(id)).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(PointsIdsList { ids: point_ids })
                    .wait(true),
            )
            .await
            .map_err(|e| ConduitError::SemanticUnavailable(format!("delete points: {e}")))?;
        Ok(())
    }

    /// Aggregate collection health for the status endpoint.
    pub async fn collection_status(&self, name: &str) -> CollectionHealth {
        match self.collection_exists(name).await {
            Ok(false) | Err(_) => {
                return CollectionHealth {
                    status: CollectionStatus::Missing,
                    total_points: 0,
                    indexed_vectors: 0,
                }
            }
            Ok(true) => {}
        }

        match self.client.collection_info(name).await {
            Ok(info) => {
                let result = info.result;
                let total = result.as_ref().map(|r| r.points_count.unwrap_or(0)).unwrap_or(0);
                let indexed = result.as_ref().map(|r| r.indexed_vectors_count.unwrap_or(0)).unwrap_or(0);
                let healthy = result
                    .map(|r| r.status == qdrant_client::qdrant::CollectionStatus::Green as i32)
                    .unwrap_or(false);
                CollectionHealth {
                    status: if healthy { CollectionStatus::Green } else { CollectionStatus::Yellow },
                    total_points: total,
                    indexed_vectors: indexed,
                }
            }
            Err(_) => CollectionHealth {
                status: CollectionStatus::Missing,
                total_points: 0,
                indexed_vectors: 0,
            },
        }
    }

    /// Scroll all points in a collection (debugging / small deployments only).
    pub async fn scroll_all(&self, collection: &str, limit: u32) -> Result<Vec<VectorHit>> {
        let response = self
            .client
            .scroll(ScrollPointsBuilder::new(collection).limit(limit).with_payload(true))
            .await
            .map_err(|e| ConduitError::SemanticUnavailable(format!("scroll: {e}")))?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload;
                let external_id = payload
                    .get("external_id")
                    .and_then(|v| v.as_str().map(|s| s.to_string()))?;
                let mut out = HashMap::new();
                for (k, v) in payload {
                    if k != "external_id" {
                        out.insert(k, qdrant_value_to_json(v));
                    }
                }
                Some(VectorHit { id: external_id, score: 0.0, payload: out })
            })
            .collect())
    }
}

/// Derive a stable Qdrant UUID point id from our own string id, so repeated
/// upserts of the same chunk/entity id always land on the same point.
fn deterministic_point_id(external_id: &str) -> PointId {
    let digest = crate::models::content_hash(external_id.as_bytes());
    let bytes = hex::decode(&digest[..32]).unwrap_or_default();
    let uuid = uuid_from_bytes(&bytes, external_id);
    PointId {
        point_id_options: Some(PointIdOptions::Uuid(uuid)),
    }
}

fn uuid_from_bytes(bytes: &[u8], fallback_seed: &str) -> String {
    if bytes.len() < 16 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        fallback_seed.hash(&mut hasher);
        let n = hasher.finish();
        return format!("{n:016x}0000000000000000");
    }
    let b = &bytes[..16];
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
    )
}

fn qdrant_value_to_json(v: qdrant_client::qdrant::Value) -> serde_json::Value {
    use qdrant_client::qdrant::value::Kind;
    match v.kind {
        Some(Kind::StringValue(s)) => json!(s),
        Some(Kind::IntegerValue(i)) => json!(i),
        Some(Kind::DoubleValue(d)) => json!(d),
        Some(Kind::BoolValue(b)) => json!(b),
        Some(Kind::NullValue(_)) | None => serde_json::Value::Null,
        Some(Kind::ListValue(l)) => {
            json!(l.values.into_iter().map(qdrant_value_to_json).collect::<Vec<_>>())
        }
        Some(Kind::StructValue(s)) => {
            let mut map = serde_json::Map::new();
            for (k, v) in s.fields {
                map.insert(k, qdrant_value_to_json(v));
            }
            serde_json::Value::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_point_id_is_stable() {
        let a = deterministic_point_id("chunk-abc");
        let b = deterministic_point_id("chunk-abc");
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }

    #[test]
    fn deterministic_point_id_differs_by_input() {
        let a = deterministic_point_id("chunk-abc");
        let b = deterministic_point_id("chunk-xyz");
        assert_ne!(format!("{a:?}"), format!("{b:?}"));
    }
}
