//! FalkorDB-backed entity/relation graph client.
//!
//! FalkorDB speaks the Redis protocol and exposes Cypher-style graph queries
//! through the `GRAPH.QUERY` command. We issue those commands directly over
//! a `redis::aio::ConnectionManager` rather than pulling in a dedicated graph
//! driver, since the wire protocol is plain Redis.

use redis::aio::ConnectionManager;
use tracing::{info, warn};

use crate::error::{ConduitError, Result};
use crate::models::Relation;

#[derive(Clone)]
pub struct GraphStore {
    conn: ConnectionManager,
    graph_name: String,
}

#[derive(Debug, Clone)]
pub struct Neighbour {
    pub entity_id: String,
    pub name: String,
    pub entity_type: String,
    pub predicate: String,
    pub hop: u32,
}

impl GraphStore {
    pub async fn connect(host: &str, port: u16, graph_name: &str) -> Result<Self> {
        info!("connecting to graph store at {host}:{port} (graph={graph_name})");
        let client = redis::Client::open(format!("redis://{host}:{port}"))
            .map_err(|e| ConduitError::GraphUnavailable(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| ConduitError::GraphUnavailable(format!("connect: {e}")))?;

        Ok(Self {
            conn,
            graph_name: graph_name.to_string(),
        })
    }

    /// Liveness probe; used by the capability detector.
    pub async fn is_connected(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await.is_ok()
    }

    async fn query(&self, cypher: &str) -> Result<redis::Value> {
        let mut conn = self.conn.clone();
        redis::cmd("GRAPH.QUERY")
            .arg(&self.graph_name)
            .arg(cypher)
            .query_async(&mut conn)
            .await
            .map_err(|e| ConduitError::GraphUnavailable(format!("GRAPH.QUERY failed: {e}")))
    }

    /// Merge an entity node, keyed by its canonical id, creating it once.
    pub async fn upsert_entity(&self, id: &str, name: &str, entity_type: &str) -> Result<()> {
        let cypher = format!(
            "MERGE (e:Entity {{id: {}}}) SET e.name = {}, e.type = {}",
            cypher_string(id),
            cypher_string(name),
            cypher_string(entity_type)
        );
        self.query(&cypher).await?;
        Ok(())
    }

    /// Merge a directed relation edge between two already-upserted entities.
    pub async fn upsert_relation(&self, relation: &Relation) -> Result<()> {
        let cypher = format!(
            "MATCH (s:Entity {{id: {}}}), (o:Entity {{id: {}}}) \
             MERGE (s)-[r:RELATION {{predicate: {}}}]->(o) \
             SET r.confidence = {}",
            cypher_string(&relation.subject_entity_id),
            cypher_string(&relation.object_entity_id),
            cypher_string(&relation.predicate),
            relation.confidence
        );
        self.query(&cypher).await?;
        Ok(())
    }

    /// BFS outward from `entity_id` up to `max_hops`, capped at `limit` results.
    pub async fn neighbours(&self, entity_id: &str, max_hops: u32, limit: u32) -> Result<Vec<Neighbour>> {
        let hops = max_hops.clamp(1, 4);
        let cypher = format!(
            "MATCH p = (start:Entity {{id: {}}})-[r:RELATION*1..{}]->(n:Entity) \
             RETURN DISTINCT n.id, n.name, n.type, r[0].predicate, length(p) \
             LIMIT {}",
            cypher_string(entity_id),
            hops,
            limit
        );

        let result = self.query(&cypher).await?;
        Ok(parse_neighbour_rows(&result))
    }
}

fn cypher_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// FalkorDB's RESP reply for GRAPH.QUERY is `[header, rows, stats]`. We only
/// need the row values, each itself an array of scalar cell values.
fn parse_neighbour_rows(value: &redis::Value) -> Vec<Neighbour> {
    let redis::Value::Array(top) = value else {
        return Vec::new();
    };
    let Some(redis::Value::Array(rows)) = top.get(1) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for row in rows {
        let redis::Value::Array(cells) = row else { continue };
        if cells.len() < 5 {
            continue;
        }
        let entity_id = redis_scalar_to_string(&cells[0]);
        let name = redis_scalar_to_string(&cells[1]);
        let entity_type = redis_scalar_to_string(&cells[2]);
        let predicate = redis_scalar_to_string(&cells[3]);
        let hop: u32 = redis_scalar_to_string(&cells[4]).parse().unwrap_or(1);
        if entity_id.is_empty() {
            continue;
        }
        out.push(Neighbour {
            entity_id,
            name,
            entity_type,
            predicate,
            hop,
        });
    }
    out
}

fn redis_scalar_to_string(value: &redis::Value) -> String {
    match value {
        redis::Value::BulkString(b) => String::from_utf8_lossy(b).to_string(),
        redis::Value::SimpleString(s) => s.clone(),
        redis::Value::Int(i) => i.to_string(),
        redis::Value::Double(d) => d.to_string(),
        _ => {
            warn!("unexpected GRAPH.QUERY cell shape: {value:?}");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cypher_string_escapes_quotes() {
        assert_eq!(cypher_string("O'Brien"), "'O\\'Brien'");
    }

    #[test]
    fn parse_neighbour_rows_handles_empty_result() {
        let value = redis::Value::Array(vec![
            redis::Value::Array(vec![]),
            redis::Value::Array(vec![]),
            redis::Value::Array(vec![]),
        ]);
        assert!(parse_neighbour_rows(&value).is_empty());
    }
}
