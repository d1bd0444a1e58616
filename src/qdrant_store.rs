use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

/// One vector-store match, with the score already expressed as cosine
/// similarity (Qdrant returns similarity directly for cosine collections;
/// stores that return distance would be converted here as `1 - distance`).
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: VectorPayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorPayload {
    pub chunk_id: Option<String>,
    pub trope_id: Option<String>,
    pub work_id: Option<String>,
    pub scene_id: Option<String>,
    pub chunk_idx: Option<i64>,
    pub char_start: Option<i64>,
    pub char_end: Option<i64>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QdrantPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

#[derive(Clone)]
pub struct QdrantStore {
    client: Client,
    base_url: String,
    timeout: Duration,
    known_vector_sizes: Arc<RwLock<Vec<(String, usize)>>>,
}

impl QdrantStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            timeout,
            known_vector_sizes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn ensure_collection(&self, collection: &str, vector_size: usize) -> Result<()> {
        {
            let known = self.known_vector_sizes.read().await;
            if known.iter().any(|(name, size)| name == collection && *size == vector_size) {
                return Ok(());
            }
        }

        let create_url = format!("{}/collections/{}", self.base_url, collection);
        let payload = json!({
            "vectors": {
                "size": vector_size,
                "distance": "Cosine"
            }
        });

        // PUT is idempotent when the collection already exists with the same
        // shape; a conflicting shape surfaces as an error status.
        let response = self
            .client
            .put(create_url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .context("failed to contact qdrant while creating collection")?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::CONFLICT {
            anyhow::bail!(
                "qdrant failed to create collection {collection}: {}",
                response.status()
            );
        }

        self.known_vector_sizes
            .write()
            .await
            .push((collection.to_string(), vector_size));
        Ok(())
    }

    pub async fn upsert(&self, collection: &str, points: &[QdrantPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        self.ensure_collection(collection, points[0].vector.len())
            .await?;

        let upsert_url = format!(
            "{}/collections/{}/points?wait=true",
            self.base_url, collection
        );
        let body = json!({ "points": points });

        self.client
            .put(upsert_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("failed to contact qdrant during upsert")?
            .error_for_status()
            .context("qdrant upsert returned non-success status")?;

        Ok(())
    }

    /// KNN query with optional equality filters over payload keys.
    pub async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filters: &[(&str, &str)],
    ) -> Result<Vec<VectorHit>> {
        if vector.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, collection
        );

        let mut body = json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        if !filters.is_empty() {
            let must: Vec<serde_json::Value> = filters
                .iter()
                .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
                .collect();
            body["filter"] = json!({ "must": must });
        }

        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("failed to contact qdrant during search")?
            .error_for_status()
            .context("qdrant search returned non-success status")?
            .json::<QdrantSearchResponse>()
            .await
            .context("failed to decode qdrant search response")?;

        Ok(response
            .result
            .into_iter()
            .map(|point| {
                let payload = point.payload.unwrap_or_default();
                let id = payload
                    .chunk_id
                    .clone()
                    .or_else(|| payload.trope_id.clone())
                    .unwrap_or_else(|| point_id_string(&point.id));
                VectorHit {
                    id,
                    score: point.score,
                    payload,
                }
            })
            .collect())
    }

    /// Query the chunk space for one work. In per-work mode the dedicated
    /// collection is tried first (falling back to the global collection with
    /// a `work_id` filter when empty); otherwise the filter path is used.
    /// Both paths return the same candidate set for the same inputs.
    pub async fn query_work_chunks(
        &self,
        base_collection: &str,
        per_work_collections: bool,
        work_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        if per_work_collections {
            let scoped = format!("{base_collection}__{work_id}");
            match self.query(&scoped, vector, k, &[]).await {
                Ok(hits) if !hits.is_empty() => return Ok(hits),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(collection = %scoped, error = %err, "per-work query failed, falling back to global collection");
                }
            }
        }
        self.query(base_collection, vector, k, &[("work_id", work_id)])
            .await
    }
}

#[derive(Debug, Deserialize)]
struct QdrantSearchResponse {
    result: Vec<QdrantResultPoint>,
}

#[derive(Debug, Deserialize)]
struct QdrantResultPoint {
    id: serde_json::Value,
    score: f32,
    payload: Option<VectorPayload>,
}

fn point_id_string(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_decodes_and_prefers_chunk_id() {
        let raw = r#"{
            "result": [
                {"id": "p1", "score": 0.83,
                 "payload": {"chunk_id": "c1", "work_id": "w1", "scene_id": "s1"}},
                {"id": "p2", "score": 0.42, "payload": null}
            ]
        }"#;
        let decoded: QdrantSearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded.result.len(), 2);
        assert_eq!(decoded.result[0].payload.as_ref().unwrap().chunk_id.as_deref(), Some("c1"));
        assert!((decoded.result[0].score - 0.83).abs() < 1e-6);
    }

    #[test]
    fn point_serializes_with_payload() {
        let point = QdrantPoint {
            id: "c1".into(),
            vector: vec![0.1, 0.2],
            payload: VectorPayload {
                chunk_id: Some("c1".into()),
                work_id: Some("w1".into()),
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&point).unwrap();
        assert_eq!(value["payload"]["chunk_id"], "c1");
        assert_eq!(value["vector"][1], 0.2);
    }
}
