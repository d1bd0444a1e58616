use anyhow::{Context, Result};

use crate::config::AppConfig;
use crate::db::Database;
use crate::embedding::EmbedClient;
use crate::models::Chunk;
use crate::qdrant_store::{QdrantPoint, QdrantStore, VectorPayload};

const UPSERT_BATCH: usize = 64;

/// Embed all chunks not yet stamped for the target collection and upsert
/// them into the vector store. Canonical text stays in SQLite; the store
/// holds vectors plus lookup metadata. Safe to re-run: only new chunks are
/// embedded, tracked per collection in `embedding_ref`.
pub async fn embed_chunks(
    db: &Database,
    store: &QdrantStore,
    embedder: &EmbedClient,
    config: &AppConfig,
    work_id: Option<&str>,
) -> Result<usize> {
    let work_ids: Vec<String> = match work_id {
        Some(id) => vec![id.to_string()],
        None => db.work_ids().await?,
    };

    let mut total = 0usize;
    for w_id in &work_ids {
        let collection = config.chunk_collection_for(w_id);
        let chunks = db.unembedded_chunks(&collection, Some(w_id)).await?;
        if chunks.is_empty() {
            tracing::info!(work_id = %w_id, "chunks up to date, nothing to embed");
            continue;
        }
        tracing::info!(work_id = %w_id, collection = %collection, count = chunks.len(), "embedding chunks");

        let mut batch: Vec<QdrantPoint> = Vec::with_capacity(UPSERT_BATCH);
        let mut batch_ids: Vec<String> = Vec::with_capacity(UPSERT_BATCH);
        for chunk in &chunks {
            let vector = match embedder.embed(&chunk.text).await {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(chunk_id = %chunk.id, error = %err, "embedding failed, skipping chunk");
                    continue;
                }
            };
            batch.push(chunk_point(chunk, vector, embedder.model()));
            batch_ids.push(chunk.id.clone());

            if batch.len() >= UPSERT_BATCH {
                flush(db, store, &collection, embedder.model(), &mut batch, &mut batch_ids)
                    .await?;
            }
        }
        flush(db, store, &collection, embedder.model(), &mut batch, &mut batch_ids).await?;
        total += chunks.len();
    }

    Ok(total)
}

/// Embed every trope definition into the catalog collection.
pub async fn embed_catalog(
    db: &Database,
    store: &QdrantStore,
    embedder: &EmbedClient,
    config: &AppConfig,
) -> Result<usize> {
    let tropes = db.load_tropes().await?;
    let mut points: Vec<QdrantPoint> = Vec::new();
    for trope in &tropes {
        let query_text = trope.query_text();
        if query_text.is_empty() {
            continue;
        }
        let vector = embedder
            .embed(&query_text)
            .await
            .with_context(|| format!("embedding trope {}", trope.id))?;
        points.push(QdrantPoint {
            id: trope.id.clone(),
            vector,
            payload: VectorPayload {
                trope_id: Some(trope.id.clone()),
                model: Some(embedder.model().to_string()),
                ..Default::default()
            },
        });

        if points.len() >= UPSERT_BATCH {
            store.upsert(&config.trope_collection, &points).await?;
            points.clear();
        }
    }
    store.upsert(&config.trope_collection, &points).await?;
    Ok(tropes.len())
}

fn chunk_point(chunk: &Chunk, vector: Vec<f32>, model: &str) -> QdrantPoint {
    QdrantPoint {
        id: chunk.id.clone(),
        vector,
        payload: VectorPayload {
            chunk_id: Some(chunk.id.clone()),
            work_id: Some(chunk.work_id.clone()),
            scene_id: Some(chunk.scene_id.clone()),
            chunk_idx: Some(chunk.idx),
            char_start: Some(chunk.char_start),
            char_end: Some(chunk.char_end),
            model: Some(model.to_string()),
            ..Default::default()
        },
    }
}

async fn flush(
    db: &Database,
    store: &QdrantStore,
    collection: &str,
    model: &str,
    batch: &mut Vec<QdrantPoint>,
    batch_ids: &mut Vec<String>,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let dim = batch[0].vector.len();
    store
        .upsert(collection, batch)
        .await
        .context("vector upsert failed")?;
    db.mark_embedded(collection, model, dim, batch_ids).await?;
    batch.clear();
    batch_ids.clear();
    Ok(())
}
