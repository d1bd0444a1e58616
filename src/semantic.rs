use std::collections::HashMap;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::Database;
use crate::embedding::EmbedClient;
use crate::models::{CandidateSource, Chunk, Trope, TropeCandidate};
use crate::qdrant_store::QdrantStore;

/// Seed candidates by semantic affinity: each trope's definition is embedded
/// and matched against the work's chunk vectors. A hit above `SEM_TAU`
/// becomes a candidate whose span is the whole chunk.
pub async fn seed_semantic(
    db: &Database,
    store: &QdrantStore,
    embedder: &EmbedClient,
    config: &AppConfig,
    work_id: &str,
    chunks: &[Chunk],
    tropes: &[Trope],
) -> Result<usize> {
    let chunk_by_id: HashMap<&str, &Chunk> =
        chunks.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut inserted = 0usize;
    let mut per_scene: HashMap<(String, String), usize> = HashMap::new();

    for trope in tropes {
        let query_text = trope.query_text();
        if query_text.is_empty() {
            continue;
        }

        let vector = embedder
            .embed(&query_text)
            .await
            .with_context(|| format!("embedding trope {}", trope.id))?;

        let hits = store
            .query_work_chunks(
                &config.chunk_collection,
                config.per_work_collections,
                work_id,
                &vector,
                config.seed.sem_top_n.max(1),
            )
            .await
            .with_context(|| format!("chunk query for trope {}", trope.id))?;

        // Normalize, threshold, then rank by similarity with ties broken by
        // earlier chunk position so the per-scene cap is deterministic.
        let mut ranked: Vec<(&Chunk, f32)> = Vec::new();
        let mut seen_chunks: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for hit in &hits {
            let Some(chunk) = chunk_by_id.get(hit.id.as_str()).copied() else {
                continue;
            };
            if !seen_chunks.insert(chunk.id.as_str()) {
                continue;
            }
            let similarity = hit.score.clamp(0.0, 1.0);
            if similarity < config.seed.sem_tau {
                continue;
            }
            ranked.push((chunk, similarity));
        }
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.idx.cmp(&b.0.idx))
        });

        for (chunk, similarity) in ranked {
            let key = (trope.id.clone(), chunk.scene_id.clone());
            let count = per_scene.get(&key).copied().unwrap_or(0);
            if count >= config.seed.sem_per_scene_cap {
                continue;
            }

            let candidate = TropeCandidate {
                id: Uuid::new_v4().to_string(),
                work_id: work_id.to_string(),
                scene_id: chunk.scene_id.clone(),
                chunk_id: Some(chunk.id.clone()),
                trope_id: trope.id.clone(),
                surface: None,
                alias: None,
                start: chunk.char_start,
                end: chunk.char_end,
                source: CandidateSource::Semantic,
                score: similarity,
            };
            if db.insert_candidate(&candidate).await? {
                inserted += 1;
                per_scene.insert(key, count + 1);
            }
        }
    }

    Ok(inserted)
}
