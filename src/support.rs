use anyhow::{Context, Result};
use serde_json::json;

use crate::config::AppConfig;
use crate::db::Database;
use crate::embedding::EmbedClient;
use crate::models::{Chunk, RerankResponse, SupportRow};
use crate::ollama::OllamaClient;
use crate::qdrant_store::QdrantStore;

const SCENE_PROMPT_CHAR_MAX: usize = 2500;

/// Outcome of the two-stage selection for one scene. `picked` is in rank
/// order (the LLM's preference, or stage-1 order on fallback).
#[derive(Debug, Clone)]
pub struct SceneSupport {
    pub rows: Vec<SupportRow>,
    pub picked: Vec<Chunk>,
    pub notes: String,
    pub fallback: bool,
}

#[derive(Clone)]
pub struct SupportSelector {
    db: Database,
    store: QdrantStore,
    embedder: EmbedClient,
    ollama: OllamaClient,
    config: AppConfig,
}

impl SupportSelector {
    pub fn new(
        db: Database,
        store: QdrantStore,
        embedder: EmbedClient,
        ollama: OllamaClient,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            store,
            embedder,
            ollama,
            config,
        }
    }

    /// Stage 1: KNN over the work's chunks. Stage 2: LLM rerank down to
    /// `RERANK_KEEP_M`. A malformed rerank response falls back to stage-1
    /// order rather than failing the scene.
    pub async fn select(
        &self,
        work_id: &str,
        scene_id: &str,
        scene_text: &str,
    ) -> Result<SceneSupport> {
        let vector = self
            .embedder
            .embed(scene_text)
            .await
            .context("embedding scene for support retrieval")?;

        let hits = self
            .store
            .query_work_chunks(
                &self.config.chunk_collection,
                self.config.per_work_collections,
                work_id,
                &vector,
                self.config.judge.rerank_top_k,
            )
            .await
            .context("stage-1 chunk retrieval")?;

        // Stage-1 similarities, deduped by chunk id, best first.
        let mut stage1: Vec<(String, f32)> = Vec::new();
        for hit in &hits {
            if stage1.iter().any(|(id, _)| id == &hit.id) {
                continue;
            }
            stage1.push((hit.id.clone(), hit.score.clamp(0.0, 1.0)));
        }
        stage1.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let ids: Vec<String> = stage1.iter().map(|(id, _)| id.clone()).collect();
        let chunks = self.db.chunks_by_ids(&ids).await?;

        let keep_m = self.config.judge.rerank_keep_m.min(stage1.len());
        let (picked_ids, notes, fallback) = if keep_m == 0 {
            (vec![], String::new(), false)
        } else {
            match self.rerank(scene_text, &stage1, &chunks, keep_m).await {
                Ok((ids, notes)) if !ids.is_empty() => (ids, notes, false),
                Ok(_) => (fallback_ids(&stage1, keep_m), "fallback=knn".to_string(), true),
                Err(err) => {
                    tracing::warn!(scene_id, error = %err, "rerank failed, falling back to stage-1 order");
                    (fallback_ids(&stage1, keep_m), "fallback=knn".to_string(), true)
                }
            }
        };

        let rows = build_rows(scene_id, &stage1, &picked_ids);
        let picked = picked_ids
            .iter()
            .filter_map(|id| chunks.iter().find(|c| &c.id == id).cloned())
            .collect();

        Ok(SceneSupport {
            rows,
            picked,
            notes,
            fallback,
        })
    }

    async fn rerank(
        &self,
        scene_text: &str,
        stage1: &[(String, f32)],
        chunks: &[Chunk],
        keep_m: usize,
    ) -> Result<(Vec<String>, String)> {
        let items: Vec<serde_json::Value> = stage1
            .iter()
            .filter_map(|(id, score)| {
                let chunk = chunks.iter().find(|c| &c.id == id)?;
                Some(json!({
                    "id": id,
                    "knn": (score * 1000.0).round() / 1000.0,
                    "len": chunk.text.chars().count(),
                    "snippet": truncate_chars(&chunk.text, self.config.judge.rerank_doc_char_max),
                }))
            })
            .collect();

        let prompt = format!(
            "You pick the snippets most directly useful for judging which narrative tropes \
             are present in a scene. Prefer snippets with concrete local evidence (actions, \
             claims, dialogue) that narratively entail a trope; penalize generic background \
             even when it is long or similar. When two snippets are equally relevant, prefer \
             the higher knn score.\n\n\
             Scene (trimmed):\n\"\"\"{scene}\"\"\"\n\n\
             Candidate snippets (id, knn = stage-1 similarity 0..1, len, snippet):\n{items}\n\n\
             Choose the {m} most directly supporting snippets.\n\
             Return STRICT JSON ONLY:\n\
             {{\"picked\": [\"<chunk_id>\", ...], \"notes\": \"one short reason\"}}",
            scene = truncate_chars(scene_text, SCENE_PROMPT_CHAR_MAX),
            items = serde_json::to_string_pretty(&items)?,
            m = keep_m,
        );

        let raw = self
            .ollama
            .generate_json(
                &self.config.models.reasoner_model,
                &prompt,
                self.config.llm_timeout,
            )
            .await?;

        let response: RerankResponse =
            serde_json::from_str(&raw).context("rerank response was not the expected JSON")?;

        // Only ids the model was shown count, in the model's preference order.
        let mut picked: Vec<String> = Vec::new();
        for id in response.picked {
            if stage1.iter().any(|(known, _)| known == &id) && !picked.contains(&id) {
                picked.push(id);
            }
            if picked.len() == keep_m {
                break;
            }
        }
        Ok((picked, response.notes))
    }
}

fn fallback_ids(stage1: &[(String, f32)], keep_m: usize) -> Vec<String> {
    stage1.iter().take(keep_m).map(|(id, _)| id.clone()).collect()
}

/// All `k` stage-1 rows are persisted. Picked rows get ranks 1..M in LLM
/// preference order and `stage2_score = 1`; the rest follow in stage-1
/// order with `stage2_score = 0`.
fn build_rows(scene_id: &str, stage1: &[(String, f32)], picked: &[String]) -> Vec<SupportRow> {
    let mut rows = Vec::with_capacity(stage1.len());
    for (rank, id) in picked.iter().enumerate() {
        let stage1_score = stage1
            .iter()
            .find(|(known, _)| known == id)
            .map(|(_, s)| *s)
            .unwrap_or(0.0);
        rows.push(SupportRow {
            scene_id: scene_id.to_string(),
            chunk_id: id.clone(),
            rank: (rank + 1) as i64,
            stage1_score,
            stage2_score: 1.0,
            picked: true,
        });
    }
    let mut next_rank = picked.len() as i64;
    for (id, score) in stage1 {
        if picked.contains(id) {
            continue;
        }
        next_rank += 1;
        rows.push(SupportRow {
            scene_id: scene_id.to_string(),
            chunk_id: id.clone(),
            rank: next_rank,
            stage1_score: *score,
            stage2_score: 0.0,
            picked: false,
        });
    }
    rows
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('\u{2026}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage1() -> Vec<(String, f32)> {
        vec![
            ("c1".to_string(), 0.9),
            ("c2".to_string(), 0.8),
            ("c3".to_string(), 0.7),
            ("c4".to_string(), 0.6),
        ]
    }

    #[test]
    fn rows_cover_all_stage1_hits_with_picked_ranked_first() {
        let picked = vec!["c3".to_string(), "c1".to_string()];
        let rows = build_rows("s1", &stage1(), &picked);
        assert_eq!(rows.len(), 4);

        assert_eq!(rows[0].chunk_id, "c3");
        assert_eq!(rows[0].rank, 1);
        assert!(rows[0].picked);
        assert_eq!(rows[0].stage2_score, 1.0);

        assert_eq!(rows[1].chunk_id, "c1");
        assert_eq!(rows[1].rank, 2);

        let unpicked: Vec<&SupportRow> = rows.iter().filter(|r| !r.picked).collect();
        assert_eq!(unpicked.len(), 2);
        assert!(unpicked.iter().all(|r| r.stage2_score == 0.0));
        assert_eq!(unpicked[0].chunk_id, "c2");
        assert_eq!(unpicked[0].rank, 3);
        assert_eq!(unpicked[1].chunk_id, "c4");
        assert_eq!(unpicked[1].rank, 4);
    }

    #[test]
    fn fallback_takes_top_m_by_stage1() {
        assert_eq!(fallback_ids(&stage1(), 2), vec!["c1", "c2"]);
        assert_eq!(fallback_ids(&stage1(), 9).len(), 4);
    }

    #[test]
    fn rerank_response_parses_strictly() {
        let ok: RerankResponse =
            serde_json::from_str(r#"{"picked":["c2","c1"],"notes":"direct evidence"}"#).unwrap();
        assert_eq!(ok.picked, vec!["c2", "c1"]);

        let missing_notes: RerankResponse = serde_json::from_str(r#"{"picked":[]}"#).unwrap();
        assert!(missing_notes.picked.is_empty());

        assert!(serde_json::from_str::<RerankResponse>("pick c1 and c2").is_err());
        assert!(serde_json::from_str::<RerankResponse>(r#"{"notes":"no picked"}"#).is_err());
    }

    #[test]
    fn truncation_is_code_point_safe() {
        let text = "ab\u{e9}\u{e9}cd";
        let cut = truncate_chars(text, 4);
        assert_eq!(cut.chars().count(), 4);
        assert!(cut.ends_with('\u{2026}'));
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
