use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::config::JudgeConfig;
use crate::embedding::{cosine, EmbedClient};
use crate::gazetteer::TropeMatcher;
use crate::models::{Chunk, Trope, TropeSanity};

/// Prior weight for one candidate trope. A trope that is neither mentioned
/// lexically nor semantically close to the scene gets downweighted before
/// judging; everything else passes through untouched.
pub fn weight_for(lex_ok: bool, sem_sim: f32, config: &JudgeConfig) -> f32 {
    if !lex_ok && sem_sim < config.sem_sim_threshold {
        config.downweight_no_mention
    } else {
        1.0
    }
}

/// Compute `(lex_ok, sem_sim, weight)` for every candidate trope in a scene.
///
/// The lexical check reuses the gazetteer matcher read-only over the scene
/// text and the picked support chunks. The semantic check takes the best
/// cosine between the trope definition vector and the scene/support vectors.
pub async fn compute_sanity(
    embedder: &EmbedClient,
    matchers: &HashMap<String, TropeMatcher>,
    tropes: &HashMap<String, Trope>,
    scene_id: &str,
    scene_text: &str,
    picked_supports: &[Chunk],
    candidate_trope_ids: &[String],
    config: &JudgeConfig,
) -> Result<Vec<TropeSanity>> {
    if candidate_trope_ids.is_empty() {
        return Ok(vec![]);
    }

    let scene_vec = embedder
        .embed(scene_text)
        .await
        .context("embedding scene for sanity prior")?;

    let mut support_vecs = Vec::with_capacity(picked_supports.len());
    for chunk in picked_supports {
        let vec = embedder
            .embed(&chunk.text)
            .await
            .with_context(|| format!("embedding support chunk {}", chunk.id))?;
        support_vecs.push(vec);
    }

    let mut out = Vec::with_capacity(candidate_trope_ids.len());
    for trope_id in candidate_trope_ids {
        let Some(trope) = tropes.get(trope_id) else {
            continue;
        };
        let Some(matcher) = matchers.get(trope_id) else {
            continue;
        };

        let lex_ok = matcher.has_mention(scene_text)
            || picked_supports.iter().any(|c| matcher.has_mention(&c.text));

        let trope_vec = embedder
            .embed(&trope.query_text())
            .await
            .with_context(|| format!("embedding trope definition {trope_id}"))?;

        let mut sem_sim = cosine(&trope_vec, &scene_vec);
        for vec in &support_vecs {
            sem_sim = sem_sim.max(cosine(&trope_vec, vec));
        }

        out.push(TropeSanity {
            scene_id: scene_id.to_string(),
            trope_id: trope_id.clone(),
            lex_ok,
            sem_sim,
            weight: weight_for(lex_ok, sem_sim, config),
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(sem_sim_threshold: f32) -> JudgeConfig {
        JudgeConfig {
            threshold: 0.25,
            trope_top_k: 16,
            rerank_top_k: 8,
            rerank_keep_m: 3,
            rerank_doc_char_max: 480,
            downweight_no_mention: 0.55,
            sem_sim_threshold,
        }
    }

    #[test]
    fn no_mention_and_low_similarity_downweights() {
        let cfg = config(0.36);
        assert_eq!(weight_for(false, 0.10, &cfg), 0.55);
    }

    #[test]
    fn mention_or_similarity_keeps_full_weight() {
        let cfg = config(0.36);
        assert_eq!(weight_for(true, 0.0, &cfg), 1.0);
        assert_eq!(weight_for(false, 0.36, &cfg), 1.0);
        assert_eq!(weight_for(false, 0.9, &cfg), 1.0);
    }

    #[test]
    fn raising_the_threshold_only_shrinks_the_full_weight_set() {
        // Monotonicity: any (lex_ok, sem_sim) pair that downweights at a low
        // threshold still downweights at a higher one.
        let sims = [0.0, 0.2, 0.36, 0.5, 0.8];
        for lex_ok in [false, true] {
            for sim in sims {
                let low = weight_for(lex_ok, sim, &config(0.36));
                let high = weight_for(lex_ok, sim, &config(0.60));
                assert!(high <= low);
            }
        }
    }
}
