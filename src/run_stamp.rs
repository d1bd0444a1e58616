use anyhow::Result;
use serde::Serialize;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::Database;
use crate::judge::PROMPT_VERSION;
use crate::models::Trope;
use crate::text_index::sha256_hex;

/// Canonical parameter record stored with every run. Field order is fixed
/// by the struct, so the serialized JSON is stable for identical inputs.
#[derive(Debug, Serialize)]
struct RunParams<'a> {
    work_id: &'a str,
    embed_model: &'a str,
    reasoner_model: &'a str,
    chunk_collection: &'a str,
    trope_collection: &'a str,
    per_work_collections: bool,
    threshold: f32,
    trope_top_k: usize,
    rerank_top_k: usize,
    rerank_keep_m: usize,
    downweight_no_mention: f32,
    sem_sim_threshold: f32,
    sem_tau: f32,
    sem_top_n: usize,
    sem_per_scene_cap: usize,
    anti_window: usize,
    span_verifier_threshold: f32,
    span_verifier_max_sent: usize,
    negation_mode: &'a str,
    neg_downweight: f32,
    meta_downweight: f32,
    aa_downweight: f32,
    n_embed: usize,
    n_scenes: usize,
    prompt_version: &'a str,
    calibration_version: Option<&'a str>,
    trope_catalog_sha: &'a str,
}

/// SHA-256 over the catalog's judging-relevant fields, in id order, so a
/// run can prove which catalog it saw.
pub fn catalog_sha(tropes: &[Trope]) -> String {
    let mut sorted: Vec<&Trope> = tropes.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut blob = String::new();
    for trope in sorted {
        blob.push_str(&trope.id);
        blob.push('\u{1f}');
        blob.push_str(&trope.name);
        blob.push('\u{1f}');
        blob.push_str(&trope.summary);
        blob.push('\u{1f}');
        blob.push_str(&trope.aliases.join("\u{1e}"));
        blob.push('\u{1f}');
        blob.push_str(&trope.anti_aliases.join("\u{1e}"));
        blob.push('\n');
    }
    sha256_hex(&blob)
}

/// Insert the run row and return its id. Every finding written afterwards
/// carries this id.
pub async fn stamp_run(
    db: &Database,
    config: &AppConfig,
    work_id: &str,
    tropes: &[Trope],
) -> Result<String> {
    let sha = catalog_sha(tropes);
    let params = RunParams {
        work_id,
        embed_model: &config.models.embed_model,
        reasoner_model: &config.models.reasoner_model,
        chunk_collection: &config.chunk_collection,
        trope_collection: &config.trope_collection,
        per_work_collections: config.per_work_collections,
        threshold: config.judge.threshold,
        trope_top_k: config.judge.trope_top_k,
        rerank_top_k: config.judge.rerank_top_k,
        rerank_keep_m: config.judge.rerank_keep_m,
        downweight_no_mention: config.judge.downweight_no_mention,
        sem_sim_threshold: config.judge.sem_sim_threshold,
        sem_tau: config.seed.sem_tau,
        sem_top_n: config.seed.sem_top_n,
        sem_per_scene_cap: config.seed.sem_per_scene_cap,
        anti_window: config.seed.anti_window,
        span_verifier_threshold: config.verifier.span_threshold,
        span_verifier_max_sent: config.verifier.max_sentences,
        negation_mode: config.verifier.negation_mode.as_str(),
        neg_downweight: config.verifier.neg_downweight,
        meta_downweight: config.verifier.meta_downweight,
        aa_downweight: config.verifier.aa_downweight,
        n_embed: config.n_embed,
        n_scenes: config.n_scenes,
        prompt_version: PROMPT_VERSION,
        calibration_version: config.calibration_version.as_deref(),
        trope_catalog_sha: &sha,
    };

    let run_id = Uuid::new_v4().to_string();
    db.insert_run(&run_id, &serde_json::to_string(&params)?).await?;
    Ok(run_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trope(id: &str, name: &str) -> Trope {
        Trope {
            id: id.into(),
            name: name.into(),
            summary: "s".into(),
            aliases: vec!["a".into()],
            anti_aliases: vec![],
        }
    }

    #[test]
    fn catalog_sha_is_order_independent() {
        let forward = vec![trope("a", "Alpha"), trope("b", "Beta")];
        let reversed = vec![trope("b", "Beta"), trope("a", "Alpha")];
        assert_eq!(catalog_sha(&forward), catalog_sha(&reversed));
    }

    #[test]
    fn catalog_sha_changes_with_content() {
        let one = vec![trope("a", "Alpha")];
        let two = vec![trope("a", "Alpha Prime")];
        assert_ne!(catalog_sha(&one), catalog_sha(&two));
    }
}
