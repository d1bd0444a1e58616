use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::{Chunk, FindingLevel, JudgeItem, Scene, TropeFinding, TropeSanity};
use crate::ollama::OllamaClient;

/// Version header baked into every judge prompt. Changing the prompt text
/// bumps the version, and the run parameters capture it.
pub const PROMPT_VERSION: &str = "TROPE-MINER-PROMPT-V2";

#[derive(Debug, Error)]
pub enum JudgeError {
    /// The model's output was not the contracted JSON. The whole scene is
    /// skipped; no partial findings are written.
    #[error("judge returned malformed JSON: {0}")]
    Parse(String),

    #[error(transparent)]
    Service(#[from] anyhow::Error),
}

/// One shortlisted trope shown to the judge, with its priors.
#[derive(Debug, Clone)]
pub struct ShortlistEntry {
    pub trope_id: String,
    pub name: String,
    pub summary: String,
    pub lex_ok: bool,
    pub sem_sim: f32,
    pub weight: f32,
    pub seed_score: f32,
}

#[derive(Debug, Default)]
pub struct EvaluatedScene {
    pub findings: Vec<TropeFinding>,
    pub bad_spans: usize,
    pub below_threshold: usize,
    pub unknown_tropes: usize,
}

/// Rank candidates by `weight * (seed_score + sem_sim)` and cap the list
/// shown to the model at `TROPE_TOP_K`.
pub fn build_shortlist(
    candidates: &[(String, f32)],
    sanity: &[TropeSanity],
    names: &HashMap<String, (String, String)>,
    cap: usize,
) -> Vec<ShortlistEntry> {
    let sanity_by_trope: HashMap<&str, &TropeSanity> =
        sanity.iter().map(|s| (s.trope_id.as_str(), s)).collect();

    let mut entries: Vec<ShortlistEntry> = candidates
        .iter()
        .filter_map(|(trope_id, seed_score)| {
            let (name, summary) = names.get(trope_id)?.clone();
            let sane = sanity_by_trope.get(trope_id.as_str());
            Some(ShortlistEntry {
                trope_id: trope_id.clone(),
                name,
                summary,
                lex_ok: sane.map(|s| s.lex_ok).unwrap_or(false),
                sem_sim: sane.map(|s| s.sem_sim).unwrap_or(0.0),
                weight: sane.map(|s| s.weight).unwrap_or(1.0),
                seed_score: *seed_score,
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        let pa = a.weight * (a.seed_score + a.sem_sim);
        let pb = b.weight * (b.seed_score + b.sem_sim);
        pb.partial_cmp(&pa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.trope_id.cmp(&b.trope_id))
    });
    entries.truncate(cap);
    entries
}

pub fn build_prompt(
    scene: &Scene,
    scene_text: &str,
    supports: &[Chunk],
    shortlist: &[ShortlistEntry],
    threshold: f32,
) -> String {
    let mut defs = String::new();
    for entry in shortlist {
        defs.push_str(&format!(
            "- {} :: {} \u{2014} {} [lex_ok={} sem_sim={:.3} prior_weight={:.2}]\n",
            entry.trope_id,
            entry.name,
            entry.summary,
            entry.lex_ok as u8,
            entry.sem_sim,
            entry.weight,
        ));
    }

    let mut support_block = String::new();
    for chunk in supports {
        support_block.push_str(&format!(
            "[{}] (chars {}-{})\n{}\n---\n",
            chunk.id, chunk.char_start, chunk.char_end, chunk.text
        ));
    }
    if support_block.is_empty() {
        support_block.push_str("(none)\n");
    }

    let allowed: Vec<&str> = shortlist.iter().map(|e| e.trope_id.as_str()).collect();

    format!(
        "{header}\n\
         You are a precise trope-mining assistant. Given a scene, candidate tropes with \
         their definitions and prior weights, and retrieved support snippets, decide which \
         tropes are PRESENT in the scene. Be conservative and evidence-based.\n\n\
         SCENE (absolute chars {start}-{end}):\n{scene_text}\n\n\
         CANDIDATE TROPES (id :: name \u{2014} summary [priors]):\n{defs}\n\
         PRIOR_WEIGHTS are advisory context; confidences are still judged on the evidence.\n\n\
         RETRIEVED SUPPORT (id, absolute char range, text):\n{support_block}\n\
         Return a JSON array. Each item:\n\
         {{\"trope_id\": string, \"confidence\": number 0..1, \
         \"evidence_start\": int, \"evidence_end\": int, \"rationale\": string}}\n\
         evidence_start/evidence_end are absolute offsets into the work text and must lie \
         inside the scene range {start}-{end}. Use only trope_id values from this list: \
         {allowed}. Include only tropes with confidence >= {threshold}.",
        header = PROMPT_VERSION,
        start = scene.char_start,
        end = scene.char_end,
        scene_text = scene_text,
        defs = defs,
        support_block = support_block,
        allowed = serde_json::to_string(&allowed).unwrap_or_else(|_| "[]".to_string()),
        threshold = threshold,
    )
}

/// Strict parse of the judge response: a JSON array of items, or an object
/// wrapping one under `findings` (some models insist on a top-level object
/// in JSON mode). Anything else is a parse failure.
pub fn parse_judgement(raw: &str) -> Result<Vec<JudgeItem>, JudgeError> {
    if let Ok(items) = serde_json::from_str::<Vec<JudgeItem>>(raw) {
        return Ok(items);
    }

    #[derive(serde::Deserialize)]
    struct Wrapped {
        findings: Vec<JudgeItem>,
    }
    if let Ok(wrapped) = serde_json::from_str::<Wrapped>(raw) {
        return Ok(wrapped.findings);
    }

    let preview: String = raw.chars().take(200).collect();
    Err(JudgeError::Parse(preview))
}

/// Apply priors and the threshold law to the model's items.
///
/// The model's confidence is never trusted as-is: it is multiplied by the
/// sanity weight, and the product is compared against the per-trope
/// threshold when one exists, else the global threshold. Items with spans
/// outside the scene (or inverted) are rejected individually.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_items(
    items: &[JudgeItem],
    shortlist: &[ShortlistEntry],
    scene: &Scene,
    work_char_count: i64,
    per_trope_thresholds: &HashMap<String, f32>,
    config: &AppConfig,
    run_id: &str,
) -> EvaluatedScene {
    let by_id: HashMap<&str, &ShortlistEntry> =
        shortlist.iter().map(|e| (e.trope_id.as_str(), e)).collect();

    let mut out = EvaluatedScene::default();
    for item in items {
        let Some(entry) = by_id.get(item.trope_id.as_str()) else {
            out.unknown_tropes += 1;
            continue;
        };

        let start = item.evidence_start;
        let end = item.evidence_end;
        let inside_scene = start >= scene.char_start && end <= scene.char_end;
        if end < start || !inside_scene || start < 0 || end > work_char_count {
            out.bad_spans += 1;
            continue;
        }

        let adjusted = (item.confidence.clamp(0.0, 1.0) * entry.weight).clamp(0.0, 1.0);
        let threshold_used = per_trope_thresholds
            .get(&entry.trope_id)
            .copied()
            .unwrap_or(config.judge.threshold);
        if adjusted < threshold_used {
            out.below_threshold += 1;
            continue;
        }

        out.findings.push(TropeFinding {
            id: Uuid::new_v4().to_string(),
            work_id: scene.work_id.clone(),
            scene_id: scene.id.clone(),
            chunk_id: None,
            trope_id: entry.trope_id.clone(),
            level: FindingLevel::Span,
            confidence: adjusted,
            rationale: item.rationale.clone(),
            evidence_start: start,
            evidence_end: end,
            model: config.models.reasoner_model.clone(),
            verifier_score: None,
            verifier_flag: None,
            calibration_version: config.calibration_version.clone(),
            threshold_used,
            run_id: run_id.to_string(),
        });
    }
    out
}

/// Full judge pass for one scene: prompt, parse, evaluate.
#[allow(clippy::too_many_arguments)]
pub async fn judge_scene(
    ollama: &OllamaClient,
    config: &AppConfig,
    scene: &Scene,
    scene_text: &str,
    supports: &[Chunk],
    shortlist: &[ShortlistEntry],
    per_trope_thresholds: &HashMap<String, f32>,
    work_char_count: i64,
    run_id: &str,
) -> Result<EvaluatedScene, JudgeError> {
    if shortlist.is_empty() {
        return Ok(EvaluatedScene::default());
    }

    let prompt = build_prompt(scene, scene_text, supports, shortlist, config.judge.threshold);
    let raw = ollama
        .generate_json(&config.models.reasoner_model, &prompt, config.llm_timeout)
        .await
        .map_err(JudgeError::Service)?;

    let items = parse_judgement(&raw)?;
    Ok(evaluate_items(
        &items,
        shortlist,
        scene,
        work_char_count,
        per_trope_thresholds,
        config,
        run_id,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn scene() -> Scene {
        Scene {
            id: "s1".into(),
            work_id: "w1".into(),
            idx: 0,
            char_start: 100,
            char_end: 400,
        }
    }

    fn entry(trope_id: &str, weight: f32, sem_sim: f32, seed_score: f32) -> ShortlistEntry {
        ShortlistEntry {
            trope_id: trope_id.into(),
            name: trope_id.to_uppercase(),
            summary: "summary".into(),
            lex_ok: true,
            sem_sim,
            weight,
            seed_score,
        }
    }

    fn item(trope_id: &str, confidence: f32, start: i64, end: i64) -> JudgeItem {
        serde_json::from_value(serde_json::json!({
            "trope_id": trope_id,
            "confidence": confidence,
            "evidence_start": start,
            "evidence_end": end,
            "rationale": "because"
        }))
        .unwrap()
    }

    fn config() -> AppConfig {
        AppConfig::from_env()
    }

    #[test]
    fn prompt_starts_with_version_header() {
        let prompt = build_prompt(&scene(), "text", &[], &[entry("t1", 1.0, 0.5, 0.0)], 0.25);
        assert!(prompt.starts_with(PROMPT_VERSION));
        assert!(prompt.contains("t1"));
    }

    #[test]
    fn shortlist_ranks_by_weighted_priority_and_caps() {
        let candidates = vec![
            ("a".to_string(), 0.0_f32),
            ("b".to_string(), 0.9_f32),
            ("c".to_string(), 0.2_f32),
        ];
        let sanity = vec![
            TropeSanity { scene_id: "s1".into(), trope_id: "a".into(), lex_ok: true, sem_sim: 0.9, weight: 1.0 },
            TropeSanity { scene_id: "s1".into(), trope_id: "b".into(), lex_ok: false, sem_sim: 0.1, weight: 0.55 },
            TropeSanity { scene_id: "s1".into(), trope_id: "c".into(), lex_ok: false, sem_sim: 0.3, weight: 1.0 },
        ];
        let names: HashMap<String, (String, String)> = ["a", "b", "c"]
            .iter()
            .map(|id| (id.to_string(), (id.to_uppercase(), String::new())))
            .collect();

        // priorities: a = 0.9, b = 0.55, c = 0.5
        let list = build_shortlist(&candidates, &sanity, &names, 2);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].trope_id, "a");
        assert_eq!(list[1].trope_id, "b");
    }

    #[test]
    fn parse_accepts_array_and_wrapped_object() {
        let array = r#"[{"trope_id":"t1","confidence":0.7,"evidence_start":1,"evidence_end":5,"rationale":"r"}]"#;
        assert_eq!(parse_judgement(array).unwrap().len(), 1);

        let wrapped = r#"{"findings":[{"trope_id":"t1","confidence":0.7,"evidence_start":1,"evidence_end":5}]}"#;
        assert_eq!(parse_judgement(wrapped).unwrap().len(), 1);

        assert!(matches!(
            parse_judgement("I think the scene shows a whodunit."),
            Err(JudgeError::Parse(_))
        ));
        assert!(matches!(
            parse_judgement(r#"{"other": true}"#),
            Err(JudgeError::Parse(_))
        ));
    }

    #[test]
    fn span_outside_scene_is_rejected_without_aborting() {
        let shortlist = vec![entry("t1", 1.0, 0.5, 0.0)];
        let items = vec![
            item("t1", 0.9, 10, 50),    // before the scene
            item("t1", 0.9, 150, 250),  // valid
            item("t1", 0.9, 380, 420),  // crosses scene end
            item("t1", 0.9, 260, 240),  // inverted
        ];
        let result = evaluate_items(
            &items,
            &shortlist,
            &scene(),
            1000,
            &HashMap::new(),
            &config(),
            "r1",
        );
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.bad_spans, 3);
        assert_eq!(result.findings[0].evidence_start, 150);
    }

    #[test]
    fn adjusted_confidence_applies_weight_and_threshold() {
        // confidence 0.8 * weight 0.55 = 0.44
        let shortlist = vec![entry("t1", 0.55, 0.2, 0.0)];
        let items = vec![item("t1", 0.8, 150, 250)];

        let mut cfg = config();
        cfg.judge.threshold = 0.25;
        let accepted = evaluate_items(&items, &shortlist, &scene(), 1000, &HashMap::new(), &cfg, "r1");
        assert_eq!(accepted.findings.len(), 1);
        let found = &accepted.findings[0];
        assert!((found.confidence - 0.44).abs() < 1e-6);
        assert_eq!(found.threshold_used, 0.25);
        assert_eq!(found.run_id, "r1");

        cfg.judge.threshold = 0.5;
        let rejected = evaluate_items(&items, &shortlist, &scene(), 1000, &HashMap::new(), &cfg, "r1");
        assert!(rejected.findings.is_empty());
        assert_eq!(rejected.below_threshold, 1);
    }

    #[test]
    fn per_trope_threshold_overrides_global() {
        let shortlist = vec![entry("t1", 1.0, 0.2, 0.0)];
        let items = vec![item("t1", 0.4, 150, 250)];
        let mut thresholds = HashMap::new();
        thresholds.insert("t1".to_string(), 0.6_f32);

        let cfg = config();
        let result = evaluate_items(&items, &shortlist, &scene(), 1000, &thresholds, &cfg, "r1");
        assert!(result.findings.is_empty());

        thresholds.insert("t1".to_string(), 0.3_f32);
        let result = evaluate_items(&items, &shortlist, &scene(), 1000, &thresholds, &cfg, "r1");
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].threshold_used, 0.3);
    }

    #[test]
    fn unknown_trope_ids_are_ignored() {
        let shortlist = vec![entry("t1", 1.0, 0.2, 0.0)];
        let items = vec![item("made-up", 0.9, 150, 250)];
        let result = evaluate_items(&items, &shortlist, &scene(), 1000, &HashMap::new(), &config(), "r1");
        assert!(result.findings.is_empty());
        assert_eq!(result.unknown_tropes, 1);
    }
}
