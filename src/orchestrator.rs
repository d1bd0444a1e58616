use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::db::Database;
use crate::embedding::EmbedClient;
use crate::error::{classify, MinerError};
use crate::gazetteer::{seed_gazetteer, TropeMatcher};
use crate::judge::{self, JudgeError};
use crate::models::{Scene, Trope};
use crate::negation::run_negation_pass;
use crate::ollama::OllamaClient;
use crate::qdrant_store::QdrantStore;
use crate::run_stamp::stamp_run;
use crate::sanity::compute_sanity;
use crate::semantic::seed_semantic;
use crate::span_verifier::{verify_finding, SpanVerdict};
use crate::support::SupportSelector;
use crate::text_index::TextIndex;

#[derive(Debug, Default)]
pub struct RunSummary {
    pub run_id: String,
    pub gazetteer_candidates: usize,
    pub semantic_candidates: usize,
    pub scenes_total: usize,
    pub scenes_judged: usize,
    pub scenes_skipped: usize,
    pub findings_inserted: usize,
    pub spans_adjusted: usize,
    pub negation_flagged: usize,
    pub negation_downweighted: usize,
    pub negation_deleted: usize,
    pub cancelled: bool,
}

/// Everything a scene worker needs, shared read-only across workers.
struct SceneCtx {
    db: Database,
    ollama: OllamaClient,
    embedder: EmbedClient,
    selector: SupportSelector,
    config: AppConfig,
    index: Arc<TextIndex>,
    matchers: Arc<HashMap<String, TropeMatcher>>,
    tropes: Arc<HashMap<String, Trope>>,
    trope_names: Arc<HashMap<String, (String, String)>>,
    thresholds: Arc<HashMap<String, f32>>,
    run_id: String,
    work_id: String,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct SceneTally {
    judged: usize,
    skipped: usize,
    findings: usize,
}

pub struct Orchestrator {
    db: Database,
    store: QdrantStore,
    ollama: OllamaClient,
    embedder: EmbedClient,
    config: AppConfig,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        store: QdrantStore,
        ollama: OllamaClient,
        embedder: EmbedClient,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            store,
            ollama,
            embedder,
            config,
        }
    }

    /// Serial per-work driver: seed candidates, judge scene by scene with
    /// bounded parallelism, then tighten and re-check spans. Commits are
    /// incremental, so cancellation and per-scene failures leave durable
    /// partial progress.
    pub async fn run_work(
        &self,
        work_id: &str,
        cancel: CancellationToken,
    ) -> Result<RunSummary, MinerError> {
        let work = self
            .db
            .get_work(work_id)
            .await?
            .ok_or_else(|| MinerError::Config(format!("work not found: {work_id}")))?;

        let scenes = self.db.scenes_for_work(work_id).await?;
        let chunks = self.db.chunks_for_work(work_id).await?;
        if scenes.is_empty() || chunks.is_empty() {
            return Err(MinerError::Config(format!(
                "work {work_id} has no scenes/chunks; ingest and segment it first"
            )));
        }

        let index = Arc::new(TextIndex::new(work));
        index
            .verify_chunks(&chunks)
            .map_err(|e| MinerError::Integrity(e.to_string()))?;

        let tropes = self.db.load_tropes().await?;
        if tropes.is_empty() {
            return Err(MinerError::Config("trope catalog is empty".into()));
        }

        let run_id = stamp_run(&self.db, &self.config, work_id, &tropes)
            .await
            .map_err(classify)?;
        tracing::info!(run_id = %run_id, work_id, scenes = scenes.len(), "run stamped");

        let mut summary = RunSummary {
            run_id: run_id.clone(),
            scenes_total: scenes.len(),
            ..RunSummary::default()
        };

        // Seeding failures are fatal: no candidates means nothing to judge.
        summary.gazetteer_candidates =
            seed_gazetteer(&self.db, work_id, &chunks, &tropes, &self.config.seed)
                .await
                .map_err(classify)?;
        summary.semantic_candidates = seed_semantic(
            &self.db,
            &self.store,
            &self.embedder,
            &self.config,
            work_id,
            &chunks,
            &tropes,
        )
        .await
        .map_err(classify)?;
        tracing::info!(
            gazetteer = summary.gazetteer_candidates,
            semantic = summary.semantic_candidates,
            "candidates seeded"
        );

        let matchers: HashMap<String, TropeMatcher> = tropes
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    TropeMatcher::build(t, self.config.seed.alias_min_len),
                )
            })
            .collect();
        let trope_names: HashMap<String, (String, String)> = tropes
            .iter()
            .map(|t| (t.id.clone(), (t.name.clone(), t.summary.clone())))
            .collect();
        let tropes_by_id: HashMap<String, Trope> =
            tropes.iter().map(|t| (t.id.clone(), t.clone())).collect();
        let thresholds = self.db.trope_thresholds().await?;

        let ctx = Arc::new(SceneCtx {
            db: self.db.clone(),
            ollama: self.ollama.clone(),
            embedder: self.embedder.clone(),
            selector: SupportSelector::new(
                self.db.clone(),
                self.store.clone(),
                self.embedder.clone(),
                self.ollama.clone(),
                self.config.clone(),
            ),
            config: self.config.clone(),
            index: index.clone(),
            matchers: Arc::new(matchers),
            tropes: Arc::new(tropes_by_id),
            trope_names: Arc::new(trope_names),
            thresholds: Arc::new(thresholds),
            run_id: run_id.clone(),
            work_id: work_id.to_string(),
            cancel: cancel.clone(),
        });

        // Scenes flow through a channel into a small worker pool. Within a
        // scene the order is strict: support -> sanity -> judge.
        let (tx, rx) = mpsc::channel::<Scene>(self.config.n_scenes * 2);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::new();
        for _ in 0..self.config.n_scenes {
            let ctx = ctx.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                let mut tally = SceneTally::default();
                loop {
                    let scene = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(scene) = scene else { break };
                    if ctx.cancel.is_cancelled() {
                        break;
                    }
                    match process_scene(&ctx, &scene).await {
                        Ok(inserted) => {
                            tally.judged += 1;
                            tally.findings += inserted;
                        }
                        Err(kind) => {
                            tally.skipped += 1;
                            let _ = ctx
                                .db
                                .insert_audit(&ctx.run_id, &ctx.work_id, Some(&scene.id), kind, "")
                                .await;
                        }
                    }
                }
                tally
            }));
        }

        for scene in &scenes {
            if cancel.is_cancelled() {
                break;
            }
            if tx.send(scene.clone()).await.is_err() {
                break;
            }
        }
        drop(tx);

        for worker in workers {
            if let Ok(tally) = worker.await {
                summary.scenes_judged += tally.judged;
                summary.scenes_skipped += tally.skipped;
                summary.findings_inserted += tally.findings;
            }
        }

        if cancel.is_cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }

        self.post_passes(&mut summary, &index, &scenes, ctx.as_ref())
            .await?;
        summary.cancelled = cancel.is_cancelled();
        Ok(summary)
    }

    /// C9 span verification then C10 negation/meta. Per-finding failures
    /// flag the finding and move on.
    async fn post_passes(
        &self,
        summary: &mut RunSummary,
        index: &Arc<TextIndex>,
        scenes: &[Scene],
        ctx: &SceneCtx,
    ) -> Result<(), MinerError> {
        let findings = self.db.findings_for_run(&summary.run_id).await?;
        let scene_by_id: HashMap<&str, &Scene> =
            scenes.iter().map(|s| (s.id.as_str(), s)).collect();

        for finding in &findings {
            if ctx.cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }
            let (Some(scene), Some(trope)) = (
                scene_by_id.get(finding.scene_id.as_str()),
                ctx.tropes.get(&finding.trope_id),
            ) else {
                continue;
            };

            match verify_finding(
                &self.embedder,
                index,
                scene,
                trope,
                finding,
                &self.config.verifier,
            )
            .await
            {
                Ok(SpanVerdict::Replace { start, end, score }) => {
                    self.db
                        .update_finding_span(&finding.id, start, end, score)
                        .await?;
                    summary.spans_adjusted += 1;
                }
                Ok(SpanVerdict::Keep { score }) => {
                    self.db.set_verifier_score(&finding.id, score).await?;
                }
                Err(err) => {
                    tracing::warn!(finding_id = %finding.id, error = %err, "span verification failed");
                    let _ = self.db.set_verifier_flag(&finding.id, "verifier_error").await;
                }
            }
        }

        // Re-read so the negation pass sees verifier-adjusted spans.
        let findings = self.db.findings_for_run(&summary.run_id).await?;
        match run_negation_pass(
            &self.db,
            index,
            scenes,
            &ctx.matchers,
            &findings,
            &self.config.verifier,
        )
        .await
        {
            Ok(stats) => {
                summary.negation_flagged = stats.flagged;
                summary.negation_downweighted = stats.downweighted;
                summary.negation_deleted = stats.deleted;
            }
            Err(err) => {
                tracing::warn!(error = %err, "negation pass aborted");
                let _ = self
                    .db
                    .insert_audit(
                        &summary.run_id,
                        &ctx.work_id,
                        None,
                        "negation_pass_error",
                        &err.to_string(),
                    )
                    .await;
            }
        }

        Ok(())
    }
}

/// One scene, start to finish. Returns the number of findings inserted, or
/// the audit kind explaining why the scene was skipped. Everything the
/// scene produced lands in one transaction.
async fn process_scene(ctx: &SceneCtx, scene: &Scene) -> Result<usize, &'static str> {
    let scene_text = ctx.index.scene_text(scene).to_string();
    if scene_text.is_empty() {
        return Err("empty_scene");
    }

    let support = match ctx
        .selector
        .select(&ctx.work_id, &scene.id, &scene_text)
        .await
    {
        Ok(support) => support,
        Err(err) => {
            tracing::warn!(scene_id = %scene.id, error = %err, "support selection failed");
            return Err("support_error");
        }
    };
    if support.fallback {
        tracing::debug!(scene_id = %scene.id, "rerank fell back to stage-1 order");
    }

    let candidates = match ctx
        .db
        .scene_candidate_tropes(&ctx.work_id, &scene.id)
        .await
    {
        Ok(candidates) => candidates,
        Err(_) => return Err("candidate_load_error"),
    };
    if candidates.is_empty() {
        // Nothing seeded here; persist the support rows and move on.
        ctx.db
            .write_scene_results(&support.rows, &[], &[])
            .await
            .map_err(|_| "db_error")?;
        return Ok(0);
    }

    let candidate_ids: Vec<String> = candidates.iter().map(|(id, _)| id.clone()).collect();
    let sanity = match compute_sanity(
        &ctx.embedder,
        &ctx.matchers,
        &ctx.tropes,
        &scene.id,
        &scene_text,
        &support.picked,
        &candidate_ids,
        &ctx.config.judge,
    )
    .await
    {
        Ok(sanity) => sanity,
        Err(err) => {
            tracing::warn!(scene_id = %scene.id, error = %err, "sanity priors failed");
            return Err("sanity_error");
        }
    };

    let shortlist = judge::build_shortlist(
        &candidates,
        &sanity,
        &ctx.trope_names,
        ctx.config.judge.trope_top_k,
    );

    let evaluated = match judge::judge_scene(
        &ctx.ollama,
        &ctx.config,
        scene,
        &scene_text,
        &support.picked,
        &shortlist,
        &ctx.thresholds,
        ctx.index.char_count() as i64,
        &ctx.run_id,
    )
    .await
    {
        Ok(evaluated) => evaluated,
        Err(JudgeError::Parse(detail)) => {
            tracing::warn!(scene_id = %scene.id, detail, "judge returned malformed JSON, skipping scene");
            return Err("judge_parse_error");
        }
        Err(JudgeError::Service(err)) => {
            tracing::warn!(scene_id = %scene.id, error = %err, "judge call failed");
            return Err("judge_error");
        }
    };

    if evaluated.bad_spans > 0 {
        let _ = ctx
            .db
            .insert_audit(
                &ctx.run_id,
                &ctx.work_id,
                Some(&scene.id),
                "bad_span",
                &format!("{} item(s) outside scene bounds", evaluated.bad_spans),
            )
            .await;
    }

    let inserted = ctx
        .db
        .write_scene_results(&support.rows, &sanity, &evaluated.findings)
        .await
        .map_err(|_| "db_error")?;

    tracing::info!(
        scene_id = %scene.id,
        shortlist = shortlist.len(),
        findings = inserted,
        bad_spans = evaluated.bad_spans,
        "scene judged"
    );
    Ok(inserted)
}
