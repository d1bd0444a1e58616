use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::MinerError;
use crate::models::NegationMode;

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub reasoner_model: String,
    pub embed_model: String,
}

/// Seeding and judging thresholds. All values come from the environment and
/// fall back to the calibrated defaults.
#[derive(Clone, Debug)]
pub struct JudgeConfig {
    pub threshold: f32,
    pub trope_top_k: usize,
    pub rerank_top_k: usize,
    pub rerank_keep_m: usize,
    pub rerank_doc_char_max: usize,
    pub downweight_no_mention: f32,
    pub sem_sim_threshold: f32,
}

#[derive(Clone, Debug)]
pub struct SeedConfig {
    pub sem_tau: f32,
    pub sem_top_n: usize,
    pub sem_per_scene_cap: usize,
    pub anti_window: usize,
    pub alias_min_len: usize,
    pub max_per_trope: usize,
}

#[derive(Clone, Debug)]
pub struct VerifierConfig {
    pub span_threshold: f32,
    pub max_sentences: usize,
    pub negation_mode: NegationMode,
    pub neg_downweight: f32,
    pub meta_downweight: f32,
    pub aa_downweight: f32,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub ollama_base_url: String,
    pub qdrant_base_url: String,
    pub chunk_collection: String,
    pub trope_collection: String,
    pub per_work_collections: bool,
    pub calibration_version: Option<String>,
    pub models: ModelConfig,
    pub judge: JudgeConfig,
    pub seed: SeedConfig,
    pub verifier: VerifierConfig,
    pub n_embed: usize,
    pub n_scenes: usize,
    pub embed_timeout: Duration,
    pub vector_timeout: Duration,
    pub llm_timeout: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_truthy(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("TROPE_MINER_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./tropes.db")),
            ollama_base_url: env_or("OLLAMA_BASE_URL", "http://127.0.0.1:11434"),
            qdrant_base_url: env_or("QDRANT_BASE_URL", "http://127.0.0.1:6333"),
            chunk_collection: env_or("CHUNK_COLL", "trope-miner-v1-cos"),
            trope_collection: env_or("TROPE_COLL", "trope-catalog-v1-cos"),
            per_work_collections: env_truthy("PER_WORK_COLLECTIONS"),
            calibration_version: env::var("CALIBRATION_VERSION").ok().filter(|v| !v.is_empty()),
            models: ModelConfig {
                reasoner_model: env_or("REASONER_MODEL", "llama3.1:8b"),
                embed_model: env_or("EMB_MODEL", "nomic-embed-text"),
            },
            judge: JudgeConfig {
                threshold: env_parse("THRESHOLD", 0.25),
                trope_top_k: env_parse("TROPE_TOP_K", 16),
                rerank_top_k: env_parse("RERANK_TOP_K", 8),
                rerank_keep_m: env_parse("RERANK_KEEP_M", 3),
                rerank_doc_char_max: env_parse("RERANK_DOC_CHAR_MAX", 480),
                downweight_no_mention: env_parse("DOWNWEIGHT_NO_MENTION", 0.55),
                sem_sim_threshold: env_parse("SEM_SIM_THRESHOLD", 0.36),
            },
            seed: SeedConfig {
                sem_tau: env_parse("SEM_TAU", 0.70),
                sem_top_n: env_parse("SEM_TOP_N", 8),
                sem_per_scene_cap: env_parse("SEM_PER_SCENE_CAP", 3),
                anti_window: env_parse("ANTI_WINDOW", 60),
                alias_min_len: env_parse("ALIAS_MIN_LEN", 5),
                max_per_trope: env_parse("MAX_PER_TROPE", 500),
            },
            verifier: VerifierConfig {
                span_threshold: env_parse("SPAN_VERIFIER_THRESHOLD", 0.25),
                max_sentences: env_parse("SPAN_VERIFIER_MAX_SENT", 2),
                negation_mode: env::var("NEGATION_MODE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(NegationMode::Downweight),
                neg_downweight: env_parse("NEG_DOWNWEIGHT", 0.6),
                meta_downweight: env_parse("META_DOWNWEIGHT", 0.75),
                aa_downweight: env_parse("AA_DOWNWEIGHT", 0.5),
            },
            n_embed: env_parse("N_EMBED", 4),
            n_scenes: env_parse("N_SCENES", 2),
            embed_timeout: Duration::from_secs(env_parse("EMBED_TIMEOUT_SECS", 30)),
            vector_timeout: Duration::from_secs(env_parse("VECTOR_TIMEOUT_SECS", 10)),
            llm_timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS", 120)),
        }
    }

    /// Fatal-at-startup checks. Thresholds must be sensible probabilities and
    /// the model names must be present.
    pub fn validate(&self) -> Result<(), MinerError> {
        let unit = |name: &str, v: f32| -> Result<(), MinerError> {
            if !(0.0..=1.0).contains(&v) {
                return Err(MinerError::Config(format!("{name} must be in [0,1], got {v}")));
            }
            Ok(())
        };
        unit("THRESHOLD", self.judge.threshold)?;
        unit("DOWNWEIGHT_NO_MENTION", self.judge.downweight_no_mention)?;
        unit("SEM_SIM_THRESHOLD", self.judge.sem_sim_threshold)?;
        unit("SEM_TAU", self.seed.sem_tau)?;
        unit("SPAN_VERIFIER_THRESHOLD", self.verifier.span_threshold)?;
        unit("NEG_DOWNWEIGHT", self.verifier.neg_downweight)?;
        unit("META_DOWNWEIGHT", self.verifier.meta_downweight)?;
        unit("AA_DOWNWEIGHT", self.verifier.aa_downweight)?;

        if self.models.embed_model.is_empty() {
            return Err(MinerError::Config("EMB_MODEL must not be empty".into()));
        }
        if self.models.reasoner_model.is_empty() {
            return Err(MinerError::Config("REASONER_MODEL must not be empty".into()));
        }
        if self.judge.rerank_keep_m > self.judge.rerank_top_k {
            return Err(MinerError::Config(format!(
                "RERANK_KEEP_M ({}) cannot exceed RERANK_TOP_K ({})",
                self.judge.rerank_keep_m, self.judge.rerank_top_k
            )));
        }
        if self.n_embed == 0 || self.n_scenes == 0 {
            return Err(MinerError::Config("N_EMBED and N_SCENES must be >= 1".into()));
        }
        Ok(())
    }

    pub fn sqlite_dsn(&self) -> String {
        format!("sqlite://{}", self.db_path.display())
    }

    /// Effective chunk collection for a work under per-work mode.
    pub fn chunk_collection_for(&self, work_id: &str) -> String {
        if self.per_work_collections {
            format!("{}__{}", self.chunk_collection, work_id)
        } else {
            self.chunk_collection.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AppConfig {
        AppConfig::from_env()
    }

    #[test]
    fn defaults_validate() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn threshold_out_of_range_is_config_error() {
        let mut config = base();
        config.judge.threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn keep_m_must_not_exceed_top_k() {
        let mut config = base();
        config.judge.rerank_keep_m = 20;
        config.judge.rerank_top_k = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn per_work_collection_name() {
        let mut config = base();
        config.chunk_collection = "chunks-cos".to_string();
        config.per_work_collections = true;
        assert_eq!(config.chunk_collection_for("w1"), "chunks-cos__w1");
        config.per_work_collections = false;
        assert_eq!(config.chunk_collection_for("w1"), "chunks-cos");
    }
}
