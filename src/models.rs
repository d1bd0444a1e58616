use serde::{Deserialize, Serialize};

/// How a candidate was produced. Closed set; stored as text in SQLite.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Gazetteer,
    Semantic,
}

impl CandidateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateSource::Gazetteer => "gazetteer",
            CandidateSource::Semantic => "semantic",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "semantic" => CandidateSource::Semantic,
            _ => CandidateSource::Gazetteer,
        }
    }
}

/// Granularity of a finding's evidence span.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FindingLevel {
    Span,
    Scene,
    Work,
}

impl FindingLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingLevel::Span => "span",
            FindingLevel::Scene => "scene",
            FindingLevel::Work => "work",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "scene" => FindingLevel::Scene,
            "work" => FindingLevel::Work,
            _ => FindingLevel::Span,
        }
    }
}

/// Post-pass policy for negation/meta/anti-alias cues near a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegationMode {
    FlagOnly,
    Downweight,
    Delete,
}

impl NegationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NegationMode::FlagOnly => "flag-only",
            NegationMode::Downweight => "downweight",
            NegationMode::Delete => "delete",
        }
    }
}

impl std::str::FromStr for NegationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flag-only" | "flag_only" => Ok(NegationMode::FlagOnly),
            "downweight" => Ok(NegationMode::Downweight),
            "delete" => Ok(NegationMode::Delete),
            other => Err(format!("unknown negation mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Work {
    pub id: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub norm_text: String,
    pub char_count: i64,
}

#[derive(Debug, Clone)]
pub struct Scene {
    pub id: String,
    pub work_id: String,
    pub idx: i64,
    pub char_start: i64,
    pub char_end: i64,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub work_id: String,
    pub scene_id: String,
    pub idx: i64,
    pub char_start: i64,
    pub char_end: i64,
    pub text: String,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct Trope {
    pub id: String,
    pub name: String,
    pub summary: String,
    pub aliases: Vec<String>,
    pub anti_aliases: Vec<String>,
}

impl Trope {
    /// Query text used for catalog embeddings and semantic seeding. Falls
    /// back to the first aliases when the summary is empty.
    pub fn query_text(&self) -> String {
        let name = self.name.trim();
        let summary = self.summary.trim();
        if !summary.is_empty() {
            return format!("{name}. {summary}");
        }
        if !self.aliases.is_empty() {
            let sample: Vec<&str> = self.aliases.iter().take(3).map(|a| a.as_str()).collect();
            return format!("{name}. {}", sample.join("; "));
        }
        name.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct TropeCandidate {
    pub id: String,
    pub work_id: String,
    pub scene_id: String,
    pub chunk_id: Option<String>,
    pub trope_id: String,
    pub surface: Option<String>,
    pub alias: Option<String>,
    pub start: i64,
    pub end: i64,
    pub source: CandidateSource,
    pub score: f32,
}

/// One stage-1 retrieval row for a scene, with the rerank outcome.
#[derive(Debug, Clone)]
pub struct SupportRow {
    pub scene_id: String,
    pub chunk_id: String,
    pub rank: i64,
    pub stage1_score: f32,
    pub stage2_score: f32,
    pub picked: bool,
}

#[derive(Debug, Clone)]
pub struct TropeSanity {
    pub scene_id: String,
    pub trope_id: String,
    pub lex_ok: bool,
    pub sem_sim: f32,
    pub weight: f32,
}

#[derive(Debug, Clone)]
pub struct TropeFinding {
    pub id: String,
    pub work_id: String,
    pub scene_id: String,
    pub chunk_id: Option<String>,
    pub trope_id: String,
    pub level: FindingLevel,
    pub confidence: f32,
    pub rationale: String,
    pub evidence_start: i64,
    pub evidence_end: i64,
    pub model: String,
    pub verifier_score: Option<f32>,
    pub verifier_flag: Option<String>,
    pub calibration_version: Option<String>,
    pub threshold_used: f32,
    pub run_id: String,
}

/// Strict response schema for the stage-2 rerank call.
#[derive(Debug, Clone, Deserialize)]
pub struct RerankResponse {
    pub picked: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

/// One item of the judge's JSON response.
#[derive(Debug, Clone, Deserialize)]
pub struct JudgeItem {
    pub trope_id: String,
    pub confidence: f32,
    pub evidence_start: i64,
    pub evidence_end: i64,
    #[serde(default)]
    pub rationale: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negation_mode_round_trip() {
        for mode in [NegationMode::FlagOnly, NegationMode::Downweight, NegationMode::Delete] {
            assert_eq!(mode.as_str().parse::<NegationMode>().unwrap(), mode);
        }
        assert!("loud".parse::<NegationMode>().is_err());
    }

    #[test]
    fn trope_query_text_prefers_summary() {
        let trope = Trope {
            id: "t1".into(),
            name: "Whodunit".into(),
            summary: "A mystery structured around revealing the culprit.".into(),
            aliases: vec!["murder mystery".into()],
            anti_aliases: vec![],
        };
        assert_eq!(
            trope.query_text(),
            "Whodunit. A mystery structured around revealing the culprit."
        );
    }

    #[test]
    fn trope_query_text_falls_back_to_aliases() {
        let trope = Trope {
            id: "t1".into(),
            name: "Whodunit".into(),
            summary: "  ".into(),
            aliases: vec!["murder mystery".into(), "locked room".into()],
            anti_aliases: vec![],
        };
        assert_eq!(trope.query_text(), "Whodunit. murder mystery; locked room");
    }

    #[test]
    fn judge_item_parses_without_rationale() {
        let item: JudgeItem = serde_json::from_str(
            r#"{"trope_id":"t1","confidence":0.8,"evidence_start":10,"evidence_end":40}"#,
        )
        .unwrap();
        assert_eq!(item.trope_id, "t1");
        assert!(item.rationale.is_empty());
    }
}
