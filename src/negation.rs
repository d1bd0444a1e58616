use anyhow::Result;
use regex::Regex;

use crate::config::VerifierConfig;
use crate::db::Database;
use crate::gazetteer::TropeMatcher;
use crate::models::{NegationMode, Scene, TropeFinding};
use crate::text_index::{CharOffsets, TextIndex};

/// Code points inspected on each side of `evidence_start`.
const CUE_WINDOW: i64 = 40;

/// A negation cue only binds to a mention when it sits this close before it.
const LEADING_CONTEXT: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CueScan {
    pub negation: bool,
    pub meta: bool,
    pub anti_alias: bool,
}

impl CueScan {
    pub fn any(self) -> bool {
        self.negation || self.meta || self.anti_alias
    }

    /// Flag value: the first cue kind in fixed precedence order.
    pub fn flag(self) -> Option<&'static str> {
        if self.negation {
            Some("negation_cue")
        } else if self.meta {
            Some("meta_cue")
        } else if self.anti_alias {
            Some("anti_alias")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegationOutcome {
    Untouched,
    Flagged { flag: &'static str },
    Downweighted { flag: &'static str, confidence: f32 },
    Deleted,
}

fn negation_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:no|not|never|without|isn['\x{2019}]t|wasn['\x{2019}]t)\b").unwrap()
    })
}

fn meta_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:deconstructs|subverts|parody of|isn['\x{2019}]t a)\b").unwrap()
    })
}

/// Inspect the cue window around a finding.
///
/// Negation requires a cue immediately before a trope mention; meta cues
/// count when a mention is anywhere in the window; anti-alias phrases count
/// on their own.
pub fn scan_cues(window: &str, matcher: &TropeMatcher) -> CueScan {
    let mentions = matcher.find_mentions(window);
    let offsets = CharOffsets::new(window);

    let mut scan = CueScan {
        anti_alias: matcher.has_anti_alias(window),
        ..CueScan::default()
    };

    if !mentions.is_empty() {
        scan.meta = meta_re().is_match(window);
        for &(start, _) in &mentions {
            let lead_start = start.saturating_sub(LEADING_CONTEXT);
            let before = &window[offsets.byte(lead_start)..offsets.byte(start)];
            if negation_re().is_match(before) {
                scan.negation = true;
                break;
            }
        }
    }

    scan
}

/// Apply the configured policy to one scanned finding. In downweight mode
/// the smallest applicable factor wins; the finding is kept (flagged) even
/// when the new confidence falls under its acceptance threshold.
pub fn apply_policy(scan: CueScan, confidence: f32, config: &VerifierConfig) -> NegationOutcome {
    let Some(flag) = scan.flag() else {
        return NegationOutcome::Untouched;
    };

    match config.negation_mode {
        NegationMode::FlagOnly => NegationOutcome::Flagged { flag },
        NegationMode::Delete => NegationOutcome::Deleted,
        NegationMode::Downweight => {
            let mut factor = 1.0_f32;
            if scan.negation {
                factor = factor.min(config.neg_downweight);
            }
            if scan.meta {
                factor = factor.min(config.meta_downweight);
            }
            if scan.anti_alias {
                factor = factor.min(config.aa_downweight);
            }
            NegationOutcome::Downweighted {
                flag,
                confidence: (confidence * factor).clamp(0.0, 1.0),
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct NegationStats {
    pub flagged: usize,
    pub downweighted: usize,
    pub deleted: usize,
}

/// Post-pass over a run's findings. Each finding is handled independently;
/// the caller decides what to do when a database update fails.
pub async fn run_negation_pass(
    db: &Database,
    index: &TextIndex,
    scenes: &[Scene],
    matchers: &std::collections::HashMap<String, TropeMatcher>,
    findings: &[TropeFinding],
    config: &VerifierConfig,
) -> Result<NegationStats> {
    let mut stats = NegationStats::default();

    for finding in findings {
        let Some(matcher) = matchers.get(&finding.trope_id) else {
            continue;
        };
        // The cue window never leaves the owning scene.
        let (lo, hi) = scenes
            .iter()
            .find(|s| s.id == finding.scene_id)
            .map(|s| (s.char_start, s.char_end))
            .unwrap_or((0, index.char_count() as i64));

        let w0 = (finding.evidence_start - CUE_WINDOW).max(lo);
        let w1 = (finding.evidence_start + CUE_WINDOW).min(hi);
        let window = index.slice(w0, w1);

        let scan = scan_cues(window, matcher);
        match apply_policy(scan, finding.confidence, config) {
            NegationOutcome::Untouched => {}
            NegationOutcome::Flagged { flag } => {
                db.set_verifier_flag(&finding.id, flag).await?;
                stats.flagged += 1;
            }
            NegationOutcome::Downweighted { flag, confidence } => {
                db.downweight_finding(&finding.id, confidence, flag).await?;
                stats.downweighted += 1;
            }
            NegationOutcome::Deleted => {
                db.delete_finding(&finding.id).await?;
                stats.deleted += 1;
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Trope;

    fn matcher() -> TropeMatcher {
        TropeMatcher::build(
            &Trope {
                id: "t1".into(),
                name: "Whodunit".into(),
                summary: String::new(),
                aliases: vec![],
                anti_aliases: vec!["anti-mystery essay".into()],
            },
            5,
        )
    }

    fn config(mode: NegationMode) -> VerifierConfig {
        VerifierConfig {
            span_threshold: 0.25,
            max_sentences: 2,
            negation_mode: mode,
            neg_downweight: 0.6,
            meta_downweight: 0.75,
            aa_downweight: 0.5,
        }
    }

    #[test]
    fn negation_cue_binds_to_nearby_mention() {
        let scan = scan_cues("this was not a whodunit at all", &matcher());
        assert!(scan.negation);
        assert_eq!(scan.flag(), Some("negation_cue"));
    }

    #[test]
    fn distant_negation_does_not_bind() {
        // Cue is more than sixteen characters before the mention.
        let scan = scan_cues("never before, in any of those years, a whodunit", &matcher());
        assert!(!scan.negation);
    }

    #[test]
    fn meta_cue_requires_a_mention() {
        let scan = scan_cues("the chapter subverts the whodunit form", &matcher());
        assert!(scan.meta);

        let no_mention = scan_cues("the chapter subverts everything", &matcher());
        assert!(!no_mention.meta);
        assert!(!no_mention.any());
    }

    #[test]
    fn isnt_a_counts_as_meta() {
        let scan = scan_cues("this isn't a whodunit, strictly", &matcher());
        assert!(scan.meta);
        // The apostrophe cue also reads as negation right before the mention.
        assert!(scan.negation);
        assert_eq!(scan.flag(), Some("negation_cue"));
    }

    #[test]
    fn anti_alias_fires_without_mention() {
        let scan = scan_cues("her anti-mystery essay was praised", &matcher());
        assert!(scan.anti_alias);
        assert_eq!(scan.flag(), Some("anti_alias"));
    }

    #[test]
    fn downweight_takes_minimum_factor() {
        let scan = CueScan {
            negation: true,
            meta: true,
            anti_alias: true,
        };
        let outcome = apply_policy(scan, 0.8, &config(NegationMode::Downweight));
        match outcome {
            NegationOutcome::Downweighted { flag, confidence } => {
                assert_eq!(flag, "negation_cue");
                assert!((confidence - 0.4).abs() < 1e-6); // 0.8 * min(0.6, 0.75, 0.5)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn flag_only_leaves_confidence_alone() {
        let scan = CueScan {
            negation: false,
            meta: true,
            anti_alias: false,
        };
        assert_eq!(
            apply_policy(scan, 0.8, &config(NegationMode::FlagOnly)),
            NegationOutcome::Flagged { flag: "meta_cue" }
        );
    }

    #[test]
    fn delete_mode_removes_and_clean_scan_is_untouched() {
        let scan = CueScan {
            negation: true,
            ..CueScan::default()
        };
        assert_eq!(
            apply_policy(scan, 0.8, &config(NegationMode::Delete)),
            NegationOutcome::Deleted
        );
        assert_eq!(
            apply_policy(CueScan::default(), 0.8, &config(NegationMode::Delete)),
            NegationOutcome::Untouched
        );
    }
}
