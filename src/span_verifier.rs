use anyhow::{Context, Result};

use crate::config::VerifierConfig;
use crate::embedding::{cosine, EmbedClient};
use crate::models::{Scene, Trope, TropeFinding};
use crate::text_index::TextIndex;

/// Maximum window size considered during sentence snapping.
const WINDOW_CHAR_CAP: usize = 280;

/// A replacement span must beat the original combined score by this much.
const MIN_IMPROVEMENT: f32 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub enum SpanVerdict {
    Keep { score: f32 },
    Replace { start: i64, end: i64, score: f32 },
}

/// Sentence spans of a scene in scene-local code points, whitespace-trimmed.
/// A boundary is any position whose previous character is `.`, `!` or `?`
/// followed by whitespace (or end of text), plus the scene edges.
pub fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();

    let mut boundaries = vec![0usize];
    for i in 1..n {
        if matches!(chars[i - 1], '.' | '!' | '?') && chars[i].is_whitespace() {
            boundaries.push(i);
        }
    }
    boundaries.push(n);
    boundaries.dedup();

    let mut spans = Vec::new();
    for window in boundaries.windows(2) {
        let (mut start, mut end) = (window[0], window[1]);
        while start < end && chars[start].is_whitespace() {
            start += 1;
        }
        while end > start && chars[end - 1].is_whitespace() {
            end -= 1;
        }
        if start < end {
            spans.push((start, end));
        }
    }
    if spans.is_empty() && n > 0 {
        spans.push((0, n));
    }
    spans
}

/// Index of the sentence covering (or best overlapping) a scene-local span.
pub fn covering_sentence(spans: &[(usize, usize)], start: usize, end: usize) -> usize {
    for (i, &(a, b)) in spans.iter().enumerate() {
        if (a <= start && start < b) || (a < end && end <= b) || (start <= a && end >= b) {
            return i;
        }
    }
    0
}

/// Candidate windows around sentence `idx`: every contiguous run of
/// sentences reaching up to `max_sentences` before or after it, capped at
/// the window size limit.
pub fn candidate_windows(
    spans: &[(usize, usize)],
    idx: usize,
    max_sentences: usize,
) -> Vec<(usize, usize)> {
    if spans.is_empty() {
        return vec![];
    }
    let idx = idx.min(spans.len() - 1);
    let lo = idx.saturating_sub(max_sentences);
    let hi = (idx + max_sentences).min(spans.len() - 1);

    let mut windows = Vec::new();
    for j in lo..=hi {
        let (a, b) = (idx.min(j), idx.max(j));
        let start = spans[a].0;
        let mut end = spans[b].1;
        if end - start > WINDOW_CHAR_CAP {
            end = start + WINDOW_CHAR_CAP;
        }
        if !windows.contains(&(start, end)) {
            windows.push((start, end));
        }
    }
    windows
}

fn combined(sim_def: f32, sim_scene: f32) -> f32 {
    0.7 * sim_def + 0.3 * sim_scene
}

/// Verify one finding's span against the trope definition and the scene.
///
/// When the span looks weak (either similarity under the threshold), nearby
/// sentence-snapped windows are scored and the best one replaces the span
/// if it improves the combined score by at least the margin. The verdict
/// never moves a span across scene boundaries.
pub async fn verify_finding(
    embedder: &EmbedClient,
    index: &TextIndex,
    scene: &Scene,
    trope: &Trope,
    finding: &TropeFinding,
    config: &VerifierConfig,
) -> Result<SpanVerdict> {
    let scene_text = index.scene_text(scene);
    let scene_len = scene_text.chars().count() as i64;

    let trope_vec = embedder
        .embed(&trope.query_text())
        .await
        .context("embedding trope definition for span verification")?;
    let scene_vec = embedder
        .embed(scene_text)
        .await
        .context("embedding scene for span verification")?;

    let span_text = index.slice(finding.evidence_start, finding.evidence_end);
    let (sim_def, sim_scene) = if span_text.is_empty() {
        (0.0, 0.0)
    } else {
        let span_vec = embedder
            .embed(span_text)
            .await
            .context("embedding evidence span")?;
        (cosine(&span_vec, &trope_vec), cosine(&span_vec, &scene_vec))
    };
    let original_score = combined(sim_def, sim_scene);

    if sim_def.min(sim_scene) >= config.span_threshold {
        return Ok(SpanVerdict::Keep {
            score: original_score,
        });
    }

    // Scene-local coordinates for sentence snapping.
    let local_start = (finding.evidence_start - scene.char_start).clamp(0, scene_len) as usize;
    let local_end = (finding.evidence_end - scene.char_start).clamp(0, scene_len) as usize;

    let spans = sentence_spans(scene_text);
    let idx = covering_sentence(&spans, local_start, local_end);
    let windows = candidate_windows(&spans, idx, config.max_sentences);

    let mut best: Option<(usize, usize, f32)> = None;
    for (w0, w1) in windows {
        let abs_start = scene.char_start + w0 as i64;
        let abs_end = scene.char_start + w1 as i64;
        if abs_start == finding.evidence_start && abs_end == finding.evidence_end {
            continue;
        }
        let window_text = index.slice(abs_start, abs_end);
        if window_text.is_empty() {
            continue;
        }
        let window_vec = embedder
            .embed(window_text)
            .await
            .context("embedding candidate window")?;
        let score = combined(
            cosine(&window_vec, &trope_vec),
            cosine(&window_vec, &scene_vec),
        );
        if best.map(|(_, _, s)| score > s).unwrap_or(true) {
            best = Some((w0, w1, score));
        }
    }

    match best {
        Some((w0, w1, score)) if score >= original_score + MIN_IMPROVEMENT => {
            Ok(SpanVerdict::Replace {
                start: scene.char_start + w0 as i64,
                end: scene.char_start + w1 as i64,
                score,
            })
        }
        _ => Ok(SpanVerdict::Keep {
            score: original_score,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentence_spans_split_on_terminators() {
        let text = "First sentence. Second one! Third? Tail without end";
        let spans = sentence_spans(text);
        let chars: Vec<char> = text.chars().collect();
        let pieces: Vec<String> = spans
            .iter()
            .map(|&(a, b)| chars[a..b].iter().collect())
            .collect();
        assert_eq!(
            pieces,
            vec![
                "First sentence.",
                "Second one!",
                "Third?",
                "Tail without end"
            ]
        );
    }

    #[test]
    fn sentence_spans_ignore_mid_word_periods_without_space() {
        let spans = sentence_spans("Dr. Watson arrived at 3.14 sharp. Then left.");
        // "Dr." is followed by whitespace, so it does split there; the
        // decimal point does not.
        let text = "Dr. Watson arrived at 3.14 sharp. Then left.";
        let chars: Vec<char> = text.chars().collect();
        let pieces: Vec<String> = spans
            .iter()
            .map(|&(a, b)| chars[a..b].iter().collect())
            .collect();
        assert_eq!(pieces, vec!["Dr.", "Watson arrived at 3.14 sharp.", "Then left."]);
    }

    #[test]
    fn covering_sentence_finds_overlap() {
        let spans = vec![(0, 10), (11, 25), (26, 40)];
        assert_eq!(covering_sentence(&spans, 3, 8), 0);
        assert_eq!(covering_sentence(&spans, 12, 20), 1);
        assert_eq!(covering_sentence(&spans, 8, 15), 0);
        assert_eq!(covering_sentence(&spans, 30, 35), 2);
    }

    #[test]
    fn windows_expand_within_sentence_budget() {
        let spans = vec![(0, 10), (11, 25), (26, 40), (41, 60)];
        let windows = candidate_windows(&spans, 1, 1);
        assert!(windows.contains(&(11, 25)));
        assert!(windows.contains(&(0, 25)));
        assert!(windows.contains(&(11, 40)));
        assert_eq!(windows.len(), 3);

        let wide = candidate_windows(&spans, 1, 2);
        assert!(wide.contains(&(11, 60)));
    }

    #[test]
    fn windows_are_capped() {
        let spans = vec![(0, 200), (201, 600)];
        let windows = candidate_windows(&spans, 0, 1);
        assert!(windows.iter().all(|(a, b)| b - a <= WINDOW_CHAR_CAP));
        assert!(windows.contains(&(0, 200)));
        assert!(windows.contains(&(0, WINDOW_CHAR_CAP)));
    }

    #[test]
    fn empty_text_yields_no_windows() {
        assert!(sentence_spans("").is_empty() || sentence_spans("") == vec![(0, 0)]);
        assert!(candidate_windows(&[], 0, 2).is_empty());
    }
}
