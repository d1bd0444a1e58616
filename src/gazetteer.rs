use std::collections::HashSet;

use anyhow::Result;
use regex::Regex;
use uuid::Uuid;

use crate::config::SeedConfig;
use crate::db::Database;
use crate::models::{CandidateSource, Chunk, Trope, TropeCandidate};
use crate::text_index::CharOffsets;

/// ASCII hyphen plus the Unicode hyphen/dash range, treated as equivalent
/// to whitespace inside multi-word surfaces.
const DASH_CLASS: &str = r"[-\x{2010}-\x{2015}]";

/// Negation cues that kill a match when they appear within three tokens
/// immediately before the surface.
const NEGATION_CUES: [&str; 7] = ["no", "not", "never", "without", "isn't", "wasn't", "anti"];

/// Overly generic surfaces that caused noise as aliases. Canonical trope
/// names are always kept even when they appear here.
const STOPLIST: [&str; 36] = [
    "hero", "villain", "power", "fight", "battle", "magic", "love", "war", "secret", "plan",
    "agent", "mystery", "weapon", "girl", "boy", "night", "day", "city", "king", "queen", "man",
    "woman", "monster", "beast", "darkness", "light", "death", "life", "friend", "enemy",
    "revenge", "curse", "buddy", "backup", "job", "serious",
];

#[derive(Debug, Clone)]
pub struct AliasPattern {
    pub alias: String,
    pub pattern: Regex,
    anti_pattern: Regex,
}

/// Compiled boundary matcher for one trope: canonical name + usable aliases,
/// longest surface first, plus the trope's anti-alias phrases.
#[derive(Debug, Clone)]
pub struct TropeMatcher {
    pub trope_id: String,
    patterns: Vec<AliasPattern>,
    anti_aliases: Vec<Regex>,
}

/// One boundary match in chunk-local code-point coordinates.
#[derive(Debug, Clone)]
pub struct GazetteerMatch {
    pub alias: String,
    pub surface: String,
    pub start: usize,
    pub end: usize,
}

pub fn norm_alias(raw: &str) -> String {
    let collapsed = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_matches(|c: char| ",.;:!?\"'()[]{}".contains(c))
        .to_string()
}

fn escape_token(token: &str) -> String {
    let mut out = String::new();
    for ch in token.chars() {
        match ch {
            '-' | '\u{2010}'..='\u{2015}' => out.push_str(DASH_CLASS),
            // ASCII and curly apostrophes are interchangeable in prose.
            '\'' | '\u{2019}' => out.push_str("['\u{2019}]"),
            c if c.is_alphanumeric() || c == '_' => out.push(c),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out
}

fn is_alphabetic_word(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_alphabetic())
}

/// Regex core for one normalized surface: tokens joined by whitespace or
/// dashes, optional trailing `s` on the final alphabetic token unless the
/// surface already ends in `s`.
fn build_core(alias: &str) -> Option<String> {
    let parts: Vec<&str> = alias.split_whitespace().collect();
    if parts.is_empty() {
        return None;
    }

    let mut tokens: Vec<String> = parts.iter().map(|p| escape_token(p)).collect();
    let last = parts[parts.len() - 1];
    if is_alphabetic_word(last) && !last.ends_with('s') {
        let idx = tokens.len() - 1;
        tokens[idx] = format!("{}s?", tokens[idx]);
    }

    let joiner = format!("(?:{DASH_CLASS}+\\s*|\\s+)");
    Some(tokens.join(&joiner))
}

pub fn build_pattern(alias: &str) -> Option<Regex> {
    let core = build_core(alias)?;
    Regex::new(&format!(r"(?i)\b(?:{core})\b")).ok()
}

fn build_anti_pattern(alias: &str) -> Option<Regex> {
    let core = build_core(alias)?;
    Regex::new(&format!(r"(?i)\b(?:anti|non)(?:{DASH_CLASS}|\s)+(?:{core})\b")).ok()
}

/// Whole-word, case-insensitive matcher for an anti-alias phrase.
fn build_phrase_pattern(phrase: &str) -> Option<Regex> {
    let normalized = norm_alias(phrase);
    if normalized.is_empty() {
        return None;
    }
    let tokens: Vec<String> = normalized.split_whitespace().map(|t| escape_token(t)).collect();
    let core = tokens.join(&format!("(?:{DASH_CLASS}+\\s*|\\s+)"));
    Regex::new(&format!(r"(?i)\b(?:{core})\b")).ok()
}

impl TropeMatcher {
    /// Compile a matcher for a trope. The canonical name is always kept;
    /// other aliases pass the stoplist and a minimum length.
    pub fn build(trope: &Trope, min_len: usize) -> Self {
        let canonical = norm_alias(&trope.name);
        let mut surfaces: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        if !canonical.is_empty() && seen.insert(canonical.clone()) {
            surfaces.push(canonical);
        }
        for alias in &trope.aliases {
            let normalized = norm_alias(alias);
            if normalized.is_empty()
                || normalized.chars().count() < min_len
                || STOPLIST.contains(&normalized.as_str())
            {
                continue;
            }
            if seen.insert(normalized.clone()) {
                surfaces.push(normalized);
            }
        }

        // Longest surface first so overlapping hits resolve to the longest span.
        surfaces.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));

        let patterns = surfaces
            .into_iter()
            .filter_map(|alias| {
                let pattern = build_pattern(&alias)?;
                let anti_pattern = build_anti_pattern(&alias)?;
                Some(AliasPattern {
                    alias,
                    pattern,
                    anti_pattern,
                })
            })
            .collect();

        let anti_aliases = trope
            .anti_aliases
            .iter()
            .filter_map(|phrase| build_phrase_pattern(phrase))
            .collect();

        Self {
            trope_id: trope.id.clone(),
            patterns,
            anti_aliases,
        }
    }

    /// Read-only lexical check used by the sanity prior.
    pub fn has_mention(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.pattern.is_match(text))
    }

    /// All raw mention spans in `text` (code points), without
    /// anti-suppression or overlap collapse. Used by the negation pass.
    pub fn find_mentions(&self, text: &str) -> Vec<(usize, usize)> {
        let offsets = CharOffsets::new(text);
        let mut out: Vec<(usize, usize)> = Vec::new();
        for alias_pattern in &self.patterns {
            for m in alias_pattern.pattern.find_iter(text) {
                let span = (offsets.char_of_byte(m.start()), offsets.char_of_byte(m.end()));
                if !out.contains(&span) {
                    out.push(span);
                }
            }
        }
        out.sort_unstable();
        out
    }

    /// True when any of the trope's anti-alias phrases appears in `text`.
    pub fn has_anti_alias(&self, text: &str) -> bool {
        self.anti_aliases.iter().any(|p| p.is_match(text))
    }

    /// All boundary matches in `text`, anti-suppressed, with overlapping
    /// matches collapsed to the longest span. Offsets are code points.
    pub fn scan(&self, text: &str, anti_window: usize) -> Vec<GazetteerMatch> {
        let offsets = CharOffsets::new(text);
        let mut raw: Vec<GazetteerMatch> = Vec::new();

        for alias_pattern in &self.patterns {
            for m in alias_pattern.pattern.find_iter(text) {
                let start = offsets.char_of_byte(m.start());
                let end = offsets.char_of_byte(m.end());
                if self.suppressed(text, &offsets, start, end, anti_window) {
                    continue;
                }
                raw.push(GazetteerMatch {
                    alias: alias_pattern.alias.clone(),
                    surface: m.as_str().to_string(),
                    start,
                    end,
                });
            }
        }

        collapse_to_longest(raw)
    }

    fn suppressed(
        &self,
        text: &str,
        offsets: &CharOffsets,
        start: usize,
        end: usize,
        anti_window: usize,
    ) -> bool {
        let total = offsets.char_count();
        let w0 = start.saturating_sub(anti_window);
        let w1 = (end + anti_window).min(total);
        let window = &text[offsets.byte(w0)..offsets.byte(w1)];

        if self.anti_aliases.iter().any(|p| p.is_match(window)) {
            return true;
        }
        if self.patterns.iter().any(|p| p.anti_pattern.is_match(window)) {
            return true;
        }

        let before = &text[offsets.byte(w0)..offsets.byte(start)];
        has_leading_negation(before)
    }
}

/// True when one of the negation cues sits within the last three tokens of
/// the text immediately preceding a surface.
fn has_leading_negation(before: &str) -> bool {
    before
        .split_whitespace()
        .rev()
        .take(3)
        .map(clean_token)
        .any(|token| NEGATION_CUES.contains(&token.as_str()))
}

fn clean_token(token: &str) -> String {
    token
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '\u{2019}')
        .replace('\u{2019}', "'")
        .to_lowercase()
}

/// Keep the longest span among overlapping matches; ties break toward the
/// earlier start so output order is stable.
fn collapse_to_longest(mut matches: Vec<GazetteerMatch>) -> Vec<GazetteerMatch> {
    matches.sort_by(|a, b| {
        (b.end - b.start)
            .cmp(&(a.end - a.start))
            .then(a.start.cmp(&b.start))
    });

    let mut kept: Vec<GazetteerMatch> = Vec::new();
    for candidate in matches {
        let overlaps = kept
            .iter()
            .any(|k| candidate.start < k.end && k.start < candidate.end);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept.sort_by_key(|m| m.start);
    kept
}

/// Seed gazetteer candidates for a work: scan every chunk once per trope,
/// convert chunk-local offsets to absolute offsets, and rely on the unique
/// span index for idempotence across runs.
pub async fn seed_gazetteer(
    db: &Database,
    work_id: &str,
    chunks: &[Chunk],
    tropes: &[Trope],
    config: &SeedConfig,
) -> Result<usize> {
    let mut inserted = 0usize;

    for trope in tropes {
        let matcher = TropeMatcher::build(trope, config.alias_min_len);
        let mut per_trope = 0usize;

        'chunks: for chunk in chunks {
            if chunk.text.is_empty() {
                continue;
            }
            for hit in matcher.scan(&chunk.text, config.anti_window) {
                let start = chunk.char_start + hit.start as i64;
                let end = chunk.char_start + hit.end as i64;
                if start < chunk.char_start || end > chunk.char_end {
                    continue;
                }

                let candidate = TropeCandidate {
                    id: Uuid::new_v4().to_string(),
                    work_id: work_id.to_string(),
                    scene_id: chunk.scene_id.clone(),
                    chunk_id: Some(chunk.id.clone()),
                    trope_id: trope.id.clone(),
                    surface: Some(hit.surface),
                    alias: Some(hit.alias),
                    start,
                    end,
                    source: CandidateSource::Gazetteer,
                    score: 0.0,
                };
                if db.insert_candidate(&candidate).await? {
                    inserted += 1;
                    per_trope += 1;
                }
                if per_trope >= config.max_per_trope {
                    break 'chunks;
                }
            }
        }
    }

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trope(name: &str, aliases: &[&str], anti: &[&str]) -> Trope {
        Trope {
            id: "t1".into(),
            name: name.into(),
            summary: String::new(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            anti_aliases: anti.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn norm_alias_collapses_and_trims() {
        assert_eq!(norm_alias("  Dark   And  Stormy! "), "dark and stormy");
        assert_eq!(norm_alias("\"Chekhov's Gun\""), "chekhov's gun");
    }

    #[test]
    fn matches_basic_phrase_at_word_boundaries() {
        let matcher = TropeMatcher::build(&trope("Dark And Stormy Night", &["dark and stormy"], &[]), 5);
        let hits = matcher.scan("It was a dark and stormy night.", 60);
        assert_eq!(hits.len(), 1);
        // Longest surface wins: the full name, not the shorter alias.
        assert_eq!(hits[0].start, 9);
        assert_eq!(hits[0].end, 30);
        assert_eq!(hits[0].surface, "dark and stormy night");
    }

    #[test]
    fn hyphen_and_space_are_equivalent() {
        let matcher = TropeMatcher::build(&trope("Face Heel Turn", &[], &[]), 5);
        assert_eq!(matcher.scan("a sudden face-heel turn", 60).len(), 1);
        assert_eq!(matcher.scan("a sudden face\u{2014}heel turn", 60).len(), 1);
    }

    #[test]
    fn optional_plural_matches_unless_surface_ends_in_s() {
        let matcher = TropeMatcher::build(&trope("Bottle Episode", &[], &[]), 5);
        assert_eq!(matcher.scan("two bottle episodes in a row", 60).len(), 1);

        // Final token already ends in `s`: no plural form is generated.
        let no_plural = TropeMatcher::build(&trope("Comedy Of Manners", &[], &[]), 5);
        assert_eq!(no_plural.scan("a comedy of manners unfolded", 60).len(), 1);
        assert!(no_plural.scan("a comedy of mannerss unfolded", 60).is_empty());
    }

    #[test]
    fn curly_apostrophe_matches_ascii_alias() {
        let matcher = TropeMatcher::build(&trope("Chekhov's Gun", &[], &[]), 5);
        assert_eq!(matcher.scan("classic Chekhov\u{2019}s gun setup", 60).len(), 1);
    }

    #[test]
    fn does_not_match_inside_words() {
        let matcher = TropeMatcher::build(&trope("Heel", &[], &[]), 2);
        assert!(matcher.scan("the wheelbarrow squeaked", 60).is_empty());
        assert_eq!(matcher.scan("turned heel and left", 60).len(), 1);
    }

    #[test]
    fn anti_alias_phrase_suppresses_match() {
        let matcher = TropeMatcher::build(&trope("Dream Sequence", &["dream"], &["dream-like prose"]), 5);
        assert!(matcher.scan("her dream-like prose soared", 60).is_empty());
        assert_eq!(matcher.scan("the dream sequence began", 60).len(), 1);
    }

    #[test]
    fn anti_prefix_suppresses_match() {
        let matcher = TropeMatcher::build(&trope("Whodunit", &[], &[]), 5);
        assert!(matcher.scan("an anti-whodunit in structure", 60).is_empty());
        assert!(matcher.scan("a non whodunit story", 60).is_empty());
        assert_eq!(matcher.scan("a classic whodunit", 60).len(), 1);
    }

    #[test]
    fn negation_cue_within_three_tokens_suppresses() {
        let matcher = TropeMatcher::build(&trope("Dark And Stormy Night", &["dark and stormy"], &[]), 5);
        assert!(matcher
            .scan("This isn't a dark and stormy night.", 60)
            .is_empty());
        assert!(matcher
            .scan("There was never a dark and stormy night.", 60)
            .is_empty());
        // Four tokens away: the cue no longer binds to the surface.
        assert_eq!(
            matcher
                .scan("not once in all those years, a dark and stormy night came", 60)
                .len(),
            1
        );
    }

    #[test]
    fn stoplist_drops_generic_alias_but_keeps_canonical_name() {
        let matcher = TropeMatcher::build(&trope("Night", &["mystery"], &[]), 5);
        // "mystery" is stoplisted; canonical "night" still matches.
        assert_eq!(matcher.scan("a mystery in the night", 60).len(), 1);
    }

    #[test]
    fn scan_offsets_are_code_points() {
        let matcher = TropeMatcher::build(&trope("Stormy Night", &[], &[]), 5);
        let text = "caf\u{e9} \u{2014} stormy night ahead";
        let hits = matcher.scan(text, 60);
        assert_eq!(hits.len(), 1);
        let chars: Vec<char> = text.chars().collect();
        let surface: String = chars[hits[0].start..hits[0].end].iter().collect();
        assert_eq!(surface, "stormy night");
    }

    #[test]
    fn overlapping_matches_collapse_to_longest() {
        let collapsed = collapse_to_longest(vec![
            GazetteerMatch {
                alias: "short".into(),
                surface: "dark".into(),
                start: 9,
                end: 13,
            },
            GazetteerMatch {
                alias: "long".into(),
                surface: "dark and stormy".into(),
                start: 9,
                end: 24,
            },
        ]);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].alias, "long");
    }

    #[test]
    fn scan_is_deterministic() {
        let matcher = TropeMatcher::build(
            &trope("Dark And Stormy Night", &["dark and stormy", "stormy night"], &[]),
            5,
        );
        let text = "It was a dark and stormy night. Another stormy night followed.";
        let first = matcher.scan(text, 60);
        let second = matcher.scan(text, 60);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!((a.start, a.end, &a.alias), (b.start, b.end, &b.alias));
        }
    }
}
