use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::models::{Chunk, Scene, Work};

/// Byte offset of every code point in a string, so spans expressed in code
/// points can be sliced without re-scanning. The last entry is the total
/// byte length, making `[i]..[i+1]` the byte range of code point `i`.
#[derive(Debug, Clone)]
pub struct CharOffsets {
    byte_of_char: Vec<usize>,
}

impl CharOffsets {
    pub fn new(text: &str) -> Self {
        let mut byte_of_char = Vec::with_capacity(text.len() + 1);
        for (byte, _) in text.char_indices() {
            byte_of_char.push(byte);
        }
        byte_of_char.push(text.len());
        Self { byte_of_char }
    }

    pub fn char_count(&self) -> usize {
        self.byte_of_char.len() - 1
    }

    /// Byte offset of code point `idx` (clamped to the end of text).
    pub fn byte(&self, idx: usize) -> usize {
        let idx = idx.min(self.char_count());
        self.byte_of_char[idx]
    }

    /// Code point index covering the given byte offset.
    pub fn char_of_byte(&self, byte: usize) -> usize {
        match self.byte_of_char.binary_search(&byte) {
            Ok(i) => i.min(self.char_count()),
            Err(i) => i - 1,
        }
    }
}

/// UTF-16 code-unit offset for each code point, for consumers (the review
/// UI) that address text by UTF-16 positions. The core itself only ever
/// exposes code-point offsets.
pub fn utf16_offsets(text: &str) -> Vec<usize> {
    let mut out = Vec::with_capacity(text.chars().count() + 1);
    let mut units = 0usize;
    out.push(0);
    for ch in text.chars() {
        units += ch.len_utf16();
        out.push(units);
    }
    out
}

/// Read-only view of one work's text with code-point-safe slicing.
#[derive(Debug, Clone)]
pub struct TextIndex {
    work: Work,
    offsets: CharOffsets,
}

impl TextIndex {
    pub fn new(work: Work) -> Self {
        let offsets = CharOffsets::new(&work.norm_text);
        Self { work, offsets }
    }

    pub fn work(&self) -> &Work {
        &self.work
    }

    pub fn char_count(&self) -> usize {
        self.offsets.char_count()
    }

    /// Slice `[start, end)` in code points, clamped to the text. Empty when
    /// `end <= start`.
    pub fn slice(&self, start: i64, end: i64) -> &str {
        let n = self.char_count() as i64;
        let start = start.clamp(0, n) as usize;
        let end = end.clamp(0, n) as usize;
        if end <= start {
            return "";
        }
        &self.work.norm_text[self.offsets.byte(start)..self.offsets.byte(end)]
    }

    pub fn scene_text(&self, scene: &Scene) -> &str {
        self.slice(scene.char_start, scene.char_end)
    }

    /// Refuse to judge a work whose chunk rows no longer agree with
    /// `norm_text`. A mismatch means the segmentation and the text have
    /// drifted apart, and any span we write would be wrong.
    pub fn verify_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        if self.work.char_count != self.char_count() as i64 {
            bail!(
                "work {}: char_count {} does not match norm_text length {}",
                self.work.id,
                self.work.char_count,
                self.char_count()
            );
        }
        for chunk in chunks {
            let sliced = self.slice(chunk.char_start, chunk.char_end);
            if sliced != chunk.text {
                bail!(
                    "chunk {}: text does not match norm_text[{}..{}]",
                    chunk.id,
                    chunk.char_start,
                    chunk.char_end
                );
            }
            let digest = format!("{:x}", Sha256::digest(chunk.text.as_bytes()));
            if !chunk.sha256.is_empty() && digest != chunk.sha256 {
                bail!("chunk {}: sha256 mismatch", chunk.id);
            }
        }
        Ok(())
    }
}

pub fn sha256_hex(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(text: &str) -> Work {
        Work {
            id: "w1".into(),
            title: None,
            author: None,
            norm_text: text.to_string(),
            char_count: text.chars().count() as i64,
        }
    }

    #[test]
    fn slice_is_code_point_based() {
        let index = TextIndex::new(work("caf\u{e9} — bar"));
        assert_eq!(index.slice(0, 4), "caf\u{e9}");
        assert_eq!(index.slice(5, 6), "\u{2014}");
        assert_eq!(index.slice(7, 10), "bar");
    }

    #[test]
    fn slice_clamps_and_handles_inverted_ranges() {
        let index = TextIndex::new(work("hello"));
        assert_eq!(index.slice(-3, 2), "he");
        assert_eq!(index.slice(2, 99), "llo");
        assert_eq!(index.slice(4, 2), "");
        assert_eq!(index.slice(9, 12), "");
    }

    #[test]
    fn char_of_byte_round_trips() {
        let text = "a\u{e9}b\u{1F600}c";
        let offsets = CharOffsets::new(text);
        for (i, (byte, _)) in text.char_indices().enumerate() {
            assert_eq!(offsets.char_of_byte(byte), i);
            assert_eq!(offsets.byte(i), byte);
        }
        assert_eq!(offsets.char_count(), 5);
    }

    #[test]
    fn utf16_map_counts_surrogate_pairs() {
        let map = utf16_offsets("a\u{1F600}b");
        assert_eq!(map, vec![0, 1, 3, 4]);
    }

    #[test]
    fn verify_chunks_accepts_consistent_rows() {
        let text = "The night was dark. The storm came.";
        let index = TextIndex::new(work(text));
        let chunk = Chunk {
            id: "c1".into(),
            work_id: "w1".into(),
            scene_id: "s1".into(),
            idx: 0,
            char_start: 0,
            char_end: 19,
            text: text.chars().take(19).collect(),
            sha256: sha256_hex(&text.chars().take(19).collect::<String>()),
        };
        assert!(index.verify_chunks(&[chunk]).is_ok());
    }

    #[test]
    fn verify_chunks_rejects_drifted_text() {
        let index = TextIndex::new(work("abcdef"));
        let chunk = Chunk {
            id: "c1".into(),
            work_id: "w1".into(),
            scene_id: "s1".into(),
            idx: 0,
            char_start: 0,
            char_end: 3,
            text: "xyz".into(),
            sha256: String::new(),
        };
        assert!(index.verify_chunks(&[chunk]).is_err());
    }
}
