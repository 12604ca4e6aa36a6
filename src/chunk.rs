//! Word-boundary text chunker.
//!
//! Extractors hand over [`Section`]s (a page, a slide, a sheet, or the whole
//! file for flat text). Each section is split into pieces of at most
//! `max_chars` bytes, preferring paragraph breaks, then whitespace, with
//! `overlap` bytes of trailing context repeated at the start of the next
//! piece. Every piece gets a human-readable pointer and a SHA-256 hash used
//! for embedding staleness checks.

use sha2::{Digest, Sha256};

use crate::models::NewChunk;

/// A labelled span of extracted text. `label` becomes the pointer prefix;
/// unlabelled sections produce `chunk N` pointers.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub label: Option<String>,
    pub text: String,
}

impl Section {
    pub fn labelled(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            text: text.into(),
        }
    }

    pub fn flat(text: impl Into<String>) -> Self {
        Self {
            label: None,
            text: text.into(),
        }
    }
}

/// Lazily turns sections into numbered chunks. Calling it again on the same
/// slice restarts from the beginning.
pub fn chunk_sections<'a>(
    sections: &'a [Section],
    max_chars: usize,
    overlap: usize,
) -> impl Iterator<Item = NewChunk> + 'a {
    sections
        .iter()
        .flat_map(move |section| {
            let pieces = split_text(&section.text, max_chars, overlap);
            let label = section.label.clone();
            pieces
                .into_iter()
                .enumerate()
                .map(move |(i, text)| (pointer_for(label.as_deref(), i), text))
        })
        .enumerate()
        .map(|(seq, (pointer, text))| make_chunk(seq as i64, pointer, text))
}

fn pointer_for(label: Option<&str>, piece: usize) -> String {
    match label {
        Some(l) if piece == 0 => l.to_string(),
        Some(l) => format!("{} #{}", l, piece + 1),
        None => format!("chunk {}", piece + 1),
    }
}

/// Split `text` into trimmed, non-empty pieces no longer than `max_chars`
/// bytes (a single word longer than that is hard-cut on a char boundary).
pub fn split_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let text = text.trim();
    let mut pieces = Vec::new();
    if text.is_empty() || max_chars == 0 {
        return pieces;
    }

    let mut start = 0usize;
    while start < text.len() {
        let rest = &text[start..];
        if rest.len() <= max_chars {
            push_piece(&mut pieces, rest);
            break;
        }

        let mut hard_end = floor_boundary(text, start + max_chars);
        if hard_end <= start {
            hard_end = start + rest.chars().next().map_or(1, char::len_utf8);
        }
        let window = &text[start..hard_end];
        let min_break = window.len() / 2;
        let brk = window
            .rfind("\n\n")
            .filter(|&p| p >= min_break)
            .or_else(|| {
                window
                    .char_indices()
                    .rev()
                    .find(|(p, c)| *p >= min_break && c.is_whitespace())
                    .map(|(p, _)| p)
            })
            .map(|p| start + p)
            .unwrap_or(hard_end);
        let brk = if brk <= start { hard_end } else { brk };

        push_piece(&mut pieces, &text[start..brk]);

        let mut next = floor_boundary(text, brk.saturating_sub(overlap));
        if overlap > 0 && next > start {
            // Start the overlap on a word boundary.
            if let Some((p, c)) = text[next..brk].char_indices().find(|(_, c)| c.is_whitespace()) {
                next += p + c.len_utf8();
            }
        }
        if next <= start || overlap == 0 {
            next = brk;
        }
        while next < text.len() && !text.is_char_boundary(next) {
            next += 1;
        }
        start = next;
    }

    pieces
}

fn push_piece(pieces: &mut Vec<String>, piece: &str) {
    let trimmed = piece.trim();
    if !trimmed.is_empty() {
        pieces.push(trimmed.to_string());
    }
}

fn floor_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(seq: i64, pointer: String, content: String) -> NewChunk {
    NewChunk {
        seq,
        pointer,
        hash: hash_text(&content),
        content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_single_piece() {
        let pieces = split_text("Hello, world!", 100, 10);
        assert_eq!(pieces, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(split_text("   \n\n  ", 100, 10).is_empty());
    }

    #[test]
    fn pieces_respect_max_and_break_on_words() {
        let text = (0..200).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ");
        let pieces = split_text(&text, 60, 0);
        assert!(pieces.len() > 1);
        for p in &pieces {
            assert!(p.len() <= 60, "piece too long: {}", p.len());
            assert!(p.starts_with("word"), "piece split mid-word: {}", p);
        }
    }

    #[test]
    fn overlap_repeats_trailing_words() {
        let text = (0..100).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let pieces = split_text(&text, 50, 15);
        assert!(pieces.len() > 2);
        let first_last_word = pieces[0].split_whitespace().last().unwrap();
        assert!(pieces[1].contains(first_last_word));
    }

    #[test]
    fn multibyte_text_never_panics() {
        let text = "é".repeat(500);
        let pieces = split_text(&text, 33, 7);
        assert!(!pieces.is_empty());
        for p in &pieces {
            assert!(p.len() <= 33);
        }
    }

    #[test]
    fn pointers_follow_section_labels() {
        let sections = vec![
            Section::labelled("page 1", "short"),
            Section::labelled("page 2", "a ".repeat(60)),
        ];
        let chunks: Vec<_> = chunk_sections(&sections, 50, 0).collect();
        assert_eq!(chunks[0].pointer, "page 1");
        assert_eq!(chunks[1].pointer, "page 2");
        assert_eq!(chunks[2].pointer, "page 2 #2");
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.seq, i as i64);
        }
    }

    #[test]
    fn flat_text_gets_numbered_pointers() {
        let sections = vec![Section::flat("x ".repeat(100))];
        let chunks: Vec<_> = chunk_sections(&sections, 40, 0).collect();
        assert_eq!(chunks[0].pointer, "chunk 1");
        assert_eq!(chunks[1].pointer, "chunk 2");
    }

    #[test]
    fn chunking_is_deterministic_and_restartable() {
        let sections = vec![Section::flat("Alpha\n\nBeta\n\nGamma\n\nDelta")];
        let a: Vec<_> = chunk_sections(&sections, 12, 0).collect();
        let b: Vec<_> = chunk_sections(&sections, 12, 0).collect();
        assert_eq!(a, b);
    }
}
