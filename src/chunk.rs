//! Boundary-aware overlapping text chunker.
//!
//! Splits extracted document text into [`TextChunk`]s of at most `size`
//! characters. Consecutive chunks share exactly `overlap` characters, so the
//! next window always starts `overlap` characters before the previous end:
//!
//! ```text
//! text:    |---------------------------------------------|
//! chunk 0: |==========|
//! chunk 1:        |==========|
//! chunk 2:               |==========|
//!                 ^^^^ overlap
//! ```
//!
//! Within the upper half of each window the cut prefers, in order, a
//! paragraph break, a sentence end, then any whitespace. A hard cut at
//! `size` is used only when the window has none of these.
//!
//! Lengths and offsets are counted in Unicode scalar values, never bytes,
//! so a chunk never splits a multi-byte character.
//!
//! Each chunk id is `<document_id>:<index>` and carries a SHA-256 hash of its
//! text for change detection.

use sha2::{Digest, Sha256};

use crate::error::ChunkError;
use crate::models::{SourceRef, TextChunk};

/// Character span `[start, end)` of one chunk.
pub type Span = (usize, usize);

/// Compute chunk spans over `text`.
///
/// Returns an empty vector for empty input.
pub fn split_spans(text: &str, size: usize, overlap: usize) -> Result<Vec<Span>, ChunkError> {
    if size == 0 {
        return Err(ChunkError::ZeroSize);
    }
    if overlap >= size {
        return Err(ChunkError::OverlapTooLarge { size, overlap });
    }

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut spans = Vec::new();
    if len == 0 {
        return Ok(spans);
    }

    let mut start = 0;
    loop {
        if len - start <= size {
            spans.push((start, len));
            break;
        }

        let hard_end = start + size;
        // Cutting at or below `start + overlap` would stall the window.
        let lowest = (start + overlap + 1).max(start + size / 2);
        let end = find_boundary(&chars, lowest, hard_end).unwrap_or(hard_end);

        spans.push((start, end));
        start = end - overlap;
    }

    Ok(spans)
}

/// Pick the latest preferred cut position in `lowest..=highest`.
fn find_boundary(chars: &[char], lowest: usize, highest: usize) -> Option<usize> {
    let candidates = || (lowest..=highest).rev();

    let paragraph = candidates().find(|&end| end >= 2 && chars[end - 2] == '\n' && chars[end - 1] == '\n');
    if paragraph.is_some() {
        return paragraph;
    }

    let sentence = candidates().find(|&end| {
        matches!(chars[end - 1], '.' | '!' | '?')
            && chars.get(end).map_or(true, |c| c.is_whitespace())
    });
    if sentence.is_some() {
        return sentence;
    }

    candidates().find(|&end| chars[end - 1].is_whitespace())
}

/// Split a document's text into chunks attributed to `source`.
pub fn chunk_text(
    source: &SourceRef,
    text: &str,
    size: usize,
    overlap: usize,
) -> Result<Vec<TextChunk>, ChunkError> {
    let spans = split_spans(text, size, overlap)?;
    if spans.is_empty() {
        return Ok(Vec::new());
    }

    // Byte offset of every char boundary, plus the end of the string.
    let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    boundaries.push(text.len());

    Ok(spans
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| {
            let body = &text[boundaries[start]..boundaries[end]];
            make_chunk(source, index, start, end, body)
        })
        .collect())
}

fn make_chunk(source: &SourceRef, index: usize, start: usize, end: usize, text: &str) -> TextChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    TextChunk {
        id: format!("{}:{}", source.document_id, index),
        source: source.clone(),
        index,
        start,
        end,
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentType;

    fn source() -> SourceRef {
        SourceRef {
            document_id: "doc1".into(),
            label: "Q2 transcript".into(),
            url: "https://example.com/q2.pdf".into(),
            doc_type: DocumentType::Transcript,
            published: None,
        }
    }

    fn reassemble(chunks: &[TextChunk], overlap: usize) -> String {
        let mut out = String::new();
        for (i, c) in chunks.iter().enumerate() {
            if i == 0 {
                out.push_str(&c.text);
            } else {
                out.extend(c.text.chars().skip(overlap));
            }
        }
        out
    }

    fn sample_text() -> String {
        let mut text = String::new();
        for i in 0..40 {
            text.push_str(&format!(
                "Sentence number {} talks about quarterly revenue and margins. ",
                i
            ));
            if i % 7 == 6 {
                text.push_str("\n\n");
            }
        }
        text
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunks = chunk_text(&source(), "", 100, 10).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = chunk_text(&source(), "Revenue grew.", 100, 10).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Revenue grew.");
        assert_eq!(chunks[0].id, "doc1:0");
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(matches!(
            split_spans("abc", 0, 0),
            Err(ChunkError::ZeroSize)
        ));
        assert!(matches!(
            split_spans("abc", 10, 10),
            Err(ChunkError::OverlapTooLarge { .. })
        ));
    }

    #[test]
    fn size_overlap_and_reassembly_hold_across_parameters() {
        let text = sample_text();
        let len = text.chars().count();
        for (size, overlap) in [(50, 0), (50, 10), (120, 30), (200, 199), (333, 1), (64, 32)] {
            assert!(len > size);
            let chunks = chunk_text(&source(), &text, size, overlap).unwrap();
            assert!(chunks.len() > 1);

            for c in &chunks {
                assert!(c.text.chars().count() <= size, "size={} overlap={}", size, overlap);
            }
            for pair in chunks.windows(2) {
                let prev: Vec<char> = pair[0].text.chars().collect();
                let next: Vec<char> = pair[1].text.chars().collect();
                assert_eq!(pair[1].start, pair[0].end - overlap);
                assert_eq!(&prev[prev.len() - overlap..], &next[..overlap]);
            }
            assert_eq!(reassemble(&chunks, overlap), text);
        }
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let text = format!("{}\n\n{}", "a".repeat(70), "b".repeat(70));
        let chunks = chunk_text(&source(), &text, 100, 0).unwrap();
        assert_eq!(chunks[0].text, format!("{}\n\n", "a".repeat(70)));
        assert_eq!(chunks[1].text, "b".repeat(70));
    }

    #[test]
    fn prefers_sentence_end_over_plain_whitespace() {
        let text = "The deal pipeline is strong. Management expects growth next year and beyond";
        let chunks = chunk_text(&source(), text, 40, 0).unwrap();
        assert_eq!(chunks[0].text, "The deal pipeline is strong.");
    }

    #[test]
    fn multibyte_text_never_splits_characters() {
        let text = "₹ revenue ".repeat(30);
        let chunks = chunk_text(&source(), &text, 25, 5).unwrap();
        assert_eq!(reassemble(&chunks, 5), text);
    }

    #[test]
    fn indices_are_contiguous_and_hashes_deterministic() {
        let text = sample_text();
        let a = chunk_text(&source(), &text, 100, 20).unwrap();
        let b = chunk_text(&source(), &text, 100, 20).unwrap();
        for (i, c) in a.iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(c.hash, b[i].hash);
            assert_eq!(c.hash.len(), 64);
        }
    }
}
