//! Overlapping, boundary-aware text chunker.
//!
//! Splits extracted document text into [`Chunk`]s of roughly `chunk_tokens`
//! tokens, where consecutive chunks share about `overlap_tokens` tokens of
//! context. Every chunk is a contiguous byte span of the input, so the
//! sequence covers the whole text with no gaps.
//!
//! # Algorithm
//!
//! 1. Convert token budgets to character budgets using a 4 chars/token ratio.
//! 2. If the remaining text fits in one chunk, emit it and stop.
//! 3. Otherwise look for the best break inside the back half of the window,
//!    preferring a paragraph break (`\n\n`), then a sentence end, then a
//!    newline, then a space. Fall back to a hard cut at a char boundary.
//! 4. Start the next chunk `overlap` characters before the previous end,
//!    nudged forward to the next word boundary.
//! 5. Text shorter than one chunk (including empty text) yields exactly one
//!    chunk.
//!
//! # Example
//!
//! ```rust
//! use knowledge_vault::chunk::chunk_text;
//!
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", 400, 50);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].ordinal, 0);
//! ```

use uuid::Uuid;

use crate::models::Chunk;

/// Approximate characters-per-token ratio.
///
/// Rough heuristic (4 chars ≈ 1 token), also used for token estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count for a span of text (never 0 for non-empty text).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// A half-open byte range `[start, end)` of the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// Compute chunk spans over `text`.
///
/// # Guarantees
///
/// - At least one span is returned (even for empty text).
/// - The first span starts at 0 and the last ends at `text.len()`.
/// - Every span starts at or before the previous span's end (no gaps) and
///   strictly after the previous span's start (progress).
/// - All offsets are UTF-8 char boundaries.
pub fn chunk_spans(text: &str, chunk_tokens: usize, overlap_tokens: usize) -> Vec<Span> {
    let max_chars = chunk_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens.min(chunk_tokens.saturating_sub(1)) * CHARS_PER_TOKEN;
    let len = text.len();

    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        if len - start <= max_chars {
            spans.push(Span { start, end: len });
            break;
        }

        let hard_end = snap_back(text, start + max_chars);
        let hard_end = if hard_end <= start {
            next_char_boundary(text, start)
        } else {
            hard_end
        };
        let end = best_break(text, start, hard_end, max_chars / 2);
        spans.push(Span { start, end });

        start = if overlap_chars == 0 {
            end
        } else {
            overlap_start(text, start, end, overlap_chars)
        };
    }
    spans
}

/// Split text into chunks with contiguous ordinals starting at 0.
///
/// Each chunk receives a fresh UUID, its text span, and a token estimate.
/// Embeddings are left empty for the pipeline to fill.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    chunk_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    chunk_spans(text, chunk_tokens, overlap_tokens)
        .into_iter()
        .enumerate()
        .map(|(ordinal, span)| make_chunk(document_id, ordinal, &text[span.start..span.end]))
        .collect()
}

/// Pick a break point in `(start + min_len, hard_end]`, or `hard_end`.
fn best_break(text: &str, start: usize, hard_end: usize, min_len: usize) -> usize {
    let lo = snap_back(text, (start + min_len).min(hard_end));
    if lo >= hard_end {
        return hard_end;
    }
    let window = &text[lo..hard_end];

    if let Some(pos) = window.rfind("\n\n") {
        return lo + pos + 2;
    }
    let sentence_end = [". ", "! ", "? ", ".\n", "!\n", "?\n"]
        .iter()
        .filter_map(|pat| window.rfind(pat))
        .max();
    if let Some(pos) = sentence_end {
        return lo + pos + 1;
    }
    if let Some(pos) = window.rfind('\n') {
        return lo + pos + 1;
    }
    if let Some(pos) = window.rfind(' ') {
        return lo + pos + 1;
    }
    hard_end
}

/// Start of the next chunk: `overlap_chars` before `end`, moved forward to
/// the next word boundary when one exists before `end`.
fn overlap_start(text: &str, start: usize, end: usize, overlap_chars: usize) -> usize {
    let target = end.saturating_sub(overlap_chars).max(start + 1);
    let target = next_boundary_at_or_after(text, target);
    if target >= end {
        return end;
    }
    match text[target..end].find([' ', '\n']) {
        Some(pos) if target + pos + 1 < end => target + pos + 1,
        _ => target,
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_back(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_boundary_at_or_after(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Byte index of the char boundary following the char that starts at `index`.
fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| index + i)
        .unwrap_or(s.len())
}

fn make_chunk(document_id: &str, ordinal: usize, text: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        ordinal,
        text: text.to_string(),
        token_count: estimate_tokens(text),
        embedding: Vec::new(),
    }
}
