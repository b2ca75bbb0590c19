use common::utils::{canonical::canonical_len, token_estimate::TokenEstimate};

/// Packing limits for the chunker, in estimated tokens unless noted.
#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    /// Soft per-chunk target; paragraphs are packed until adding the next
    /// one would exceed it.
    pub soft_target: usize,
    /// Hard per-paragraph ceiling; anything larger is split first.
    pub paragraph_ceiling: usize,
    /// Characters of backward lookback when snapping a split point to a
    /// whitespace boundary.
    pub whitespace_lookback: usize,
    /// Maximum anchor excerpt length, in characters.
    pub anchor_chars: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            soft_target: 800,
            paragraph_ceiling: 2000,
            whitespace_lookback: 80,
            anchor_chars: 120,
        }
    }
}

/// A chunk as emitted by the chunker, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub position_index: i64,
    pub text: String,
    pub anchor_text: String,
    /// Half-open range in the chapter's canonical coordinate space.
    pub canonical_start: i64,
    pub canonical_end: i64,
}

/// Split one chapter's plain text into token-bounded chunks.
///
/// `start_position` is the first free book-global position index; the
/// returned value is the next free one after this chapter. Canonical
/// ranges restart at 0 for every chapter and are contiguous across the
/// chapter's chunks because canonicalization drops the whitespace the
/// packing introduces or removes.
pub fn chunk_chapter(
    text: &str,
    start_position: i64,
    estimator: &dyn TokenEstimate,
    limits: &ChunkLimits,
) -> (Vec<ChunkDraft>, i64) {
    let mut pieces = Vec::new();
    for paragraph in paragraphs(text) {
        if estimator.estimate(&paragraph) > limits.paragraph_ceiling {
            split_oversized(&paragraph, estimator, limits, &mut pieces);
        } else {
            pieces.push(paragraph);
        }
    }

    let mut chunks = Vec::new();
    let mut position = start_position;
    let mut canonical_offset: i64 = 0;
    let mut current = String::new();

    let mut flush = |current: &mut String, position: &mut i64, canonical_offset: &mut i64| {
        if current.is_empty() {
            return;
        }
        let text = std::mem::take(current);
        let canonical_start = *canonical_offset;
        let canonical_end = canonical_start + canonical_len(&text) as i64;
        chunks.push(ChunkDraft {
            position_index: *position,
            anchor_text: anchor_excerpt(&text, limits.anchor_chars),
            text,
            canonical_start,
            canonical_end,
        });
        *position += 1;
        *canonical_offset = canonical_end;
    };

    for piece in pieces {
        if current.is_empty() {
            current = piece;
            continue;
        }

        let candidate_estimate =
            estimator.estimate(&current) + estimator.estimate(&piece) + 1;
        if candidate_estimate > limits.soft_target {
            flush(&mut current, &mut position, &mut canonical_offset);
            current = piece;
        } else {
            current.push_str("\n\n");
            current.push_str(&piece);
        }
    }
    flush(&mut current, &mut position, &mut canonical_offset);

    (chunks, position)
}

/// Paragraphs are runs of non-blank lines; a line of only whitespace is a
/// boundary too.
fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line.trim_end());
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Split a paragraph whose estimate exceeds the hard ceiling. The cut
/// offset is approximated from the ceiling/estimate ratio and snapped
/// backward to whitespace within the lookback window; when no whitespace
/// is found there the approximate cut is kept so progress is guaranteed
/// on pathological input.
fn split_oversized(
    paragraph: &str,
    estimator: &dyn TokenEstimate,
    limits: &ChunkLimits,
    out: &mut Vec<String>,
) {
    let mut remaining = paragraph;

    loop {
        let estimate = estimator.estimate(remaining);
        if estimate <= limits.paragraph_ceiling || remaining.len() <= 1 {
            if !remaining.is_empty() {
                out.push(remaining.to_string());
            }
            return;
        }

        let approx = (remaining.len() * limits.paragraph_ceiling / estimate)
            .clamp(1, remaining.len() - 1);
        let approx = floor_char_boundary(remaining, approx);

        let window_start = approx.saturating_sub(limits.whitespace_lookback);
        let cut = match remaining[window_start..approx].rfind(char::is_whitespace) {
            Some(offset) if window_start + offset > 0 => window_start + offset,
            _ => approx.max(1),
        };

        let head = remaining[..cut].trim_end();
        if !head.is_empty() {
            out.push(head.to_string());
        }
        remaining = remaining[cut..].trim_start();
        if remaining.is_empty() {
            return;
        }
    }
}

/// Short excerpt from the start of a chunk, trimmed to a whitespace
/// boundary when one exists in range.
fn anchor_excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let byte_limit = text
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let head = &text[..byte_limit];

    match head.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => head[..idx].trim_end().to_string(),
        _ => head.to_string(),
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::token_estimate::HeuristicEstimator;

    fn small_limits() -> ChunkLimits {
        ChunkLimits {
            soft_target: 10,
            paragraph_ceiling: 25,
            whitespace_lookback: 20,
            anchor_chars: 30,
        }
    }

    #[test]
    fn canonical_ranges_are_contiguous_from_zero() {
        let text = "First paragraph, with punctuation!\n\n\
                    Second paragraph follows here.\n\n\
                    Third one is a bit longer than the others and keeps going.\n\n\
                    Fourth closes the chapter.";
        let (chunks, _) = chunk_chapter(text, 0, &HeuristicEstimator, &small_limits());

        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].canonical_start, 0);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].canonical_end, pair[1].canonical_start);
        }
        for chunk in &chunks {
            assert_eq!(
                chunk.canonical_end - chunk.canonical_start,
                canonical_len(&chunk.text) as i64
            );
        }
    }

    #[test]
    fn position_indexes_continue_from_start_position() {
        let text = "One paragraph here.\n\nAnother paragraph here.\n\nAnd a third paragraph.";
        let (chunks, next) = chunk_chapter(text, 7, &HeuristicEstimator, &small_limits());

        let positions: Vec<i64> = chunks.iter().map(|c| c.position_index).collect();
        let expected: Vec<i64> = (7..7 + chunks.len() as i64).collect();
        assert_eq!(positions, expected);
        assert_eq!(next, 7 + chunks.len() as i64);
    }

    #[test]
    fn oversized_paragraph_terminates_with_no_empty_pieces() {
        let paragraph = "word ".repeat(400);
        let (chunks, _) = chunk_chapter(&paragraph, 0, &HeuristicEstimator, &small_limits());

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(!chunk.text.is_empty());
            assert!(!chunk.text.trim().is_empty());
        }
    }

    #[test]
    fn pathological_unbroken_input_still_makes_progress() {
        // No whitespace anywhere: the approximate cut must be used as-is.
        let paragraph = "x".repeat(500);
        let (chunks, _) = chunk_chapter(&paragraph, 0, &HeuristicEstimator, &small_limits());

        assert!(chunks.len() > 1);
        let total: usize = chunks.iter().map(|c| c.text.len()).sum();
        assert_eq!(total, 500);
    }

    #[test]
    fn single_oversized_piece_is_still_emitted() {
        // Above the soft target but below the paragraph ceiling: it cannot
        // be packed with anything, but must never be dropped.
        let limits = ChunkLimits {
            soft_target: 5,
            paragraph_ceiling: 100,
            whitespace_lookback: 20,
            anchor_chars: 30,
        };
        let text = "a single moderately long paragraph that exceeds the target";
        let (chunks, next) = chunk_chapter(text, 0, &HeuristicEstimator, &limits);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(next, 1);
    }

    #[test]
    fn empty_chapter_yields_no_chunks() {
        let (chunks, next) = chunk_chapter("  \n\n  ", 3, &HeuristicEstimator, &small_limits());
        assert!(chunks.is_empty());
        assert_eq!(next, 3);
    }

    #[test]
    fn anchor_is_trimmed_to_a_word_boundary() {
        let text = "The quick brown fox jumps over the lazy dog near the riverbank every single morning";
        let anchor = anchor_excerpt(text, 30);
        assert!(anchor.chars().count() <= 30);
        assert!(!anchor.ends_with(char::is_whitespace));
        assert!(text.starts_with(&anchor));
        // Must not end mid-word.
        assert!(text[anchor.len()..].starts_with(char::is_whitespace));
    }
}
