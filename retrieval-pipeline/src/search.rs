use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{book_position::BookPosition, chunk::Chunk},
    },
    utils::canonical::canonical_len,
};
use serde::Serialize;

/// Upper bound on chunk rows scanned per search call.
pub const SEARCH_SCAN_CAP: usize = 1200;

const SNIPPET_CONTEXT_CHARS: usize = 60;

/// One occurrence of the query string, located in both coordinate
/// spaces: raw byte offsets into the chunk text (fragile across
/// re-extraction) and canonical offsets (reflow-stable).
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub chunk_id: String,
    pub chapter_index: i64,
    pub chapter_title: Option<String>,
    pub position_index: i64,
    pub spine_href: Option<String>,
    pub cfi_range: Option<String>,
    pub anchor_text: Option<String>,
    /// The matched text as it appears in the chunk, casing preserved.
    pub match_text: String,
    pub offset_start: usize,
    pub offset_end: usize,
    /// Canonical range of the match itself, never narrower than 1 so a
    /// punctuation-only match still addresses a spot in the chapter.
    pub canonical_start: Option<i64>,
    pub canonical_end: Option<i64>,
    /// Canonical range of the whole containing chunk.
    pub chunk_canonical_start: Option<i64>,
    pub chunk_canonical_end: Option<i64>,
    pub snippet: String,
}

/// Case-insensitive (ASCII) substring search over chunks the reader has
/// already reached. Without a stored reading position the whole book is
/// searchable.
pub async fn search_chunks(
    db: &SurrealDbClient,
    book_id: &str,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchMatch>, AppError> {
    let needle = query.trim().to_ascii_lowercase();
    if needle.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let ceiling = BookPosition::get_for_book(book_id, db)
        .await?
        .map(|position| position.position_index);

    let chunks: Vec<Chunk> = match ceiling {
        Some(max_position) => db
            .client
            .query(format!(
                "SELECT * FROM chunk \
                 WHERE book_id = $book_id AND position_index <= $max_position \
                 ORDER BY position_index LIMIT {SEARCH_SCAN_CAP}"
            ))
            .bind(("book_id", book_id.to_string()))
            .bind(("max_position", max_position))
            .await?
            .take(0)?,
        None => db
            .client
            .query(format!(
                "SELECT * FROM chunk WHERE book_id = $book_id \
                 ORDER BY position_index LIMIT {SEARCH_SCAN_CAP}"
            ))
            .bind(("book_id", book_id.to_string()))
            .await?
            .take(0)?,
    };

    let mut matches = Vec::new();
    for chunk in chunks {
        // ASCII lowercasing keeps byte offsets aligned with the original.
        let haystack = chunk.text.to_ascii_lowercase();
        let mut from = 0usize;

        while let Some(found) = haystack[from..].find(&needle) {
            let start = from + found;
            let end = start + needle.len();
            let match_text = chunk.text[start..end].to_string();

            let canonical_start = chunk
                .canonical_start
                .map(|base| base + canonical_len(&chunk.text[..start]) as i64);
            let canonical_width = (canonical_len(&match_text) as i64).max(1);
            let canonical_end = canonical_start.map(|s| s + canonical_width);

            matches.push(SearchMatch {
                chunk_id: chunk.id.clone(),
                chapter_index: chunk.chapter_index,
                chapter_title: chunk.chapter_title.clone(),
                position_index: chunk.position_index,
                spine_href: chunk.spine_href.clone(),
                cfi_range: chunk.cfi_range.clone(),
                anchor_text: chunk.anchor_text.clone(),
                match_text,
                offset_start: start,
                offset_end: end,
                canonical_start,
                canonical_end,
                chunk_canonical_start: chunk.canonical_start,
                chunk_canonical_end: chunk.canonical_end,
                snippet: snippet_around(&chunk.text, start, end),
            });

            if matches.len() >= limit {
                return Ok(matches);
            }
            from = end;
        }
    }

    Ok(matches)
}

/// Whitespace-normalized excerpt around a match.
fn snippet_around(text: &str, start: usize, end: usize) -> String {
    let from = floor_char_boundary(text, start.saturating_sub(SNIPPET_CONTEXT_CHARS));
    let to = ceil_char_boundary(text, (end + SNIPPET_CONTEXT_CHARS).min(text.len()));
    text[from..to].split_whitespace().collect::<Vec<_>>().join(" ")
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}
