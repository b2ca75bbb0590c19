use std::collections::HashMap;

use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Chunk, "chunk", {
    book_id: String,
    chapter_index: i64,
    chapter_title: Option<String>,
    spine_href: Option<String>,
    /// Book-global, monotonically increasing chunk position. This is the
    /// coordinate the spoiler boundary is enforced on.
    position_index: i64,
    text: String,
    anchor_text: Option<String>,
    canonical_start: Option<i64>,
    canonical_end: Option<i64>,
    /// Opaque citation token supplied later by the reading surface.
    cfi_range: Option<String>
});

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        book_id: String,
        chapter_index: i64,
        chapter_title: Option<String>,
        spine_href: Option<String>,
        position_index: i64,
        text: String,
        anchor_text: Option<String>,
        canonical_start: i64,
        canonical_end: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            book_id,
            chapter_index,
            chapter_title,
            spine_href,
            position_index,
            text,
            anchor_text,
            canonical_start: Some(canonical_start),
            canonical_end: Some(canonical_end),
            cfi_range: None,
        }
    }

    pub async fn get_for_chapter(
        book_id: &str,
        chapter_index: i64,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let chunks: Vec<Self> = db
            .client
            .query(
                "SELECT * FROM chunk \
                 WHERE book_id = $book_id AND chapter_index = $chapter_index \
                 ORDER BY position_index",
            )
            .bind(("book_id", book_id.to_string()))
            .bind(("chapter_index", chapter_index))
            .await?
            .take(0)?;
        Ok(chunks)
    }

    /// Load chunks by id, returned in the order of `ids` (callers pass
    /// retrieval order, which is ascending distance, not storage order).
    pub async fn get_by_ids(ids: &[String], db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let things: Vec<Thing> = ids
            .iter()
            .map(|id| Thing::from((Self::table_name(), id.as_str())))
            .collect();

        let chunks: Vec<Self> = db
            .client
            .query("SELECT * FROM chunk WHERE id IN $things")
            .bind(("things", things))
            .await?
            .take(0)?;

        let mut by_id: HashMap<String, Self> = chunks
            .into_iter()
            .map(|chunk| (chunk.id.clone(), chunk))
            .collect();

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Batch update of reading-surface citation tokens. `None` clears the
    /// stored token. Tokens are opaque to the core and stored unmodified.
    /// Returns the number of rows actually changed; ids belonging to other
    /// books fail the `WHERE` filter and are not counted.
    pub async fn set_cfi_ranges(
        book_id: &str,
        updates: &[(String, Option<String>)],
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        let mut updated = 0usize;
        for (chunk_id, cfi_range) in updates {
            let trimmed = cfi_range
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string);

            let rows: Vec<Self> = db
                .client
                .query(
                    "UPDATE type::thing('chunk', $id) \
                     SET cfi_range = $cfi_range, updated_at = time::now() \
                     WHERE book_id = $book_id",
                )
                .bind(("id", chunk_id.clone()))
                .bind(("cfi_range", trimmed))
                .bind(("book_id", book_id.to_string()))
                .await?
                .take(0)?;
            updated += rows.len();
        }
        Ok(updated)
    }

    /// Short non-sensitive excerpt for conversation source lists.
    pub fn snippet(&self, max_chars: usize) -> String {
        self.text.chars().take(max_chars).collect()
    }
}
