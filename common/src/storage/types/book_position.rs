use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::chapter::Chapter},
    stored_object,
};

stored_object!(BookPosition, "book_position", {
    book_id: String,
    chapter_index: i64,
    chapter_percent: f64,
    /// Whole-book progress as reported by the reading surface; stays
    /// unset until the surface reports one.
    book_percent: Option<f64>,
    /// Book-global chunk position the reader has reached, interpolated
    /// from the chapter's chunk range and the in-chapter percentage.
    position_index: i64,
    cfi: Option<String>
});

/// Incoming reading-position report. Everything except the chapter
/// percentage is optional; a missing chapter index falls back to the
/// stored one.
#[derive(Debug, Clone, Default)]
pub struct PositionUpdate {
    pub chapter_index: Option<i64>,
    pub chapter_percent: f64,
    pub book_percent: Option<f64>,
    pub cfi: Option<String>,
}

fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

impl BookPosition {
    pub async fn get_for_book(
        book_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        Ok(db.get_item(book_id).await?)
    }

    /// Record the reader's position. The position index is interpolated
    /// across the chapter's chunk range, so it stays valid when the
    /// rendering surface reflows text.
    pub async fn set_for_book(
        book_id: &str,
        update: PositionUpdate,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let stored = Self::get_for_book(book_id, db).await?;

        let chapter_index = update
            .chapter_index
            .or_else(|| stored.as_ref().map(|p| p.chapter_index))
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "No chapter index supplied and no stored position for book {book_id}"
                ))
            })?;

        let chapter = Chapter::find(book_id, chapter_index, db)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Chapter {chapter_index} not found for book {book_id}"
                ))
            })?;

        let chapter_percent = clamp_percent(update.chapter_percent);
        let book_percent = update
            .book_percent
            .map(clamp_percent)
            .or_else(|| stored.as_ref().and_then(|p| p.book_percent));

        let span = chapter.end_position - chapter.start_position;
        let position_index =
            chapter.start_position + (span as f64 * chapter_percent / 100.0) as i64;

        let now = Utc::now();
        let position = Self {
            // One position per book: the record shares the book's id.
            id: book_id.to_string(),
            created_at: stored.as_ref().map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
            book_id: book_id.to_string(),
            chapter_index,
            chapter_percent,
            book_percent,
            position_index,
            cfi: update.cfi.or(stored.and_then(|p| p.cfi)),
        };

        db.upsert_item(position.clone()).await?;
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn seed_chapter(db: &SurrealDbClient, book_id: &str, index: i64, start: i64, end: i64) {
        let chapter = Chapter::new(book_id.to_string(), index, None, None, start, end);
        db.store_item(chapter).await.expect("Failed to store chapter");
    }

    #[tokio::test]
    async fn test_position_is_interpolated_across_chapter_span() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        seed_chapter(&db, "b1", 0, 0, 4).await;

        let position = BookPosition::set_for_book(
            "b1",
            PositionUpdate {
                chapter_index: Some(0),
                chapter_percent: 50.0,
                book_percent: Some(10.0),
                cfi: Some("epubcfi(/6/4!/4/2)".to_string()),
            },
            &db,
        )
        .await
        .expect("Failed to set position");

        assert_eq!(position.position_index, 2);
        assert_eq!(position.chapter_index, 0);
    }

    #[tokio::test]
    async fn test_percentages_are_clamped() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        seed_chapter(&db, "b1", 0, 0, 10).await;

        let position = BookPosition::set_for_book(
            "b1",
            PositionUpdate {
                chapter_index: Some(0),
                chapter_percent: 150.0,
                book_percent: Some(-4.0),
                cfi: None,
            },
            &db,
        )
        .await
        .expect("Failed to set position");

        assert_eq!(position.chapter_percent, 100.0);
        assert_eq!(position.book_percent, Some(0.0));
        assert_eq!(position.position_index, 10);
    }

    #[tokio::test]
    async fn test_unreported_book_percent_stays_unset() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        seed_chapter(&db, "b1", 0, 0, 4).await;

        let position = BookPosition::set_for_book(
            "b1",
            PositionUpdate {
                chapter_index: Some(0),
                chapter_percent: 25.0,
                book_percent: None,
                cfi: None,
            },
            &db,
        )
        .await
        .expect("Failed to set position");

        // No report means no progress figure, not a fabricated 0%.
        assert_eq!(position.book_percent, None);
    }

    #[tokio::test]
    async fn test_chapter_index_falls_back_to_stored_position() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        seed_chapter(&db, "b1", 3, 12, 20).await;

        BookPosition::set_for_book(
            "b1",
            PositionUpdate {
                chapter_index: Some(3),
                chapter_percent: 0.0,
                book_percent: Some(30.0),
                cfi: None,
            },
            &db,
        )
        .await
        .expect("Failed to set initial position");

        // No chapter index this time: the stored chapter carries over, as
        // does the previously reported book percentage.
        let updated = BookPosition::set_for_book(
            "b1",
            PositionUpdate {
                chapter_index: None,
                chapter_percent: 100.0,
                book_percent: None,
                cfi: None,
            },
            &db,
        )
        .await
        .expect("Failed to update position");

        assert_eq!(updated.chapter_index, 3);
        assert_eq!(updated.position_index, 20);
        assert_eq!(updated.book_percent, Some(30.0));
    }

    #[tokio::test]
    async fn test_missing_chapter_everywhere_is_a_validation_error() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let result = BookPosition::set_for_book(
            "b1",
            PositionUpdate {
                chapter_index: None,
                chapter_percent: 10.0,
                book_percent: Some(10.0),
                cfi: None,
            },
            &db,
        )
        .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_chapter_is_not_found() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let result = BookPosition::set_for_book(
            "b1",
            PositionUpdate {
                chapter_index: Some(7),
                chapter_percent: 10.0,
                book_percent: Some(10.0),
                cfi: None,
            },
            &db,
        )
        .await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
