use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Bookmark, "bookmark", {
    book_id: String,
    cfi: String,
    chapter_index: Option<i64>,
    chapter_percent: Option<f64>,
    book_percent: Option<f64>,
    label: Option<String>
});

fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

impl Bookmark {
    pub fn new(
        book_id: String,
        cfi: String,
        chapter_index: Option<i64>,
        chapter_percent: Option<f64>,
        book_percent: Option<f64>,
        label: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            book_id,
            cfi,
            chapter_index,
            chapter_percent: chapter_percent.map(clamp_percent),
            book_percent: book_percent.map(clamp_percent),
            label,
        }
    }

    /// Toggle semantics: bookmarking the same location twice removes it.
    /// Returns the bookmark when one was created, `None` when removed.
    pub async fn toggle(
        book_id: &str,
        cfi: &str,
        chapter_index: Option<i64>,
        chapter_percent: Option<f64>,
        book_percent: Option<f64>,
        label: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let existing: Option<Self> = db
            .client
            .query("SELECT * FROM bookmark WHERE book_id = $book_id AND cfi = $cfi LIMIT 1")
            .bind(("book_id", book_id.to_string()))
            .bind(("cfi", cfi.to_string()))
            .await?
            .take(0)?;

        if let Some(existing) = existing {
            db.delete_item::<Self>(&existing.id).await?;
            return Ok(None);
        }

        let bookmark = Self::new(
            book_id.to_string(),
            cfi.to_string(),
            chapter_index,
            chapter_percent,
            book_percent,
            label,
        );
        db.store_item(bookmark.clone()).await?;
        Ok(Some(bookmark))
    }

    pub async fn list_for_book(
        book_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let bookmarks: Vec<Self> = db
            .client
            .query("SELECT * FROM bookmark WHERE book_id = $book_id ORDER BY book_percent ASC")
            .bind(("book_id", book_id.to_string()))
            .await?
            .take(0)?;
        Ok(bookmarks)
    }

    pub async fn delete(bookmark_id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        db.delete_item::<Self>(bookmark_id).await?;
        Ok(())
    }
}
