use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Chapter, "chapter", {
    book_id: String,
    chapter_index: i64,
    title: Option<String>,
    spine_href: Option<String>,
    /// First book-global chunk position inside this chapter.
    start_position: i64,
    /// Last book-global chunk position inside this chapter (inclusive).
    end_position: i64
});

impl Chapter {
    pub fn new(
        book_id: String,
        chapter_index: i64,
        title: Option<String>,
        spine_href: Option<String>,
        start_position: i64,
        end_position: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            book_id,
            chapter_index,
            title,
            spine_href,
            start_position,
            end_position,
        }
    }

    pub async fn get_for_book(
        book_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let chapters: Vec<Self> = db
            .client
            .query("SELECT * FROM chapter WHERE book_id = $book_id ORDER BY chapter_index")
            .bind(("book_id", book_id.to_string()))
            .await?
            .take(0)?;
        Ok(chapters)
    }

    pub async fn find(
        book_id: &str,
        chapter_index: i64,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let chapter: Option<Self> = db
            .client
            .query(
                "SELECT * FROM chapter \
                 WHERE book_id = $book_id AND chapter_index = $chapter_index \
                 LIMIT 1",
            )
            .bind(("book_id", book_id.to_string()))
            .bind(("chapter_index", chapter_index))
            .await?
            .take(0)?;
        Ok(chapter)
    }
}
