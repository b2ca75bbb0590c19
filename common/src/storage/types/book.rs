use tracing::warn;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Lifecycle of an imported book. Transitions are one-directional:
/// `processing -> ready` or `processing -> failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Processing,
    Ready,
    Failed,
}

stored_object!(Book, "book", {
    title: String,
    author: String,
    total_chunks: i64,
    status: ProcessingStatus,
    cover_path: Option<String>,
    epub_path: Option<String>
});

impl Book {
    pub fn new(title: String, author: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            title,
            author,
            total_chunks: 0,
            status: ProcessingStatus::Processing,
            cover_path: None,
            epub_path: None,
        }
    }

    pub async fn require(book_id: &str, db: &SurrealDbClient) -> Result<Self, AppError> {
        db.get_item::<Self>(book_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book {book_id} not found")))
    }

    /// Finalize a successful import. Guarded so a book that already left
    /// `processing` is never rewound.
    pub async fn mark_ready(
        book_id: &str,
        title: &str,
        author: &str,
        total_chunks: i64,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('book', $id) \
                 SET title = $title, author = $author, total_chunks = $total_chunks, \
                     status = 'ready', updated_at = time::now() \
                 WHERE status = 'processing'",
            )
            .bind(("id", book_id.to_string()))
            .bind(("title", title.to_string()))
            .bind(("author", author.to_string()))
            .bind(("total_chunks", total_chunks))
            .await?;
        Ok(())
    }

    /// Mark a failed import, preserving whatever metadata was written so
    /// the partial state stays inspectable.
    pub async fn mark_failed(book_id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('book', $id) \
                 SET status = 'failed', updated_at = time::now() \
                 WHERE status = 'processing'",
            )
            .bind(("id", book_id.to_string()))
            .await?;
        Ok(())
    }

    pub async fn list(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let books: Vec<Self> = db
            .client
            .query("SELECT * FROM book ORDER BY created_at DESC")
            .await?
            .take(0)?;
        Ok(books)
    }

    /// Remove a book and everything it transitively owns. Vector entries
    /// are removed best-effort; the relational rows always go.
    pub async fn delete_with_children(book_id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        Self::require(book_id, db).await?;

        db.client
            .query(
                "DELETE conversation WHERE book_id = $book_id;
                 DELETE bookmark WHERE book_id = $book_id;
                 DELETE chapter WHERE book_id = $book_id;
                 DELETE chunk WHERE book_id = $book_id;",
            )
            .bind(("book_id", book_id.to_string()))
            .await?;

        if let Err(err) = db
            .client
            .query("DELETE chunk_embedding WHERE book_id = $book_id")
            .bind(("book_id", book_id.to_string()))
            .await
        {
            warn!(%book_id, error = %err, "failed to delete vector entries for book");
        }

        // The reading position shares the book's id.
        db.client
            .query("DELETE type::thing('book_position', $id)")
            .bind(("id", book_id.to_string()))
            .await?;

        db.delete_item::<Self>(book_id).await?;
        Ok(())
    }
}
