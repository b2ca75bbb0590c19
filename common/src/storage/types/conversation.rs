use uuid::Uuid;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::chunk::Chunk},
    stored_object,
};

/// Longest excerpt of a cited chunk carried in a conversation record.
pub const SNIPPET_MAX_CHARS: usize = 280;

/// Everything a reading surface needs to highlight a citation, in both
/// coordinate systems: the opaque rendering token when one exists, and
/// the reflow-stable canonical character range always.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub chapter_index: i64,
    pub chapter_title: Option<String>,
    pub position_index: i64,
    pub spine_href: Option<String>,
    pub canonical_start: Option<i64>,
    pub canonical_end: Option<i64>,
    pub cfi_range: Option<String>,
    pub anchor_text: Option<String>,
    pub snippet: String,
}

impl SourceRef {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            chapter_index: chunk.chapter_index,
            chapter_title: chunk.chapter_title.clone(),
            position_index: chunk.position_index,
            spine_href: chunk.spine_href.clone(),
            canonical_start: chunk.canonical_start,
            canonical_end: chunk.canonical_end,
            cfi_range: chunk.cfi_range.clone(),
            anchor_text: chunk.anchor_text.clone(),
            snippet: chunk.snippet(SNIPPET_MAX_CHARS),
        }
    }
}

stored_object!(Conversation, "conversation", {
    book_id: String,
    question: String,
    answer: String,
    model: String,
    /// Spoiler ceiling that was in force when the question was asked.
    position_index: i64,
    ask_cfi: Option<String>,
    ask_chapter_index: Option<i64>,
    ask_chapter_percent: Option<f64>,
    ask_book_percent: Option<f64>,
    sources: Vec<SourceRef>
});

impl Conversation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        book_id: String,
        question: String,
        answer: String,
        model: String,
        position_index: i64,
        ask_cfi: Option<String>,
        ask_chapter_index: Option<i64>,
        ask_chapter_percent: Option<f64>,
        ask_book_percent: Option<f64>,
        sources: Vec<SourceRef>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            book_id,
            question,
            answer,
            model,
            position_index,
            ask_cfi,
            ask_chapter_index,
            ask_chapter_percent,
            ask_book_percent,
            sources,
        }
    }

    /// Question history for a book, oldest first. The log is append-only;
    /// nothing edits a recorded exchange.
    pub async fn list_for_book(
        book_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let conversations: Vec<Self> = db
            .client
            .query("SELECT * FROM conversation WHERE book_id = $book_id ORDER BY created_at ASC")
            .bind(("book_id", book_id.to_string()))
            .await?
            .take(0)?;
        Ok(conversations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_ref_snippet_is_bounded() {
        let long_text = "a".repeat(1000);
        let chunk = Chunk::new(
            "b1".to_string(),
            0,
            None,
            None,
            0,
            long_text,
            None,
            0,
            1000,
        );
        let source = SourceRef::from_chunk(&chunk);
        assert_eq!(source.snippet.chars().count(), SNIPPET_MAX_CHARS);
    }

    #[tokio::test]
    async fn test_history_comes_back_oldest_first() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        for (offset, question) in ["first", "second", "third"].iter().enumerate() {
            let mut conversation = Conversation::new(
                "b1".to_string(),
                question.to_string(),
                "answer".to_string(),
                "test-model".to_string(),
                0,
                None,
                None,
                None,
                None,
                Vec::new(),
            );
            conversation.created_at = Utc::now() + chrono::Duration::seconds(offset as i64);
            conversation.updated_at = conversation.created_at;
            db.store_item(conversation)
                .await
                .expect("Failed to store conversation");
        }

        let history = Conversation::list_for_book("b1", &db)
            .await
            .expect("Failed to list conversations");
        let questions: Vec<&str> = history.iter().map(|c| c.question.as_str()).collect();
        assert_eq!(questions, vec!["first", "second", "third"]);
    }
}
