use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            book::Book, chapter::Chapter, chunk::Chunk, chunk_embedding::ChunkEmbedding,
        },
    },
    utils::{embedding::EmbeddingGateway, token_estimate::TokenEstimate},
};
use tracing::{error, info};

use crate::chunker::{chunk_chapter, ChunkLimits};

/// One chapter's worth of extracted plain text, HTML already stripped by
/// the extraction layer.
#[derive(Debug, Clone)]
pub struct ExtractedChapter {
    pub title: Option<String>,
    pub spine_href: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub book_id: String,
    pub total_chunks: i64,
    pub chapter_count: usize,
}

/// Sequential per-book import: chunk every chapter, persist the rows,
/// embed everything, then flip the book to ready. Position indexes are
/// assigned at chunking time, before any embedding happens.
pub struct IngestionPipeline {
    db: SurrealDbClient,
    gateway: EmbeddingGateway,
    estimator: Arc<dyn TokenEstimate>,
    limits: ChunkLimits,
}

impl IngestionPipeline {
    pub fn new(
        db: SurrealDbClient,
        gateway: EmbeddingGateway,
        estimator: Arc<dyn TokenEstimate>,
    ) -> Self {
        Self {
            db,
            gateway,
            estimator,
            limits: ChunkLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ChunkLimits) -> Self {
        self.limits = limits;
        self
    }

    pub async fn import_book(
        &self,
        title: &str,
        author: &str,
        chapters: Vec<ExtractedChapter>,
    ) -> Result<ImportOutcome, AppError> {
        let book = Book::new(title.to_string(), author.to_string());
        let book_id = book.id.clone();
        self.db.store_item(book).await?;

        match self.ingest_chapters(&book_id, chapters).await {
            Ok(outcome) => {
                Book::mark_ready(&book_id, title, author, outcome.total_chunks, &self.db)
                    .await?;
                info!(
                    %book_id,
                    chunks = outcome.total_chunks,
                    chapters = outcome.chapter_count,
                    "book import finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                error!(%book_id, error = %err, "book import failed");
                // Rows written so far are kept for diagnostics.
                Book::mark_failed(&book_id, &self.db).await?;
                Err(err)
            }
        }
    }

    async fn ingest_chapters(
        &self,
        book_id: &str,
        chapters: Vec<ExtractedChapter>,
    ) -> Result<ImportOutcome, AppError> {
        let chapter_count = chapters.len();
        let mut position: i64 = 0;
        let mut stored_chunks: Vec<Chunk> = Vec::new();

        for (index, extracted) in chapters.into_iter().enumerate() {
            let chapter_index = index as i64;
            let (drafts, next_position) = chunk_chapter(
                &extracted.text,
                position,
                self.estimator.as_ref(),
                &self.limits,
            );

            let end_position = if drafts.is_empty() {
                position
            } else {
                next_position - 1
            };
            let chapter = Chapter::new(
                book_id.to_string(),
                chapter_index,
                extracted.title.clone(),
                extracted.spine_href.clone(),
                position,
                end_position,
            );
            self.db.store_item(chapter).await?;

            for draft in drafts {
                let chunk = Chunk::new(
                    book_id.to_string(),
                    chapter_index,
                    extracted.title.clone(),
                    extracted.spine_href.clone(),
                    draft.position_index,
                    draft.text,
                    Some(draft.anchor_text),
                    draft.canonical_start,
                    draft.canonical_end,
                );
                self.db.store_item(chunk.clone()).await?;
                stored_chunks.push(chunk);
            }

            position = next_position;
        }

        // Whole-batch embedding failure fails the import; the chunk rows
        // above stay queryable for diagnostics.
        let texts: Vec<String> = stored_chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.gateway.embed_texts(&texts).await?;

        for (chunk, embedding) in stored_chunks.iter().zip(vectors) {
            ChunkEmbedding::new(
                chunk.id.clone(),
                book_id.to_string(),
                chunk.position_index,
                embedding,
            )
            .store_best_effort(&self.db)
            .await;
        }

        Ok(ImportOutcome {
            book_id: book_id.to_string(),
            total_chunks: stored_chunks.len() as i64,
            chapter_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::book::ProcessingStatus;
    use common::utils::embedding::hashed_gateway;
    use common::utils::token_estimate::HeuristicEstimator;
    use uuid::Uuid;

    async fn memory_db() -> SurrealDbClient {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized(8)
            .await
            .expect("Failed to initialize schema");
        db
    }

    fn one_chunk_per_paragraph_pipeline(db: SurrealDbClient) -> IngestionPipeline {
        // A soft target of 1 forces every paragraph into its own chunk.
        let limits = ChunkLimits {
            soft_target: 1,
            paragraph_ceiling: 10_000,
            whitespace_lookback: 80,
            anchor_chars: 120,
        };
        IngestionPipeline::new(
            db,
            hashed_gateway(8).expect("hashed gateway"),
            Arc::new(HeuristicEstimator),
        )
        .with_limits(limits)
    }

    fn chapter(title: &str, paragraphs: &[&str]) -> ExtractedChapter {
        ExtractedChapter {
            title: Some(title.to_string()),
            spine_href: Some(format!("{}.xhtml", title.to_lowercase())),
            text: paragraphs.join("\n\n"),
        }
    }

    #[tokio::test]
    async fn test_chapter_ranges_are_contiguous_across_the_book() {
        let db = memory_db().await;
        let pipeline = one_chunk_per_paragraph_pipeline(db.clone());

        let outcome = pipeline
            .import_book(
                "Two Chapters",
                "Anon",
                vec![
                    chapter("One", &["first paragraph", "second paragraph", "third one"]),
                    chapter("Two", &["fourth paragraph", "fifth paragraph"]),
                ],
            )
            .await
            .expect("import failed");

        assert_eq!(outcome.total_chunks, 5);
        assert_eq!(outcome.chapter_count, 2);

        let chapters = Chapter::get_for_book(&outcome.book_id, &db)
            .await
            .expect("Failed to list chapters");
        assert_eq!(chapters[0].start_position, 0);
        assert_eq!(chapters[0].end_position, 2);
        assert_eq!(chapters[1].start_position, 3);
        assert_eq!(chapters[1].end_position, 4);

        let book = Book::require(&outcome.book_id, &db).await.expect("book");
        assert_eq!(book.status, ProcessingStatus::Ready);
        assert_eq!(book.total_chunks, 5);
    }

    #[tokio::test]
    async fn test_position_indexes_are_gapless_across_chapters() {
        let db = memory_db().await;
        let pipeline = one_chunk_per_paragraph_pipeline(db.clone());

        let outcome = pipeline
            .import_book(
                "Gapless",
                "Anon",
                vec![
                    chapter("One", &["a b c", "d e f"]),
                    chapter("Two", &["g h i"]),
                    chapter("Three", &["j k l", "m n o"]),
                ],
            )
            .await
            .expect("import failed");

        let mut positions = Vec::new();
        for chapter_index in 0..3 {
            let chunks = Chunk::get_for_chapter(&outcome.book_id, chapter_index, &db)
                .await
                .expect("Failed to load chunks");
            positions.extend(chunks.iter().map(|c| c.position_index));
        }

        let expected: Vec<i64> = (0..outcome.total_chunks).collect();
        assert_eq!(positions, expected);
    }

    #[tokio::test]
    async fn test_every_chunk_gets_a_vector_entry() {
        let db = memory_db().await;
        let pipeline = one_chunk_per_paragraph_pipeline(db.clone());

        let outcome = pipeline
            .import_book(
                "Vectors",
                "Anon",
                vec![chapter("One", &["alpha beta", "gamma delta"])],
            )
            .await
            .expect("import failed");

        let chunks = Chunk::get_for_chapter(&outcome.book_id, 0, &db)
            .await
            .expect("Failed to load chunks");
        for chunk in &chunks {
            let entry: Option<ChunkEmbedding> =
                db.get_item(&chunk.id).await.expect("Failed to fetch entry");
            let entry = entry.expect("missing vector entry");
            assert_eq!(entry.book_id, outcome.book_id);
            assert_eq!(entry.position_index, chunk.position_index);
        }
    }

    #[tokio::test]
    async fn test_empty_chapter_keeps_ranges_monotone() {
        let db = memory_db().await;
        let pipeline = one_chunk_per_paragraph_pipeline(db.clone());

        let outcome = pipeline
            .import_book(
                "With Empty",
                "Anon",
                vec![
                    chapter("One", &["only paragraph"]),
                    ExtractedChapter {
                        title: Some("Blank".to_string()),
                        spine_href: None,
                        text: "   \n\n  ".to_string(),
                    },
                    chapter("Three", &["closing paragraph"]),
                ],
            )
            .await
            .expect("import failed");

        let chapters = Chapter::get_for_book(&outcome.book_id, &db)
            .await
            .expect("Failed to list chapters");
        assert_eq!(chapters[0].start_position, 0);
        assert_eq!(chapters[0].end_position, 0);
        assert_eq!(chapters[1].start_position, 1);
        assert_eq!(chapters[1].end_position, 1);
        assert_eq!(chapters[2].start_position, 1);
        assert_eq!(chapters[2].end_position, 1);
    }
}
