use tracing::warn;

use crate::{storage::db::SurrealDbClient, stored_object};

stored_object!(ChunkEmbedding, "chunk_embedding", {
    chunk_id: String,
    book_id: String,
    /// Duplicated from the chunk so the spoiler boundary can be applied
    /// inside the vector query itself.
    position_index: i64,
    embedding: Vec<f32>
});

impl ChunkEmbedding {
    pub fn new(chunk_id: String, book_id: String, position_index: i64, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            // Sharing the chunk's id keeps the mapping 1:1 and makes
            // re-ingestion overwrite instead of accumulate.
            id: chunk_id.clone(),
            created_at: now,
            updated_at: now,
            chunk_id,
            book_id,
            position_index,
            embedding,
        }
    }

    /// Vector entries are an acceleration structure, not source of truth.
    /// Failures are logged and swallowed so ingestion can still finish.
    pub async fn store_best_effort(self, db: &SurrealDbClient) {
        let chunk_id = self.chunk_id.clone();
        if let Err(err) = db.upsert_item(self).await {
            warn!(%chunk_id, error = %err, "failed to store vector entry for chunk");
        }
    }
}
