use common::{error::AppError, storage::db::SurrealDbClient};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct NearestChunk {
    pub chunk_id: String,
    pub distance: f32,
}

/// KNN over the chunk-embedding table, bounded to one book and to
/// positions at or before `max_position`. The bound lives inside the
/// query, so chunks past the reader are structurally unreachable rather
/// than filtered afterwards.
pub async fn find_nearest_chunks(
    db: &SurrealDbClient,
    book_id: &str,
    max_position: i64,
    embedding: Vec<f32>,
    take: usize,
) -> Result<Vec<NearestChunk>, AppError> {
    let query = format!(
        "SELECT chunk_id, vector::distance::knn() AS distance FROM chunk_embedding \
         WHERE book_id = $book_id AND position_index <= $max_position \
         AND embedding <|{take},40|> $embedding \
         ORDER BY distance ASC"
    );

    let rows: Vec<NearestChunk> = db
        .client
        .query(query)
        .bind(("book_id", book_id.to_string()))
        .bind(("max_position", max_position))
        .bind(("embedding", embedding))
        .await
        .map_err(|err| AppError::RetrievalUnavailable(err.to_string()))?
        .take(0)
        .map_err(|err| AppError::RetrievalUnavailable(err.to_string()))?;

    Ok(rows)
}
