use serde::Deserialize;
use tracing::info;

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{chunk::Chunk, system_settings::SystemSettings},
    },
    utils::canonical::canonical_len,
};

/// Version tag of the canonical-offset scheme. Bump this whenever the
/// offset computation changes; stored rendering tokens are then cleared
/// because they were anchored against the old coordinates.
pub const CITATION_ALGO_VERSION: &str = "3";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub backfilled_chunks: usize,
    pub invalidated_citations: bool,
}

#[derive(Deserialize)]
struct ChapterKey {
    book_id: String,
    chapter_index: i64,
}

/// Startup reconciliation: backfill missing canonical offsets and clear
/// stale rendering tokens after an offset-scheme change. Running it again
/// on an already-consistent store writes nothing.
pub async fn reconcile(db: &SurrealDbClient) -> Result<ReconcileReport, AppError> {
    let mut report = ReconcileReport::default();

    report.backfilled_chunks = backfill_canonical_offsets(db).await?;

    let settings = SystemSettings::ensure_initialized(db).await?;
    if settings.citation_algo_version != CITATION_ALGO_VERSION {
        info!(
            from = %settings.citation_algo_version,
            to = CITATION_ALGO_VERSION,
            "citation scheme changed, clearing stored rendering tokens"
        );
        db.client
            .query("UPDATE chunk SET cfi_range = NONE, updated_at = time::now()")
            .await?;

        let mut settings = settings;
        settings.citation_algo_version = CITATION_ALGO_VERSION.to_string();
        settings.update(db).await?;
        report.invalidated_citations = true;
    }

    if report.backfilled_chunks > 0 || report.invalidated_citations {
        info!(
            backfilled = report.backfilled_chunks,
            invalidated = report.invalidated_citations,
            "reconciliation applied changes"
        );
    }

    Ok(report)
}

/// Recompute canonical offsets for every chapter containing a chunk that
/// lacks them. Offsets are a running total of canonical characters over
/// the chapter's chunks in position order, so the whole chapter has to be
/// walked even when only one chunk is missing.
async fn backfill_canonical_offsets(db: &SurrealDbClient) -> Result<usize, AppError> {
    let keys: Vec<ChapterKey> = db
        .client
        .query(
            "SELECT book_id, chapter_index FROM chunk \
             WHERE canonical_start IS NONE OR canonical_end IS NONE \
             GROUP BY book_id, chapter_index",
        )
        .await?
        .take(0)?;

    let mut backfilled = 0usize;
    for key in keys {
        let chunks = Chunk::get_for_chapter(&key.book_id, key.chapter_index, db).await?;

        let mut offset: i64 = 0;
        for chunk in chunks {
            let start = offset;
            let end = start + canonical_len(&chunk.text) as i64;
            offset = end;

            if chunk.canonical_start == Some(start) && chunk.canonical_end == Some(end) {
                continue;
            }

            db.client
                .query(
                    "UPDATE type::thing('chunk', $id) \
                     SET canonical_start = $start, canonical_end = $end, \
                         updated_at = time::now()",
                )
                .bind(("id", chunk.id.clone()))
                .bind(("start", start))
                .bind(("end", end))
                .await?;
            backfilled += 1;
        }
    }

    Ok(backfilled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    async fn memory_db() -> SurrealDbClient {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    fn chunk_without_offsets(book_id: &str, position: i64, text: &str) -> Chunk {
        let mut chunk = Chunk::new(
            book_id.to_string(),
            0,
            None,
            None,
            position,
            text.to_string(),
            None,
            0,
            0,
        );
        chunk.canonical_start = None;
        chunk.canonical_end = None;
        chunk
    }

    #[tokio::test]
    async fn test_backfill_assigns_running_canonical_offsets() {
        let db = memory_db().await;
        SystemSettings::ensure_initialized(&db)
            .await
            .expect("init settings");

        // "Hello, world!" has 10 canonical characters, "2nd part." has 7.
        db.store_item(chunk_without_offsets("b1", 0, "Hello, world!"))
            .await
            .expect("store");
        db.store_item(chunk_without_offsets("b1", 1, "2nd part."))
            .await
            .expect("store");

        let report = reconcile(&db).await.expect("reconcile failed");
        assert_eq!(report.backfilled_chunks, 2);

        let chunks = Chunk::get_for_chapter("b1", 0, &db).await.expect("load");
        assert_eq!(chunks[0].canonical_start, Some(0));
        assert_eq!(chunks[0].canonical_end, Some(10));
        assert_eq!(chunks[1].canonical_start, Some(10));
        assert_eq!(chunks[1].canonical_end, Some(17));
    }

    #[tokio::test]
    async fn test_backfill_repairs_a_row_missing_only_the_end_offset() {
        let db = memory_db().await;
        SystemSettings::ensure_initialized(&db)
            .await
            .expect("init settings");

        let mut chunk = Chunk::new(
            "b1".to_string(),
            0,
            None,
            None,
            0,
            "Hello, world!".to_string(),
            None,
            0,
            0,
        );
        chunk.canonical_end = None;
        db.store_item(chunk).await.expect("store");

        let report = reconcile(&db).await.expect("reconcile failed");
        assert_eq!(report.backfilled_chunks, 1);

        let chunks = Chunk::get_for_chapter("b1", 0, &db).await.expect("load");
        assert_eq!(chunks[0].canonical_start, Some(0));
        assert_eq!(chunks[0].canonical_end, Some(10));
    }

    #[tokio::test]
    async fn test_version_change_clears_rendering_tokens_exactly_once() {
        let db = memory_db().await;

        // Simulate a store written under an older scheme.
        let mut settings = SystemSettings::ensure_initialized(&db)
            .await
            .expect("init settings");
        settings.citation_algo_version = "2".to_string();
        settings.update(&db).await.expect("update settings");

        let mut chunk = Chunk::new(
            "b1".to_string(),
            0,
            None,
            None,
            0,
            "text".to_string(),
            None,
            0,
            4,
        );
        chunk.cfi_range = Some("epubcfi(/6/4!/4/2)".to_string());
        let chunk_id = chunk.id.clone();
        db.store_item(chunk).await.expect("store");

        let first = reconcile(&db).await.expect("reconcile failed");
        assert!(first.invalidated_citations);

        let fetched: Option<Chunk> = db.get_item(&chunk_id).await.expect("fetch");
        assert!(fetched.and_then(|c| c.cfi_range).is_none());

        // A token written after the migration must survive the next run.
        Chunk::set_cfi_ranges(
            "b1",
            &[(chunk_id.clone(), Some("epubcfi(/6/8!/2)".to_string()))],
            &db,
        )
        .await
        .expect("set cfi");

        let second = reconcile(&db).await.expect("second reconcile failed");
        assert_eq!(
            second,
            ReconcileReport {
                backfilled_chunks: 0,
                invalidated_citations: false
            }
        );

        let fetched: Option<Chunk> = db.get_item(&chunk_id).await.expect("fetch");
        assert!(fetched.and_then(|c| c.cfi_range).is_some());
    }

    #[tokio::test]
    async fn test_rerun_on_consistent_store_is_a_no_op() {
        let db = memory_db().await;
        SystemSettings::ensure_initialized(&db)
            .await
            .expect("init settings");

        db.store_item(chunk_without_offsets("b1", 0, "some text"))
            .await
            .expect("store");

        reconcile(&db).await.expect("first reconcile failed");

        let before = Chunk::get_for_chapter("b1", 0, &db).await.expect("load");
        let updated_before: Vec<chrono::DateTime<Utc>> =
            before.iter().map(|c| c.updated_at).collect();

        let report = reconcile(&db).await.expect("second reconcile failed");
        assert_eq!(report, ReconcileReport::default());

        let after = Chunk::get_for_chapter("b1", 0, &db).await.expect("load");
        let updated_after: Vec<chrono::DateTime<Utc>> =
            after.iter().map(|c| c.updated_at).collect();
        assert_eq!(updated_before, updated_after);
    }
}
