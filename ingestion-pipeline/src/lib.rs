pub mod chunker;
pub mod estimator;
pub mod pipeline;

pub use chunker::{chunk_chapter, ChunkDraft, ChunkLimits};
pub use pipeline::{ExtractedChapter, ImportOutcome, IngestionPipeline};
