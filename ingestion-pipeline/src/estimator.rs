use std::path::Path;

use common::{error::AppError, utils::token_estimate::TokenEstimate};
use tokenizers::Tokenizer;
use tracing::warn;

/// Exact token counts from a HuggingFace tokenizer file. Falls back to
/// the length heuristic if an individual encode call fails, so packing
/// never aborts mid-chapter.
pub struct HfTokenizerEstimator {
    tokenizer: Tokenizer,
}

impl HfTokenizerEstimator {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let tokenizer = Tokenizer::from_file(path.as_ref()).map_err(|err| {
            AppError::Configuration(format!(
                "failed to load tokenizer from {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self { tokenizer })
    }
}

impl TokenEstimate for HfTokenizerEstimator {
    fn estimate(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            Err(err) => {
                warn!(error = %err, "tokenizer encode failed, using length heuristic");
                text.len().div_ceil(4)
            }
        }
    }
}
