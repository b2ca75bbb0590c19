//! Pluggable token estimation.
//!
//! Chunk packing and embedding batching both reason about provider token
//! budgets. An exact tokenizer is used when one is configured; the
//! length/4 heuristic is the fallback. Packing decisions must hold
//! structurally (approximate soft targets) under either estimator.

/// Capability seam for estimating provider token counts.
pub trait TokenEstimate: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// The classic characters/4 approximation. Rounds up so non-empty text
/// never estimates to zero tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimate for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_rounds_up() {
        let estimator = HeuristicEstimator;
        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(estimator.estimate("abc"), 1);
        assert_eq!(estimator.estimate("abcd"), 1);
        assert_eq!(estimator.estimate("abcde"), 2);
    }
}
