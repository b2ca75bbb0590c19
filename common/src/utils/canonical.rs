//! Canonical chapter coordinates.
//!
//! A canonical offset counts only lowercase alphanumerics, so a citation
//! range stays valid even when whitespace or punctuation shifts between
//! text re-extractions.

/// Number of canonical characters in `text`.
pub fn canonical_len(text: &str) -> usize {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .count()
}

/// Lowercased, alnum-only rendition of `text`.
pub fn canonicalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
