use common::storage::types::chunk::Chunk;

/// Instructions for the answering model. Citations use inline markers of
/// the form `[chunks: id]` (comma-separated when several excerpts support
/// one statement); the consuming surface matches them against the source
/// list, the engine itself never parses the answer text.
pub const SYSTEM_PROMPT: &str = "\
You are a reading companion for someone partway through a book. Answer \
their question using only the excerpts provided below; each excerpt comes \
from text the reader has already read. Do not use outside knowledge of \
the book, do not speculate about what happens later, and never reveal or \
hint at events beyond the provided excerpts.

After each statement that draws on an excerpt, add a citation marker of \
the form [chunks: <id>] using the excerpt's id. Group several supporting \
excerpts in one marker, comma-separated: [chunks: <id>, <id>].

If the excerpts do not contain enough information to answer, say so \
plainly instead of guessing.";

pub fn build_context(chunks: &[Chunk]) -> String {
    let mut context = String::new();
    for chunk in chunks {
        let chapter = chunk.chapter_index + 1;
        context.push_str(&format!(
            "[Chunk {} | Chapter {} | Pos {}]\n{}\n\n",
            chunk.id, chapter, chunk.position_index, chunk.text
        ));
    }
    context
}

pub fn build_user_prompt(question: &str, chunks: &[Chunk]) -> String {
    format!(
        "Excerpts from the book so far:\n\n{}Question: {}",
        build_context(chunks),
        question
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_carries_id_chapter_and_position() {
        let chunk = Chunk::new(
            "b1".to_string(),
            2,
            Some("Three".to_string()),
            None,
            7,
            "Some text.".to_string(),
            None,
            0,
            8,
        );
        let context = build_context(std::slice::from_ref(&chunk));
        assert!(context.contains(&format!("[Chunk {} | Chapter 3 | Pos 7]", chunk.id)));
        assert!(context.contains("Some text."));
    }
}
