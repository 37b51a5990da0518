//! Prompt templates.

pub const DEFAULT_TEMPERATURE: f32 = 0.25;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2048;

const PASSAGE_SEPARATOR: &str = "\n\n---\n\n";

/// Document-grounded answer prompt. `passages` are in similarity order.
pub fn document_answer(passages: &[&str], question: &str) -> String {
    let context = passages.join(PASSAGE_SEPARATOR);
    format!(
        "You are a helpful and precise assistant. Answer the user's question using only \
the document excerpts below. If the excerpts do not contain the answer, say that the \
document does not cover it. Quote figures and names exactly as they appear.\n\
\n\
---\n\
{context}\n\
---\n\
\n\
**User Question:**\n\
{question}\n\
\n\
**Answer:**\n"
    )
}

/// Conversational prompt with no document context.
pub fn general_chat(message: &str) -> String {
    format!(
        "You are a friendly, knowledgeable assistant. Reply conversationally and concisely.\n\
\n\
**User:**\n\
{message}\n\
\n\
**Assistant:**\n"
    )
}
