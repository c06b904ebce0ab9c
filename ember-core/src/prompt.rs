//! Prompt composition
//!
//! Rewrites the content of the last message to carry retrieved context or
//! personalization instructions. The rewrite always starts from the caller's
//! messages, so composing twice yields the same result.

use crate::request::{ChatMessage, Instructions};
use crate::retrieval::RetrievedPassage;

/// Emitted by the model when the context does not contain the answer
pub const NO_ANSWER_SENTINEL: &str = "ERROR";

const PASSAGE_SEPARATOR: &str = "\n\n";

/// Compose the messages sent to the model.
///
/// Retrieved passages take precedence over instructions. Blank instructions count
/// as absent. With neither, messages pass through unchanged.
pub fn compose(
    messages: &[ChatMessage],
    retrieved: Option<&[RetrievedPassage]>,
    instructions: Option<&Instructions>,
) -> Vec<ChatMessage> {
    let mut composed = messages.to_vec();
    let Some(last) = composed.last_mut() else {
        return composed;
    };

    if let Some(passages) = retrieved {
        last.content = retrieval_prompt(passages, &last.content);
    } else if let Some(instructions) = instructions.filter(|i| !i.is_blank()) {
        last.content = personalized_prompt(instructions, &last.content);
    }
    composed
}

fn retrieval_prompt(passages: &[RetrievedPassage], question: &str) -> String {
    let context = passages
        .iter()
        .map(|p| p.content.as_str())
        .collect::<Vec<_>>()
        .join(PASSAGE_SEPARATOR);

    format!(
        "Use the following context, delimited by triple backticks, to answer the question.\n\
         ```\n{context}\n```\n\
         Question: {question}\n\
         Answer only from the context above. If the answer cannot be derived from the \
         context, respond with exactly \"{NO_ANSWER_SENTINEL}\" and nothing else."
    )
}

fn personalized_prompt(instructions: &Instructions, question: &str) -> String {
    let context = non_blank(&instructions.personalization, "No additional context about the user.");
    let response = non_blank(&instructions.response, "A clear, direct answer.");

    format!(
        "# CONTEXT #\n{context}\n\n\
         # OBJECTIVE #\nAnswer the following question: {question}\n\n\
         # STYLE #\nFollow the preferences described in the context.\n\n\
         # TONE #\nHelpful and respectful.\n\n\
         # AUDIENCE #\nThe user described in the context.\n\n\
         # RESPONSE #\n{response}"
    )
}

fn non_blank<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let value = value.trim();
    if value.is_empty() {
        fallback
    } else {
        value
    }
}
