//! Chat-completion prompt construction.

use serde::{Deserialize, Serialize};

use crate::context::AssembledContext;

pub const SYSTEM_INSTRUCTIONS: &str = "\
You are a knowledge assistant answering questions about internal documentation.

Rules:
1. Answer ONLY from the numbered context sources in the user message.
2. Cite every statement with the source marker it came from, e.g. [1] or [2][3].
3. Never invent markers that are not listed in the context sources.
4. If the sources do not contain the answer, say: \"I don't have enough information in the provided documentation to answer that question.\"
5. Be concise. Use markdown lists or code blocks when they help.";

/// One chat message in OpenAI wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// System instructions, then history turns, then the sources and question.
pub fn build_messages(question: &str, ctx: &AssembledContext) -> Vec<PromptMessage> {
    let mut messages = Vec::with_capacity(ctx.history.len() + 2);
    messages.push(PromptMessage::new("system", SYSTEM_INSTRUCTIONS));
    for turn in &ctx.history {
        messages.push(PromptMessage::new(turn.role.as_str(), turn.text.clone()));
    }

    let sources = if ctx.is_empty() {
        "(no matching sources)\n\n".to_string()
    } else {
        ctx.render()
    };
    messages.push(PromptMessage::new(
        "user",
        format!(
            "CONTEXT SOURCES:\n\n{}---\n\nUSER QUESTION:\n{}",
            sources,
            question.trim()
        ),
    ));
    messages
}
