//! Prompt templates and token budgeting.
//!
//! [`PromptHelper`] keeps every prompt within the model window: the window
//! (`max_input_size`) minus the tokens reserved for the answer
//! (`num_outputs`) minus the template itself is what remains for context.

use crate::chunk::{estimate_tokens, CHARS_PER_TOKEN};
use crate::config::ChunkingConfig;

const QA_TEMPLATE: &str = "Context information is below.\n\
---------------------\n\
{context}\n\
---------------------\n\
Given the context information and not prior knowledge, answer the question: {question}\n";

const RAW_INSTRUCTION: &str = "Only use the context given after the word 'CONTEXT:' to answer the question in the text before this sentence.: ";

/// Question-answering prompt over retrieved nodes.
pub fn qa_prompt(context: &str, question: &str) -> String {
    QA_TEMPLATE
        .replace("{context}", context)
        .replace("{question}", question)
}

/// Prompt for the raw-context path: the question, a fixed instruction,
/// then every extracted document verbatim.
pub fn raw_context_prompt(question: &str, context: &str) -> String {
    format!("{}{}CONTEXT: {}", question, RAW_INSTRUCTION, context)
}

#[derive(Debug, Clone)]
pub struct PromptHelper {
    pub max_input_size: usize,
    pub num_outputs: usize,
    pub max_chunk_overlap: usize,
    pub chunk_size_limit: usize,
}

impl PromptHelper {
    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self {
            max_input_size: config.max_input_size,
            num_outputs: config.num_outputs,
            max_chunk_overlap: config.max_chunk_overlap,
            chunk_size_limit: config.chunk_size_limit,
        }
    }

    /// Size of an indexed node: the configured limit, never larger than
    /// what fits in a prompt next to the answer.
    pub fn node_size(&self) -> usize {
        self.chunk_size_limit
            .min(self.max_input_size.saturating_sub(self.num_outputs))
            .max(1)
    }

    /// Tokens a prompt may use when `reserved_output` tokens are kept for
    /// the answer.
    pub fn prompt_budget(&self, reserved_output: usize) -> usize {
        self.max_input_size.saturating_sub(reserved_output)
    }

    /// Tokens left for context once `template_tokens` are spent.
    pub fn context_budget(&self, template_tokens: usize) -> usize {
        self.prompt_budget(self.num_outputs)
            .saturating_sub(template_tokens)
    }

    /// Join ranked `texts` into one context block no larger than
    /// `budget_tokens`. Texts are taken in order; the first one that does
    /// not fit is cut short and the rest are dropped.
    pub fn pack(&self, texts: &[&str], budget_tokens: usize) -> String {
        let separator = "\n\n";
        let mut out = String::new();
        let mut used = 0usize;

        for text in texts {
            let sep_tokens = if out.is_empty() {
                0
            } else {
                estimate_tokens(separator)
            };
            let needed = sep_tokens + estimate_tokens(text);
            if used + needed <= budget_tokens {
                if !out.is_empty() {
                    out.push_str(separator);
                }
                out.push_str(text);
                used += needed;
                continue;
            }

            let room = budget_tokens.saturating_sub(used + sep_tokens);
            let cut = truncate_to_tokens(text, room);
            if !cut.is_empty() {
                if !out.is_empty() {
                    out.push_str(separator);
                }
                out.push_str(cut);
            }
            break;
        }
        out
    }
}

/// Longest prefix of `text` estimated at no more than `tokens` tokens.
pub fn truncate_to_tokens(text: &str, tokens: usize) -> &str {
    let max_chars = tokens * CHARS_PER_TOKEN;
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}
