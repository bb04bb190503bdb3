//! Stateless question answering over freshly fetched documents.
//!
//! Nothing is indexed: every document is downloaded, extracted and deleted
//! in turn, the texts are concatenated behind a fixed instruction, and the
//! completion API's response is returned untouched.

use crate::chunk::estimate_tokens;
use crate::config::ContextOverflow;
use crate::error::{PipelineError, Result};
use crate::fetch::DocumentFetcher;
use crate::index::extract_and_discard;
use crate::llm::LanguageModel;
use crate::models::DocumentLocator;
use crate::prompt::{raw_context_prompt, truncate_to_tokens};

const DOCUMENT_SEPARATOR: &str = "\n\n";

pub struct RawQuery<'a> {
    pub fetcher: &'a DocumentFetcher,
    pub model: &'a dyn LanguageModel,
    pub overflow: ContextOverflow,
    /// Tokens the prompt may use: model window minus `max_tokens`.
    pub prompt_budget: usize,
}

impl RawQuery<'_> {
    /// Fetch `locators` in order and ask `question` over their full text.
    ///
    /// Returns the completion API's JSON response as-is.
    pub async fn run(
        &self,
        locators: &[DocumentLocator],
        question: &str,
    ) -> Result<serde_json::Value> {
        let mut context = String::new();
        for locator in locators {
            let doc = self.fetcher.fetch(locator).await?;
            let text = extract_and_discard(doc).await?;
            if !context.is_empty() {
                context.push_str(DOCUMENT_SEPARATOR);
            }
            context.push_str(&text);
        }

        let prompt = self.fit_prompt(question, &context)?;
        tracing::debug!(
            documents = locators.len(),
            prompt_tokens = estimate_tokens(&prompt),
            "submitting raw-context completion"
        );
        let completion = self.model.complete(&prompt).await?;
        Ok(completion.raw)
    }

    fn fit_prompt(&self, question: &str, context: &str) -> Result<String> {
        let prompt = raw_context_prompt(question, context);
        let tokens = estimate_tokens(&prompt);
        if tokens <= self.prompt_budget {
            return Ok(prompt);
        }

        match self.overflow {
            ContextOverflow::Reject => Err(PipelineError::ContextTooLarge {
                tokens,
                limit: self.prompt_budget,
            }),
            ContextOverflow::Truncate => {
                let fixed = estimate_tokens(&raw_context_prompt(question, ""));
                let room = self.prompt_budget.saturating_sub(fixed + 1);
                tracing::warn!(tokens, limit = self.prompt_budget, "truncating raw context");
                Ok(raw_context_prompt(question, truncate_to_tokens(context, room)))
            }
            ContextOverflow::Forward => {
                tracing::warn!(tokens, limit = self.prompt_budget, "forwarding oversized prompt");
                Ok(prompt)
            }
        }
    }
}
