//! Test doubles shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{PipelineError, Result, UpstreamErrorKind};
use crate::extract::DocumentKind;
use crate::fetch::TempDocument;
use crate::llm::{Completion, LanguageModel, ModelProvider};
use crate::models::{ApiKey, DocumentLocator};

const DIMS: usize = 64;

/// Deterministic bag-of-words embedding: each word bumps one of 64 buckets.
pub fn hashed_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
    {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.to_lowercase().bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    v
}

/// Embeds with [`hashed_embedding`] and answers every prompt by echoing it.
#[derive(Default)]
pub struct EchoModel {
    pub completions: AtomicUsize,
    pub embeddings: AtomicUsize,
}

#[async_trait]
impl LanguageModel for EchoModel {
    fn embedding_model(&self) -> &str {
        "hashed-bow"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embeddings.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| hashed_embedding(t)).collect())
    }

    async fn complete(&self, prompt: &str) -> Result<Completion> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: prompt.to_string(),
            raw: serde_json::json!({ "choices": [{ "text": prompt }] }),
        })
    }
}

/// Always fails with the given upstream error kind.
pub struct FailingModel(pub UpstreamErrorKind);

#[async_trait]
impl LanguageModel for FailingModel {
    fn embedding_model(&self) -> &str {
        "failing"
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(PipelineError::upstream(self.0, "embedding refused"))
    }

    async fn complete(&self, _prompt: &str) -> Result<Completion> {
        Err(PipelineError::upstream(self.0, "completion refused"))
    }
}

/// Hands out [`EchoModel`]s that share call counters.
#[derive(Default, Clone)]
pub struct EchoProvider {
    pub model: Arc<EchoModel>,
}

struct SharedEcho(Arc<EchoModel>);

#[async_trait]
impl LanguageModel for SharedEcho {
    fn embedding_model(&self) -> &str {
        self.0.embedding_model()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.0.embed(texts).await
    }

    async fn complete(&self, prompt: &str) -> Result<Completion> {
        self.0.complete(prompt).await
    }
}

impl ModelProvider for EchoProvider {
    fn connect(&self, _api_key: &ApiKey) -> Box<dyn LanguageModel> {
        Box::new(SharedEcho(self.model.clone()))
    }
}

/// A plain-text [`TempDocument`] inside `dir`.
pub fn text_document(dir: &std::path::Path, text: &str) -> TempDocument {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .suffix(".txt")
        .tempfile_in(dir)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
    let locator = DocumentLocator::resolve("//docs.test/doc.txt", "https:").unwrap();
    TempDocument::from_parts(file, DocumentKind::PlainText, locator)
}
