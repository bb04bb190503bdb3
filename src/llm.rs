//! Language model abstraction and the OpenAI-compatible client.
//!
//! [`LanguageModel`] is the seam between the pipeline and the hosted model:
//! the index builder needs embeddings, the query paths need completions.
//! A [`ModelProvider`] turns a per-request [`ApiKey`] into a connected model,
//! so the credential travels with the request and is never stored globally.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - Network errors → retry
//! - HTTP 401/403 → fail immediately as an auth error
//! - Other HTTP 4xx → fail immediately
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::chunk::estimate_tokens;
use crate::config::LlmConfig;
use crate::error::{PipelineError, Result, UpstreamErrorKind};
use crate::models::ApiKey;

/// A single completion: the generated text plus the untouched API response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Identifier of the embedding model, recorded in persisted indexes.
    fn embedding_model(&self) -> &str;

    /// Embed each text, returning vectors in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Run one completion for `prompt`.
    async fn complete(&self, prompt: &str) -> Result<Completion>;
}

/// Creates a [`LanguageModel`] bound to one request's credential.
pub trait ModelProvider: Send + Sync {
    fn connect(&self, api_key: &ApiKey) -> Box<dyn LanguageModel>;
}

/// Provider for OpenAI's API or any server speaking the same
/// `/completions` and `/embeddings` protocol.
pub struct OpenAiProvider {
    http: reqwest::Client,
    config: LlmConfig,
    context_limit: usize,
}

impl OpenAiProvider {
    /// `context_limit` is the model window in tokens; it sizes
    /// `context_too_large` errors when the API rejects a prompt.
    pub fn new(config: &LlmConfig, context_limit: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Storage(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config: config.clone(),
            context_limit,
        })
    }
}

impl ModelProvider for OpenAiProvider {
    fn connect(&self, api_key: &ApiKey) -> Box<dyn LanguageModel> {
        Box::new(OpenAiClient {
            http: self.http.clone(),
            config: self.config.clone(),
            context_limit: self.context_limit,
            api_key: api_key.clone(),
        })
    }
}

pub struct OpenAiClient {
    http: reqwest::Client,
    config: LlmConfig,
    context_limit: usize,
    api_key: ApiKey,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f32,
    max_tokens: usize,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

impl OpenAiClient {
    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// POST `body` to `path` with retry/backoff and return the JSON reply.
    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        prompt_tokens: usize,
    ) -> Result<serde_json::Value> {
        let url = self.endpoint(path);
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(&url)
                .bearer_auth(self.api_key.expose())
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json().await.map_err(|e| {
                            PipelineError::upstream(
                                UpstreamErrorKind::Rejected,
                                format!("invalid JSON from {}: {}", path, e),
                            )
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = classify_failure(
                        status.as_u16(),
                        &body_text,
                        prompt_tokens,
                        self.context_limit,
                    );
                    if err.is_retryable() {
                        tracing::warn!(%url, %status, attempt, "model API error, will retry");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    tracing::warn!(%url, attempt, error = %e, "model API unreachable, will retry");
                    last_err = Some(PipelineError::upstream(
                        UpstreamErrorKind::Unavailable,
                        e.to_string(),
                    ));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            PipelineError::upstream(UpstreamErrorKind::Unavailable, "request failed after retries")
        }))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: texts,
        };
        let json = self.post_json("embeddings", &body, 0).await?;
        let vectors = parse_embedding_response(&json)?;
        if vectors.len() != texts.len() {
            return Err(PipelineError::upstream(
                UpstreamErrorKind::Rejected,
                format!(
                    "embedding API returned {} vectors for {} inputs",
                    vectors.len(),
                    texts.len()
                ),
            ));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    fn embedding_model(&self) -> &str {
        &self.config.embedding_model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.embedding_batch_size.max(1)) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }

    async fn complete(&self, prompt: &str) -> Result<Completion> {
        let body = CompletionRequest {
            model: &self.config.completion_model,
            prompt,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            top_p: self.config.top_p,
            frequency_penalty: self.config.frequency_penalty,
            presence_penalty: self.config.presence_penalty,
        };
        let raw = self
            .post_json("completions", &body, estimate_tokens(prompt))
            .await?;
        let text = raw
            .pointer("/choices/0/text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                PipelineError::upstream(
                    UpstreamErrorKind::Rejected,
                    "completion response has no choices[0].text",
                )
            })?
            .trim()
            .to_string();
        Ok(Completion { text, raw })
    }
}

/// Map a non-2xx model API response to a pipeline error.
fn classify_failure(
    status: u16,
    body: &str,
    prompt_tokens: usize,
    context_limit: usize,
) -> PipelineError {
    if body.contains("context_length_exceeded") || body.contains("maximum context length") {
        return PipelineError::ContextTooLarge {
            tokens: prompt_tokens,
            limit: context_limit,
        };
    }
    let kind = match status {
        401 | 403 => UpstreamErrorKind::Auth,
        429 => UpstreamErrorKind::RateLimited,
        s if s >= 500 => UpstreamErrorKind::Unavailable,
        _ => UpstreamErrorKind::Rejected,
    };
    PipelineError::upstream(kind, format!("HTTP {}: {}", status, body))
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let invalid = |what: &str| {
        PipelineError::upstream(
            UpstreamErrorKind::Rejected,
            format!("invalid embedding response: {}", what),
        )
    };

    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| invalid("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vector = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| invalid("missing embedding"))?
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| invalid("non-numeric embedding value"))
            })
            .collect::<Result<Vec<f32>>>()?;
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
