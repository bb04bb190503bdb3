//! Session index: build, load, and answer questions.
//!
//! # Build
//!
//! 1. Extract each downloaded document on the blocking pool and delete
//!    its file right after.
//! 2. Split the text into nodes (see [`crate::chunk`]).
//! 3. Embed every node with the request's model.
//! 4. Write the index into a staging directory and commit it over the
//!    session's previous index.
//!
//! # Query
//!
//! The committed index is loaded into memory, nodes are ranked by cosine
//! similarity to the embedded question, and the top `k` are packed into the
//! question-answer prompt for a single completion.

use chrono::Utc;
use uuid::Uuid;

use crate::chunk::{estimate_tokens, split_into_nodes};
use crate::db;
use crate::error::{PipelineError, Result, UpstreamErrorKind};
use crate::extract::extract_text;
use crate::fetch::TempDocument;
use crate::llm::LanguageModel;
use crate::models::{EmbeddedNode, Node, SessionId};
use crate::prompt::{qa_prompt, PromptHelper};
use crate::store::{self, IndexManifest, SessionStorage, StoredDocument};

/// What a completed build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub session_id: String,
    pub documents: usize,
    pub nodes: usize,
    pub embedding_model: String,
}

/// Build the index of `session` from `documents`, replacing any previous one.
///
/// Every document file is deleted by the time this returns, whether the
/// build succeeded or not. On failure the previous index is left as it was.
pub async fn build_index(
    model: &dyn LanguageModel,
    documents: Vec<TempDocument>,
    session: &SessionId,
    storage: &SessionStorage,
    helper: &PromptHelper,
) -> Result<BuildSummary> {
    if documents.is_empty() {
        return Err(PipelineError::invalid_input(
            "at least one document is required to build an index",
        ));
    }

    let mut stored = Vec::with_capacity(documents.len());
    let mut nodes: Vec<Node> = Vec::new();

    for doc in documents {
        let locator = doc.locator().raw().to_string();
        let kind = doc.kind();
        let text = extract_and_discard(doc).await?;

        let document_id = Uuid::new_v4().to_string();
        let doc_nodes: Vec<Node> = split_into_nodes(
            &document_id,
            &text,
            helper.node_size(),
            helper.max_chunk_overlap,
        )
        .into_iter()
        .filter(|n| !n.text.trim().is_empty())
        .collect();

        tracing::debug!(
            document = %locator,
            chars = text.chars().count(),
            nodes = doc_nodes.len(),
            "split document"
        );
        if doc_nodes.is_empty() {
            tracing::warn!(document = %locator, "document has no extractable text");
        }

        stored.push(StoredDocument {
            id: document_id,
            locator,
            kind: kind.extension().to_string(),
            char_count: text.chars().count(),
        });
        nodes.extend(doc_nodes);
    }

    if nodes.is_empty() {
        return Err(PipelineError::ParseFailure {
            document: format!("all {} document(s)", stored.len()),
            reason: "no extractable text".to_string(),
        });
    }

    let texts: Vec<String> = nodes.iter().map(|n| n.text.clone()).collect();
    let vectors = model.embed(&texts).await?;
    if vectors.len() != nodes.len() {
        return Err(PipelineError::upstream(
            UpstreamErrorKind::Rejected,
            format!(
                "expected {} embeddings, got {}",
                nodes.len(),
                vectors.len()
            ),
        ));
    }
    let dims = vectors.first().map(Vec::len).unwrap_or(0);
    if dims == 0 || vectors.iter().any(|v| v.len() != dims) {
        return Err(PipelineError::upstream(
            UpstreamErrorKind::Rejected,
            "embedding vectors are empty or differ in length",
        ));
    }

    let embedded: Vec<EmbeddedNode> = nodes
        .into_iter()
        .zip(vectors)
        .map(|(node, embedding)| EmbeddedNode { node, embedding })
        .collect();

    let manifest = IndexManifest {
        embedding_model: model.embedding_model().to_string(),
        dims,
        built_at: Utc::now(),
        document_count: stored.len(),
        node_count: embedded.len(),
    };

    let staging = storage.stage()?;
    let pool = db::create(&staging.index_path()).await?;
    let written = store::write_index(&pool, &manifest, &stored, &embedded).await;
    pool.close().await;
    written?;
    storage.commit(staging, session)?;

    tracing::info!(
        session = %session,
        documents = manifest.document_count,
        nodes = manifest.node_count,
        dims,
        "index committed"
    );

    Ok(BuildSummary {
        session_id: session.to_string(),
        documents: manifest.document_count,
        nodes: manifest.node_count,
        embedding_model: manifest.embedding_model,
    })
}

/// Extract `doc` off the async runtime; the file is gone once this returns.
pub(crate) async fn extract_and_discard(doc: TempDocument) -> Result<String> {
    let label = doc.locator().url().to_string();
    tokio::task::spawn_blocking(move || {
        let text = extract_text(doc.path(), doc.kind(), &label);
        drop(doc);
        text
    })
    .await
    .map_err(|e| PipelineError::Storage(format!("extraction task failed: {}", e)))?
}

/// A session index held in memory.
#[derive(Debug)]
pub struct VectorIndex {
    manifest: IndexManifest,
    nodes: Vec<EmbeddedNode>,
}

impl VectorIndex {
    /// Load the committed index of `session`.
    pub async fn load(storage: &SessionStorage, session: &SessionId) -> Result<Self> {
        let pool = store::open_session(storage, session).await?;
        let loaded = async {
            let manifest = store::read_manifest(&pool).await?;
            let nodes = store::read_nodes(&pool).await?;
            Ok::<_, PipelineError>(Self { manifest, nodes })
        }
        .await;
        pool.close().await;
        loaded
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The `k` nodes most similar to `query`, best first.
    pub fn top_k(&self, query: &[f32], k: usize) -> Vec<(f32, &EmbeddedNode)> {
        let mut scored: Vec<(f32, &EmbeddedNode)> = self
            .nodes
            .iter()
            .map(|n| (cosine_similarity(query, &n.embedding), n))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Answer `question` from this index with a single completion.
    pub async fn query(
        &self,
        model: &dyn LanguageModel,
        helper: &PromptHelper,
        top_k: usize,
        question: &str,
    ) -> Result<String> {
        if model.embedding_model() != self.manifest.embedding_model {
            tracing::warn!(
                index_model = %self.manifest.embedding_model,
                query_model = %model.embedding_model(),
                "embedding model differs from the one the index was built with"
            );
        }

        let question_vec = model
            .embed(&[question.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                PipelineError::upstream(UpstreamErrorKind::Rejected, "no embedding for question")
            })?;

        let ranked = self.top_k(&question_vec, top_k);
        tracing::debug!(
            candidates = self.nodes.len(),
            selected = ranked.len(),
            best = ranked.first().map(|r| r.0).unwrap_or(0.0),
            "ranked nodes"
        );

        let texts: Vec<&str> = ranked.iter().map(|(_, n)| n.node.text.as_str()).collect();
        let template_tokens = estimate_tokens(&qa_prompt("", question));
        let context = helper.pack(&texts, helper.context_budget(template_tokens));

        let completion = model.complete(&qa_prompt(&context, question)).await?;
        Ok(completion.text.trim().to_string())
    }
}

/// Cosine similarity of two vectors; 0 when lengths differ or either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
