//! Request-level operations shared by the HTTP handlers.
//!
//! Each operation validates its raw parameters before touching the network,
//! connects a model with the request's own API key, and takes the session
//! lock it needs for its whole duration.

use std::sync::Arc;

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::fetch::DocumentFetcher;
use crate::index::{build_index, BuildSummary, VectorIndex};
use crate::llm::ModelProvider;
use crate::models::{parse_file_urls, ApiKey, SessionId};
use crate::prompt::PromptHelper;
use crate::raw_query::RawQuery;
use crate::session::SessionLocks;
use crate::store::SessionStorage;

pub struct Pipeline {
    config: Config,
    helper: PromptHelper,
    fetcher: DocumentFetcher,
    storage: SessionStorage,
    locks: SessionLocks,
    provider: Arc<dyn ModelProvider>,
}

impl Pipeline {
    pub fn new(config: Config, provider: Arc<dyn ModelProvider>) -> Result<Self> {
        let fetcher = DocumentFetcher::new(&config.fetch, &config.storage.download_dir)?;
        let storage = SessionStorage::new(&config.storage.root)?;
        Ok(Self {
            helper: PromptHelper::from_config(&config.chunking),
            config,
            fetcher,
            storage,
            locks: SessionLocks::new(),
            provider,
        })
    }

    pub fn storage(&self) -> &SessionStorage {
        &self.storage
    }

    /// Download `fileurls` and (re)build the index of `session_id`.
    pub async fn construct_index(
        &self,
        api_key: Option<&str>,
        fileurls: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<BuildSummary> {
        let api_key = ApiKey::parse(required("api_key", api_key)?)?;
        let session = SessionId::parse(required("session_id", session_id)?)?;
        let locators = parse_file_urls(required("fileurls", fileurls)?, &self.config.fetch.scheme)?;
        if locators.is_empty() {
            return Err(PipelineError::invalid_input(
                "fileurls must name at least one document",
            ));
        }

        let _guard = self.locks.write(&session).await;
        tracing::info!(session = %session, documents = locators.len(), "building index");

        let documents = self.fetcher.fetch_all(&locators).await?;
        let model = self.provider.connect(&api_key);
        build_index(
            model.as_ref(),
            documents,
            &session,
            &self.storage,
            &self.helper,
        )
        .await
    }

    /// Answer `question` from the persisted index of `session_id`.
    pub async fn query_index(
        &self,
        api_key: Option<&str>,
        session_id: Option<&str>,
        question: Option<&str>,
    ) -> Result<String> {
        let api_key = ApiKey::parse(required("api_key", api_key)?)?;
        let session = SessionId::parse(required("session_id", session_id)?)?;
        let question = required("question", question)?;

        let index = {
            let _guard = self.locks.read(&session).await;
            VectorIndex::load(&self.storage, &session).await?
        };
        tracing::info!(session = %session, nodes = index.len(), "querying index");

        let model = self.provider.connect(&api_key);
        index
            .query(
                model.as_ref(),
                &self.helper,
                self.config.query.similarity_top_k,
                question,
            )
            .await
    }

    /// Ask `question` over the full text of `fileurls` without indexing.
    ///
    /// `fileurls == "[]"` yields an empty JSON object and makes no network
    /// call.
    pub async fn query_raw(
        &self,
        api_key: Option<&str>,
        fileurls: Option<&str>,
        question: Option<&str>,
    ) -> Result<serde_json::Value> {
        let api_key = ApiKey::parse(required("api_key", api_key)?)?;
        let question = required("question", question)?;
        let locators = parse_file_urls(required("fileurls", fileurls)?, &self.config.fetch.scheme)?;
        if locators.is_empty() {
            return Ok(serde_json::json!({}));
        }

        let model = self.provider.connect(&api_key);
        RawQuery {
            fetcher: &self.fetcher,
            model: model.as_ref(),
            overflow: self.config.query.context_overflow,
            prompt_budget: self.helper.prompt_budget(self.config.llm.max_tokens),
        }
        .run(&locators, question)
        .await
    }
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(PipelineError::invalid_input(format!(
            "missing required parameter '{}'",
            name
        ))),
    }
}
