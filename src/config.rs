//! TOML configuration.
//!
//! Every section is optional; an absent file section falls back to the
//! defaults below, which reproduce the constants the service has always
//! used (4096-token model window, 256 output tokens, 600-token nodes with a
//! 20-token overlap, temperature 0.7).
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:5000"
//!
//! [storage]
//! root = "./storage"
//! download_dir = "./downloads"
//!
//! [fetch]
//! scheme = "https:"
//!
//! [llm]
//! base_url = "https://api.openai.com/v1"
//! completion_model = "gpt-3.5-turbo-instruct"
//!
//! [query]
//! context_overflow = "reject"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}

/// Where session indexes live and where documents are downloaded to.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            download_dir: default_download_dir(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./storage")
}
fn default_download_dir() -> PathBuf {
    std::env::temp_dir().join("docqa-downloads")
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    /// Prefixed to scheme-less locators such as `//host/a.pdf`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_fetch_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_fetch_retries(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_scheme() -> String {
    "https:".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_fetch_retries() -> u32 {
    2
}
fn default_max_bytes() -> u64 {
    50 * 1024 * 1024
}

/// Token budgets governing how documents are split into nodes and how
/// retrieved nodes are packed into a prompt.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_input_size")]
    pub max_input_size: usize,
    #[serde(default = "default_num_outputs")]
    pub num_outputs: usize,
    #[serde(default = "default_max_chunk_overlap")]
    pub max_chunk_overlap: usize,
    #[serde(default = "default_chunk_size_limit")]
    pub chunk_size_limit: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_input_size: default_max_input_size(),
            num_outputs: default_num_outputs(),
            max_chunk_overlap: default_max_chunk_overlap(),
            chunk_size_limit: default_chunk_size_limit(),
        }
    }
}

fn default_max_input_size() -> usize {
    4096
}
fn default_num_outputs() -> usize {
    256
}
fn default_max_chunk_overlap() -> usize {
    20
}
fn default_chunk_size_limit() -> usize {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_completion_model")]
    pub completion_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_num_outputs")]
    pub max_tokens: usize,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            completion_model: default_completion_model(),
            embedding_model: default_embedding_model(),
            temperature: default_temperature(),
            max_tokens: default_num_outputs(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            timeout_secs: default_timeout_secs(),
            max_retries: default_llm_retries(),
            embedding_batch_size: default_embedding_batch_size(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_completion_model() -> String {
    "gpt-3.5-turbo-instruct".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    1.0
}
fn default_llm_retries() -> u32 {
    3
}
fn default_embedding_batch_size() -> usize {
    64
}

/// What the raw-context path does when the concatenated documents do not
/// fit in the model window.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContextOverflow {
    /// Fail with `context_too_large` before calling the model.
    #[default]
    Reject,
    /// Cut the context down to the available budget.
    Truncate,
    /// Send the prompt unchanged and let the model reject it.
    Forward,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_similarity_top_k")]
    pub similarity_top_k: usize,
    #[serde(default)]
    pub context_overflow: ContextOverflow,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            similarity_top_k: default_similarity_top_k(),
            context_overflow: ContextOverflow::default(),
        }
    }
}

fn default_similarity_top_k() -> usize {
    2
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.chunk_size_limit == 0 {
            bail!("chunking.chunk_size_limit must be > 0");
        }
        if c.max_chunk_overlap >= c.chunk_size_limit {
            bail!("chunking.max_chunk_overlap must be smaller than chunking.chunk_size_limit");
        }
        if c.num_outputs >= c.max_input_size {
            bail!("chunking.num_outputs must be smaller than chunking.max_input_size");
        }
        if self.llm.max_tokens >= c.max_input_size {
            bail!("llm.max_tokens must be smaller than chunking.max_input_size");
        }
        if self.llm.embedding_batch_size == 0 {
            bail!("llm.embedding_batch_size must be > 0");
        }
        if self.query.similarity_top_k == 0 {
            bail!("query.similarity_top_k must be >= 1");
        }
        if !self.fetch.scheme.ends_with(':') {
            bail!(
                "fetch.scheme must end with ':' (e.g. \"https:\"), got '{}'",
                self.fetch.scheme
            );
        }
        if self.llm.base_url.trim().is_empty() {
            bail!("llm.base_url must not be empty");
        }
        Ok(())
    }
}
