//! Error taxonomy for the document pipeline.
//!
//! Every component returns [`PipelineError`]; the HTTP layer maps each
//! variant to a distinct status code via [`PipelineError::code`].

use thiserror::Error;

/// Why an upstream model call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// HTTP 429 after retries were exhausted.
    RateLimited,
    /// HTTP 401/403: the supplied API key was refused.
    Auth,
    /// Network failure or 5xx after retries were exhausted.
    Unavailable,
    /// Any other 4xx, or a response we could not interpret.
    Rejected,
}

impl UpstreamErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Unavailable)
    }
}

/// Errors produced anywhere in the fetch, index and query pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A request parameter was missing or malformed.
    #[error("{0}")]
    InvalidInput(String),

    /// A document could not be downloaded. `retryable` marks network
    /// errors, 429 and 5xx responses.
    #[error("failed to fetch {url}: {reason}")]
    FetchFailure {
        url: String,
        reason: String,
        retryable: bool,
    },

    /// A downloaded document could not be turned into text.
    #[error("failed to parse {document}: {reason}")]
    ParseFailure { document: String, reason: String },

    /// The session has no committed index.
    #[error("no index found for session '{0}'")]
    IndexNotFound(String),

    /// The model API failed; see [`UpstreamErrorKind`].
    #[error("upstream model error: {message}")]
    Upstream {
        kind: UpstreamErrorKind,
        message: String,
    },

    /// A prompt would not fit the model's context window.
    #[error("context too large: ~{tokens} tokens exceeds the limit of {limit}")]
    ContextTooLarge { tokens: usize, limit: usize },

    /// Committing or reading session storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error from a session index.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PipelineError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn upstream(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self::Upstream {
            kind,
            message: message.into(),
        }
    }

    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::FetchFailure { .. } => "fetch_failed",
            Self::ParseFailure { .. } => "parse_failed",
            Self::IndexNotFound(_) => "index_not_found",
            Self::Upstream { kind, .. } => match kind {
                UpstreamErrorKind::RateLimited => "upstream_rate_limited",
                UpstreamErrorKind::Auth => "upstream_auth",
                UpstreamErrorKind::Unavailable => "upstream_unavailable",
                UpstreamErrorKind::Rejected => "upstream_rejected",
            },
            Self::ContextTooLarge { .. } => "context_too_large",
            Self::Storage(_) | Self::Io(_) | Self::Database(_) => "internal",
        }
    }

    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FetchFailure { retryable, .. } => *retryable,
            Self::Upstream { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
