//! Core data types that flow through the pipeline.

use std::fmt;

use reqwest::Url;

use crate::error::{PipelineError, Result};

const MAX_SESSION_ID_LEN: usize = 128;

/// Caller-chosen session name. Doubles as a directory name under the
/// storage root, so only a conservative character set is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PipelineError::invalid_input("session_id must not be empty"));
        }
        if raw.len() > MAX_SESSION_ID_LEN {
            return Err(PipelineError::invalid_input(format!(
                "session_id must be at most {} bytes",
                MAX_SESSION_ID_LEN
            )));
        }
        if raw == "." || raw == ".." || raw.starts_with('.') {
            return Err(PipelineError::invalid_input(
                "session_id must not start with '.'",
            ));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(PipelineError::invalid_input(format!(
                "session_id contains invalid character {:?}",
                bad
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-request credential for the model API. Never logged.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PipelineError::invalid_input("api_key must not be empty"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// A remote document, usually given without a scheme (`//host/a.pdf`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentLocator {
    raw: String,
    url: Url,
}

impl DocumentLocator {
    /// Resolves `raw` against `scheme` (e.g. `"https:"`). Locators that
    /// already name `http://` or `https://` are kept as they are.
    pub fn resolve(raw: &str, scheme: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PipelineError::invalid_input("document URL must not be empty"));
        }
        let full = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else {
            format!("{}{}", scheme, raw)
        };
        let url = Url::parse(&full).map_err(|e| {
            PipelineError::invalid_input(format!("invalid document URL '{}': {}", raw, e))
        })?;
        if url.host_str().is_none() {
            return Err(PipelineError::invalid_input(format!(
                "document URL '{}' has no host",
                raw
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
            url,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The locator as the caller supplied it.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Splits the `fileurls` query parameter (`"a, b, c"`) into locators.
///
/// Returns an empty list for the literal `[]`.
pub fn parse_file_urls(raw: &str, scheme: &str) -> Result<Vec<DocumentLocator>> {
    if raw.trim() == "[]" {
        return Ok(Vec::new());
    }
    raw.split(", ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| DocumentLocator::resolve(s, scheme))
        .collect()
}

/// A bounded segment of document text: the unit of indexing.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub document_id: String,
    pub node_index: i64,
    pub text: String,
    pub hash: String,
}

/// A node together with its embedding, as held in a loaded index.
#[derive(Debug, Clone)]
pub struct EmbeddedNode {
    pub node: Node,
    pub embedding: Vec<f32>,
}
