//! Document fetcher.
//!
//! Downloads remote documents into uniquely named temporary files
//! (`<uuid>.<ext>` under the configured download directory). Each download
//! is a [`TempDocument`] that deletes its file when dropped, so callers
//! cannot leak files on early returns or errors.
//!
//! # Retry Strategy
//!
//! - Network errors, HTTP 429 and 5xx → retry with exponential backoff
//!   (1s, 2s, 4s, … capped at 32s)
//! - Other HTTP 4xx and oversized bodies → fail immediately

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::config::FetchConfig;
use crate::error::{PipelineError, Result};
use crate::extract::{DocumentKind, MAGIC_LEN};
use crate::models::DocumentLocator;

/// A downloaded document that lives on disk until dropped.
#[derive(Debug)]
pub struct TempDocument {
    file: NamedTempFile,
    kind: DocumentKind,
    locator: DocumentLocator,
    size: u64,
}

impl TempDocument {
    #[cfg(test)]
    pub(crate) fn from_parts(
        file: NamedTempFile,
        kind: DocumentKind,
        locator: DocumentLocator,
    ) -> Self {
        let size = file.as_file().metadata().map(|m| m.len()).unwrap_or(0);
        Self {
            file,
            kind,
            locator,
            size,
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn locator(&self) -> &DocumentLocator {
        &self.locator
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

pub struct DocumentFetcher {
    client: reqwest::Client,
    config: FetchConfig,
    download_dir: PathBuf,
}

impl DocumentFetcher {
    pub fn new(config: &FetchConfig, download_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(download_dir)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Storage(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config: config.clone(),
            download_dir: download_dir.to_path_buf(),
        })
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Fetch every locator in order. On the first failure, documents already
    /// downloaded by this call are dropped (and deleted) before returning.
    pub async fn fetch_all(&self, locators: &[DocumentLocator]) -> Result<Vec<TempDocument>> {
        let mut docs = Vec::with_capacity(locators.len());
        for locator in locators {
            docs.push(self.fetch(locator).await?);
        }
        Ok(docs)
    }

    /// Fetch a single document, retrying transient failures.
    pub async fn fetch(&self, locator: &DocumentLocator) -> Result<TempDocument> {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.try_fetch(locator).await {
                Ok(doc) => {
                    tracing::debug!(
                        url = %locator.url(),
                        bytes = doc.size,
                        path = %doc.path().display(),
                        "downloaded document"
                    );
                    return Ok(doc);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(url = %locator.url(), attempt, error = %e, "fetch failed, will retry");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| failure(locator, "fetch failed after retries", true)))
    }

    async fn try_fetch(&self, locator: &DocumentLocator) -> Result<TempDocument> {
        let mut response = self
            .client
            .get(locator.url().clone())
            .send()
            .await
            .map_err(|e| {
                let retryable = !e.is_builder();
                failure(locator, e, retryable)
            })?;

        let status = response.status();
        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            return Err(failure(locator, format!("HTTP {}", status), retryable));
        }

        if let Some(len) = response.content_length() {
            if len > self.config.max_bytes {
                return Err(too_large(locator, self.config.max_bytes));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Servers may split the magic bytes across chunks.
        let mut head = Vec::with_capacity(MAGIC_LEN);
        let mut finished = false;
        while head.len() < MAGIC_LEN {
            match response
                .chunk()
                .await
                .map_err(|e| failure(locator, e, true))?
            {
                Some(chunk) => {
                    head.extend_from_slice(&chunk);
                    if head.len() as u64 > self.config.max_bytes {
                        return Err(too_large(locator, self.config.max_bytes));
                    }
                }
                None => {
                    finished = true;
                    break;
                }
            }
        }
        let kind = DocumentKind::detect(content_type.as_deref(), locator.url().path(), &head);

        let mut file = tempfile::Builder::new()
            .prefix(&Uuid::new_v4().to_string())
            .suffix(&format!(".{}", kind.extension()))
            .rand_bytes(0)
            .tempfile_in(&self.download_dir)?;

        let mut size = head.len() as u64;
        file.write_all(&head)?;

        while !finished {
            let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| failure(locator, e, true))?
            else {
                break;
            };
            size += chunk.len() as u64;
            if size > self.config.max_bytes {
                return Err(too_large(locator, self.config.max_bytes));
            }
            file.write_all(&chunk)?;
        }
        file.flush()?;

        Ok(TempDocument {
            file,
            kind,
            locator: locator.clone(),
            size,
        })
    }
}

fn failure(locator: &DocumentLocator, reason: impl ToString, retryable: bool) -> PipelineError {
    PipelineError::FetchFailure {
        url: locator.url().to_string(),
        reason: reason.to_string(),
        retryable,
    }
}

fn too_large(locator: &DocumentLocator, max_bytes: u64) -> PipelineError {
    failure(
        locator,
        format!("document exceeds size limit ({} bytes)", max_bytes),
        false,
    )
}
