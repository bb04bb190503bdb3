//! On-disk layout of session indexes.
//!
//! ```text
//! <root>/
//!   <session_id>/index.sqlite     one committed index per session
//!   .staging-XXXX/index.sqlite    build in progress (removed on drop)
//!   .trash-<uuid>/                previous index while it is being replaced
//! ```
//!
//! A build writes into a staging directory and [`SessionStorage::commit`]
//! swaps it in with renames, so readers see either the old index or the new
//! one and a failed build leaves the previous index untouched.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;
use uuid::Uuid;

use crate::db::{self, INDEX_FILE};
use crate::error::{PipelineError, Result};
use crate::models::{EmbeddedNode, Node, SessionId};

/// Summary stored in the `meta` table of every index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexManifest {
    pub embedding_model: String,
    pub dims: usize,
    pub built_at: DateTime<Utc>,
    pub document_count: usize,
    pub node_count: usize,
}

/// One source document as recorded in an index.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub locator: String,
    pub kind: String,
    pub char_count: usize,
}

/// A directory holding an index that has not been committed yet.
pub struct StagingDir {
    dir: TempDir,
}

impl StagingDir {
    pub fn index_path(&self) -> PathBuf {
        self.dir.path().join(INDEX_FILE)
    }
}

#[derive(Debug, Clone)]
pub struct SessionStorage {
    root: PathBuf,
}

impl SessionStorage {
    /// Open the storage root, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the committed index of `session`.
    pub fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.root.join(session.as_str())
    }

    /// Path of the session's SQLite index file.
    pub fn index_path(&self, session: &SessionId) -> PathBuf {
        self.session_dir(session).join(INDEX_FILE)
    }

    /// Create a hidden staging directory under the root for a new index.
    ///
    /// The directory is removed on drop unless [`commit`](Self::commit)
    /// moves it into place first.
    pub fn stage(&self) -> Result<StagingDir> {
        let dir = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)?;
        Ok(StagingDir { dir })
    }

    /// Replace the session's index with the staged one.
    pub fn commit(&self, staging: StagingDir, session: &SessionId) -> Result<()> {
        let target = self.session_dir(session);
        let trash = self.root.join(format!(".trash-{}", Uuid::new_v4()));

        let had_previous = target.exists();
        if had_previous {
            std::fs::rename(&target, &trash)?;
        }

        if let Err(e) = std::fs::rename(staging.dir.path(), &target) {
            if had_previous {
                if let Err(restore) = std::fs::rename(&trash, &target) {
                    tracing::error!(session = %session, error = %restore, "failed to restore previous index");
                }
            }
            return Err(PipelineError::Storage(format!(
                "failed to commit index for session '{}': {}",
                session, e
            )));
        }

        if had_previous {
            if let Err(e) = std::fs::remove_dir_all(&trash) {
                tracing::warn!(path = %trash.display(), error = %e, "failed to remove replaced index");
            }
        }
        // `staging` drops here; its directory has been renamed away already.
        Ok(())
    }

    /// Names of all sessions with a committed index, sorted.
    pub fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') || !entry.path().join(INDEX_FILE).is_file() {
                continue;
            }
            if let Ok(id) = SessionId::parse(name) {
                sessions.push(id);
            }
        }
        sessions.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(sessions)
    }
}

/// Write a complete index into a freshly created database.
pub async fn write_index(
    pool: &SqlitePool,
    manifest: &IndexManifest,
    documents: &[StoredDocument],
    nodes: &[EmbeddedNode],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    let meta = [
        ("embedding_model", manifest.embedding_model.clone()),
        ("dims", manifest.dims.to_string()),
        ("built_at", manifest.built_at.to_rfc3339()),
        ("document_count", manifest.document_count.to_string()),
        ("node_count", manifest.node_count.to_string()),
    ];
    for (key, value) in meta {
        sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    for (position, doc) in documents.iter().enumerate() {
        sqlx::query(
            "INSERT INTO documents (id, position, locator, kind, char_count) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&doc.id)
        .bind(position as i64)
        .bind(&doc.locator)
        .bind(&doc.kind)
        .bind(doc.char_count as i64)
        .execute(&mut *tx)
        .await?;
    }

    for embedded in nodes {
        let node = &embedded.node;
        sqlx::query(
            r#"
            INSERT INTO nodes (id, document_id, node_index, text, hash, embedding)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(&node.document_id)
        .bind(node.node_index)
        .bind(&node.text)
        .bind(&node.hash)
        .bind(vec_to_blob(&embedded.embedding))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn read_manifest(pool: &SqlitePool) -> Result<IndexManifest> {
    let rows = sqlx::query("SELECT key, value FROM meta")
        .fetch_all(pool)
        .await?;

    let mut lookup = std::collections::HashMap::new();
    for row in rows {
        let key: String = row.get("key");
        let value: String = row.get("value");
        lookup.insert(key, value);
    }

    let field = |key: &str| {
        lookup
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::Storage(format!("index meta is missing '{}'", key)))
    };
    let number = |key: &str| -> Result<usize> {
        field(key)?
            .parse()
            .map_err(|e| PipelineError::Storage(format!("index meta '{}' is invalid: {}", key, e)))
    };

    let built_at = DateTime::parse_from_rfc3339(&field("built_at")?)
        .map_err(|e| PipelineError::Storage(format!("index meta 'built_at' is invalid: {}", e)))?
        .with_timezone(&Utc);

    Ok(IndexManifest {
        embedding_model: field("embedding_model")?,
        dims: number("dims")?,
        built_at,
        document_count: number("document_count")?,
        node_count: number("node_count")?,
    })
}

pub async fn read_nodes(pool: &SqlitePool) -> Result<Vec<EmbeddedNode>> {
    let rows = sqlx::query(
        r#"
        SELECT n.id, n.document_id, n.node_index, n.text, n.hash, n.embedding
        FROM nodes n
        JOIN documents d ON d.id = n.document_id
        ORDER BY d.position, n.node_index
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            EmbeddedNode {
                node: Node {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    node_index: row.get("node_index"),
                    text: row.get("text"),
                    hash: row.get("hash"),
                },
                embedding: blob_to_vec(&blob),
            }
        })
        .collect())
}

/// Open the committed index of `session`, or `IndexNotFound`.
pub async fn open_session(storage: &SessionStorage, session: &SessionId) -> Result<SqlitePool> {
    let path = storage.index_path(session);
    if !path.is_file() {
        return Err(PipelineError::IndexNotFound(session.to_string()));
    }
    db::open_read_only(&path).await
}

/// Manifest of every committed session index, sorted by session name.
///
/// Indexes that cannot be opened or read are logged and left out.
pub async fn describe_sessions(
    storage: &SessionStorage,
) -> Result<Vec<(SessionId, IndexManifest)>> {
    let mut out = Vec::new();
    for session in storage.list_sessions()? {
        let pool = match open_session(storage, &session).await {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(session = %session, error = %e, "skipping unreadable session index");
                continue;
            }
        };
        let manifest = read_manifest(&pool).await;
        pool.close().await;
        match manifest {
            Ok(manifest) => out.push((session, manifest)),
            Err(e) => {
                tracing::warn!(session = %session, error = %e, "skipping unreadable session index");
            }
        }
    }
    Ok(out)
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode bytes written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
