//! The `DocumentStore` external interface from spec.md \S6.
//!
//! The real relational store (`original_source/backend/database.py`,
//! `routers/documents.py`) is out of scope per spec.md \S1. This module
//! defines the trait the core consumes and ships a filesystem-backed
//! implementation — one JSON sidecar file per document — so the binary
//! and integration tests have something concrete to run against.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Access-control metadata for a document, independent of its CRDT
/// content.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub is_public: bool,
    pub owner_id: Option<String>,
    pub collaborator_ids: Vec<String>,
}

impl DocumentMetadata {
    pub fn allows(&self, identity: &crate::auth::Identity) -> bool {
        if self.is_public {
            return true;
        }
        match identity.user_id() {
            Some(uid) => {
                self.owner_id.as_deref() == Some(uid) || self.collaborator_ids.iter().any(|c| c == uid)
            }
            None => false,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("document {document_id} not found"))]
    NotFound { document_id: String },
    #[snafu(display("io error for document {document_id}: {source}"))]
    Io {
        document_id: String,
        source: std::io::Error,
    },
}

use snafu::Snafu;

/// External collaborator the core consumes to load document metadata,
/// load/save CRDT state, and check existence — never to perform REST
/// CRUD, which is explicitly out of scope.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn metadata(&self, document_id: &str) -> Result<DocumentMetadata, StoreError>;
    async fn load_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn save_state(&self, document_id: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// One JSON file per document under `root`. Documents not yet known to
/// the store (no metadata file) are treated as public by default so the
/// bundled binary is usable without a separate provisioning step; a real
/// deployment's store makes this an explicit decision per spec.md \S1.
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn state_path(&self, document_id: &str) -> PathBuf {
        self.root.join(format!("{document_id}.state.json"))
    }

    fn meta_path(&self, document_id: &str) -> PathBuf {
        self.root.join(format!("{document_id}.meta.json"))
    }

    async fn ensure_root(&self, document_id: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .context(IoSnafu { document_id })
    }
}

use snafu::ResultExt;

#[async_trait]
impl DocumentStore for FsDocumentStore {
    #[instrument(skip(self))]
    async fn metadata(&self, document_id: &str) -> Result<DocumentMetadata, StoreError> {
        let path = self.meta_path(document_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|_| StoreError::NotFound {
                document_id: document_id.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DocumentMetadata {
                is_public: true,
                owner_id: None,
                collaborator_ids: Vec::new(),
            }),
            Err(source) => Err(StoreError::Io {
                document_id: document_id.to_string(),
                source,
            }),
        }
    }

    #[instrument(skip(self))]
    async fn load_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.state_path(document_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                document_id: document_id.to_string(),
                source,
            }),
        }
    }

    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    async fn save_state(&self, document_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.ensure_root(document_id).await?;
        let path = self.state_path(document_id);
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, bytes)
            .await
            .context(IoSnafu { document_id })?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .context(IoSnafu { document_id })
    }
}

/// An in-memory store used by unit/integration tests where touching the
/// filesystem would only add noise.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    state: dashmap::DashMap<String, Vec<u8>>,
    meta: dashmap::DashMap<String, DocumentMetadata>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(self, document_id: impl Into<String>, meta: DocumentMetadata) -> Self {
        self.meta.insert(document_id.into(), meta);
        self
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn metadata(&self, document_id: &str) -> Result<DocumentMetadata, StoreError> {
        Ok(self.meta.get(document_id).map(|m| m.clone()).unwrap_or(DocumentMetadata {
            is_public: true,
            owner_id: None,
            collaborator_ids: Vec::new(),
        }))
    }

    async fn load_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.state.get(document_id).map(|v| v.clone()))
    }

    async fn save_state(&self, document_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.state.insert(document_id.to_string(), bytes.to_vec());
        Ok(())
    }
}
