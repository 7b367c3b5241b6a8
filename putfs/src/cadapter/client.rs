//! Remote client contract.
//!
//! The cache and the write buffers only ever talk to the remote through this
//! trait, so the put.io backend and the in-memory backend are interchangeable.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::pin::Pin;
use thiserror::Error;

/// Opaque remote object identifier.
pub type NodeId = u64;

/// Id of the remote root folder. It never appears in listings as a child.
pub const ROOT_ID: NodeId = 0;

/// Content type the remote uses to mark folders.
pub const DIRECTORY_CONTENT_TYPE: &str = "application/x-directory";

/// One object record as returned by the remote, before any local shaping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub id: NodeId,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl RemoteEntry {
    pub fn directory(id: NodeId, parent_id: Option<NodeId>, name: impl Into<String>) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            content_type: Some(DIRECTORY_CONTENT_TYPE.to_string()),
            size: Some(0),
            created_at: None,
        }
    }

    pub fn file(id: NodeId, parent_id: NodeId, name: impl Into<String>, size: u64) -> Self {
        Self {
            id,
            parent_id: Some(parent_id),
            name: name.into(),
            content_type: Some("application/octet-stream".to_string()),
            size: Some(size),
            created_at: None,
        }
    }

    pub fn with_created_at(mut self, created_at: impl Into<String>) -> Self {
        self.created_at = Some(created_at.into());
        self
    }

    pub fn is_directory(&self) -> bool {
        self.content_type.as_deref() == Some(DIRECTORY_CONTENT_TYPE)
    }
}

/// Account-wide space figures, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountUsage {
    pub total: u64,
    pub available: u64,
    pub used: u64,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote object {0} not found")]
    NotFound(NodeId),

    #[error("remote rejected the credentials (HTTP {0})")]
    Unauthorized(u16),

    #[error("remote returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("malformed remote response: {0}")]
    Decode(String),

    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("remote call failed: {0}")]
    Other(String),
}

pub type UploadStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync + 'static>>;

/// Object content handed to `upload`: a declared length and the bytes as a
/// stream, so large staged files never have to sit in memory.
pub struct UploadBody {
    pub len: u64,
    pub stream: UploadStream,
}

impl UploadBody {
    pub fn new(len: u64, stream: UploadStream) -> Self {
        Self { len, stream }
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            len: data.len() as u64,
            stream: Box::pin(stream::once(async move { Ok(data) })),
        }
    }
}

impl fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadBody").field("len", &self.len).finish()
    }
}

/// Remote storage capability handed to the path cache and the write buffers.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch one object's metadata.
    async fn fetch_metadata(&self, id: NodeId) -> Result<RemoteEntry, RemoteError>;

    /// List the direct children of a directory, in remote order.
    async fn list_children(&self, id: NodeId) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Download bytes `[start, end)` of a file. May return fewer bytes at end of file.
    async fn download_range(&self, id: NodeId, start: u64, end: u64)
    -> Result<Bytes, RemoteError>;

    /// Upload a complete object under `parent_id` and return its new record.
    async fn upload(
        &self,
        parent_id: NodeId,
        name: &str,
        body: UploadBody,
    ) -> Result<RemoteEntry, RemoteError>;

    /// Space figures for `statfs`. Backends without the notion return `None`.
    async fn account_usage(&self) -> Result<Option<AccountUsage>, RemoteError> {
        Ok(None)
    }
}
