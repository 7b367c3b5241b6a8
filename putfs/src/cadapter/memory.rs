//! In-process remote: a mock storage adapter implementing `RemoteClient`.
//!
//! Keeps a flat id-keyed object table like the real service, records every
//! call it receives and can be told to fail the next upload or listing.

use crate::cadapter::client::{
    AccountUsage, NodeId, ROOT_ID, RemoteClient, RemoteEntry, RemoteError, UploadBody,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One call observed by the memory remote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteCall {
    FetchMetadata(NodeId),
    ListChildren(NodeId),
    DownloadRange { id: NodeId, start: u64, end: u64 },
    Upload { parent_id: NodeId, name: String, len: u64 },
    AccountUsage,
}

#[derive(Default)]
struct MemoryState {
    // insertion order doubles as listing order
    order: Vec<NodeId>,
    entries: HashMap<NodeId, RemoteEntry>,
    contents: HashMap<NodeId, Bytes>,
    next_id: NodeId,
    calls: Vec<RemoteCall>,
    failing_uploads: u32,
    upload_limit: Option<u64>,
    upload_renames: HashMap<String, String>,
    failing_listings: HashMap<NodeId, u32>,
    usage: Option<AccountUsage>,
    list_delay: Option<Duration>,
}

pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// A remote holding only the root folder (id 0).
    pub fn new() -> Self {
        let mut state = MemoryState {
            next_id: ROOT_ID + 1,
            ..Default::default()
        };
        state
            .entries
            .insert(ROOT_ID, RemoteEntry::directory(ROOT_ID, None, "Your Files"));
        state.order.push(ROOT_ID);
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, mut entry: RemoteEntry, data: Option<Bytes>) -> NodeId {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        entry.id = id;
        state.order.push(id);
        state.entries.insert(id, entry);
        if let Some(data) = data {
            state.contents.insert(id, data);
        }
        id
    }

    pub fn add_dir(&self, parent_id: NodeId, name: &str) -> NodeId {
        self.insert(RemoteEntry::directory(0, Some(parent_id), name), None)
    }

    pub fn add_file(&self, parent_id: NodeId, name: &str, data: impl Into<Bytes>) -> NodeId {
        let data = data.into();
        let entry = RemoteEntry::file(0, parent_id, name, data.len() as u64);
        self.insert(entry, Some(data))
    }

    /// Add a file of `size` bytes filled with a repeating pattern.
    pub fn add_sized_file(&self, parent_id: NodeId, name: &str, size: u64) -> NodeId {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        self.add_file(parent_id, name, data)
    }

    pub fn entry(&self, id: NodeId) -> Option<RemoteEntry> {
        self.lock().entries.get(&id).cloned()
    }

    pub fn contents(&self, id: NodeId) -> Option<Bytes> {
        self.lock().contents.get(&id).cloned()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn listing_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, RemoteCall::ListChildren(_)))
            .count()
    }

    pub fn fail_next_upload(&self) {
        self.lock().failing_uploads += 1;
    }

    pub fn fail_next_listing(&self, id: NodeId) {
        *self.lock().failing_listings.entry(id).or_default() += 1;
    }

    /// Refuse uploads larger than `limit` bytes, before reading any content.
    pub fn set_upload_limit(&self, limit: u64) {
        self.lock().upload_limit = Some(limit);
    }

    /// Store the next upload of `from` under the name `to`.
    pub fn rename_next_upload(&self, from: &str, to: &str) {
        self.lock()
            .upload_renames
            .insert(from.to_string(), to.to_string());
    }

    pub fn set_usage(&self, usage: AccountUsage) {
        self.lock().usage = Some(usage);
    }

    /// Make every listing sleep before answering, to widen race windows in tests.
    pub fn set_list_delay(&self, delay: Duration) {
        self.lock().list_delay = Some(delay);
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn fetch_metadata(&self, id: NodeId) -> Result<RemoteEntry, RemoteError> {
        let mut state = self.lock();
        state.calls.push(RemoteCall::FetchMetadata(id));
        state.entries.get(&id).cloned().ok_or(RemoteError::NotFound(id))
    }

    async fn list_children(&self, id: NodeId) -> Result<Vec<RemoteEntry>, RemoteError> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(RemoteCall::ListChildren(id));
            state.list_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(remaining) = state.failing_listings.get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Other(format!(
                    "injected listing failure for {id}"
                )));
            }
        }
        match state.entries.get(&id) {
            Some(entry) if entry.is_directory() => {}
            _ => return Err(RemoteError::NotFound(id)),
        }
        Ok(state
            .order
            .iter()
            .filter_map(|child| state.entries.get(child))
            .filter(|entry| entry.parent_id == Some(id))
            .cloned()
            .collect())
    }

    async fn download_range(
        &self,
        id: NodeId,
        start: u64,
        end: u64,
    ) -> Result<Bytes, RemoteError> {
        let mut state = self.lock();
        state.calls.push(RemoteCall::DownloadRange { id, start, end });
        let data = state.contents.get(&id).ok_or(RemoteError::NotFound(id))?;
        let len = data.len() as u64;
        let start = start.min(len) as usize;
        let end = end.min(len) as usize;
        if start >= end {
            return Ok(Bytes::new());
        }
        Ok(data.slice(start..end))
    }

    async fn upload(
        &self,
        parent_id: NodeId,
        name: &str,
        body: UploadBody,
    ) -> Result<RemoteEntry, RemoteError> {
        let stored_name = {
            let mut state = self.lock();
            state.calls.push(RemoteCall::Upload {
                parent_id,
                name: name.to_string(),
                len: body.len,
            });
            if state.failing_uploads > 0 {
                state.failing_uploads -= 1;
                return Err(RemoteError::Other(format!("injected upload failure for {name}")));
            }
            if let Some(limit) = state.upload_limit {
                if body.len > limit {
                    return Err(RemoteError::Status {
                        status: 413,
                        message: format!("{name} is {} bytes, limit is {limit}", body.len),
                    });
                }
            }
            match state.entries.get(&parent_id) {
                Some(parent) if parent.is_directory() => {}
                _ => return Err(RemoteError::NotFound(parent_id)),
            }
            state
                .upload_renames
                .remove(name)
                .unwrap_or_else(|| name.to_string())
        };

        let mut data = BytesMut::new();
        let mut stream = body.stream;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RemoteError::Other(e.to_string()))?;
            data.extend_from_slice(&chunk);
        }
        if data.len() as u64 != body.len {
            return Err(RemoteError::Other(format!(
                "upload of {name} declared {} bytes but sent {}",
                body.len,
                data.len()
            )));
        }

        let created_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let entry = RemoteEntry::file(0, parent_id, stored_name, body.len)
            .with_created_at(created_at);
        let id = self.insert(entry, Some(data.freeze()));
        self.entry(id).ok_or(RemoteError::NotFound(id))
    }

    async fn account_usage(&self) -> Result<Option<AccountUsage>, RemoteError> {
        let mut state = self.lock();
        state.calls.push(RemoteCall::AccountUsage);
        Ok(state.usage)
    }
}
