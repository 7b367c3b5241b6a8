//! Path-based filesystem operations over the path cache and the write buffers.
//!
//! A path is in one of three modes, discovered per call: write-mode (an open
//! buffer), read-mode (resolves to a remote node) or unknown. Buffers are
//! checked first so a file being written shadows nothing remote.

use crate::cadapter::client::RemoteClient;
use crate::error::{FsError, FsResult};
use crate::meta::cache::PathCache;
use crate::meta::node::{FileAttributes, NodeKind, RemoteNode};
use crate::meta::path;
use crate::vfs::buffer::{Handle, WriteBuffers};
use bitflags::bitflags;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

bitflags! {
    /// access(2) mode bits. An empty mask is an existence check.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccessMask: u32 {
        const READ = libc::R_OK as u32;
        const WRITE = libc::W_OK as u32;
        const EXEC = libc::X_OK as u32;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// Structural mutations the remote has no primitive for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mutation {
    Rename,
    Unlink,
    Mkdir,
    Rmdir,
    Symlink,
    Link,
    Mknod,
    Chmod,
    Chown,
    Truncate,
    Utimens,
    SetXattr,
    RemoveXattr,
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mutation::Rename => "rename",
            Mutation::Unlink => "unlink",
            Mutation::Mkdir => "mkdir",
            Mutation::Rmdir => "rmdir",
            Mutation::Symlink => "symlink",
            Mutation::Link => "link",
            Mutation::Mknod => "mknod",
            Mutation::Chmod => "chmod",
            Mutation::Chown => "chown",
            Mutation::Truncate => "truncate",
            Mutation::Utimens => "utimens",
            Mutation::SetXattr => "setxattr",
            Mutation::RemoveXattr => "removexattr",
        };
        f.write_str(name)
    }
}

/// statfs figures, in `block_size` units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

pub const STAT_BLOCK_SIZE: u32 = 512;
const FALLBACK_BLOCKS: u64 = 4096;
const FALLBACK_BLOCKS_FREE: u64 = 2048;
const NAME_MAX: u32 = 255;

pub struct PutFs<C: RemoteClient> {
    cache: PathCache<C>,
    buffers: WriteBuffers<C>,
    started_at: SystemTime,
}

impl<C: RemoteClient> PutFs<C> {
    pub fn new(client: Arc<C>, spool_dir: Option<PathBuf>) -> Self {
        Self {
            cache: PathCache::new(client.clone()),
            buffers: WriteBuffers::new(client, spool_dir),
            started_at: SystemTime::now(),
        }
    }

    pub fn cache(&self) -> &PathCache<C> {
        &self.cache
    }

    pub fn buffers(&self) -> &WriteBuffers<C> {
        &self.buffers
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub async fn fetch_root(&self) -> FsResult<Arc<RemoteNode>> {
        self.cache.fetch_root().await
    }

    pub async fn attributes(&self, p: &str) -> FsResult<FileAttributes> {
        if let Some(attr) = self.buffers.stat(p) {
            return Ok(attr);
        }
        let node = self.cache.resolve(p).await?;
        Ok(node.attributes(self.started_at, SystemTime::now()))
    }

    /// `.`, `..`, remote children in listing order, then not yet uploaded files.
    pub async fn list(&self, p: &str) -> FsResult<Vec<DirEntry>> {
        let dir_path = path::normalize(p);
        let node = self.cache.resolve(&dir_path).await?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory(dir_path));
        }
        let children = self.cache.children_of(&node).await?;

        let mut out = Vec::with_capacity(children.len() + 2);
        for dot in [".", ".."] {
            out.push(DirEntry {
                name: dot.to_string(),
                kind: NodeKind::Directory,
            });
        }
        for child in children.iter() {
            out.push(DirEntry {
                name: child.name.clone(),
                kind: child.kind,
            });
        }
        for name in self.buffers.pending_in(&dir_path) {
            if !children.iter().any(|c| c.name == name) {
                out.push(DirEntry {
                    name,
                    kind: NodeKind::File,
                });
            }
        }
        Ok(out)
    }

    /// Walk `/` down to `p`, checking every level.
    pub async fn access(&self, p: &str, mask: AccessMask) -> FsResult<()> {
        let target = path::normalize(p);
        if self.buffers.contains(&target) {
            if mask.contains(AccessMask::EXEC) {
                return Err(FsError::PermissionDenied(target));
            }
            return Ok(());
        }

        let levels = path::ancestors(&target);
        let last = levels.len() - 1;
        for (depth, level) in levels.iter().enumerate() {
            let node = self.cache.resolve(level).await?;
            if mask.contains(AccessMask::WRITE) {
                return Err(FsError::PermissionDenied(target));
            }
            if !node.is_dir() && (depth < last || mask.contains(AccessMask::EXEC)) {
                return Err(FsError::PermissionDenied(target));
            }
        }
        Ok(())
    }

    /// Open for reading, or re-open a file that is still being written.
    pub async fn open(&self, p: &str, flags: u32) -> FsResult<Handle> {
        let target = path::normalize(p);
        if self.buffers.contains(&target) {
            return Ok(self.buffers.next_handle());
        }
        let node = self.cache.resolve(&target).await?;
        if node.is_dir() {
            return Err(FsError::IsADirectory(target));
        }
        let flags = flags as i32;
        if flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0 {
            return Err(FsError::ReadOnly(target));
        }
        Ok(self.buffers.next_handle())
    }

    pub async fn open_dir(&self, p: &str) -> FsResult<Handle> {
        let target = path::normalize(p);
        let node = self.cache.resolve(&target).await?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory(target));
        }
        Ok(self.buffers.next_handle())
    }

    /// Bytes `[offset, offset + size)`, short at end of file.
    pub async fn read(&self, p: &str, size: u32, offset: u64) -> FsResult<Bytes> {
        let target = path::normalize(p);
        if self.buffers.contains(&target) {
            return self.buffers.read(&target, offset, size).await;
        }
        let node = self.cache.resolve(&target).await?;
        if node.is_dir() {
            return Err(FsError::IsADirectory(target));
        }
        if offset >= node.size || size == 0 {
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(size as u64).min(node.size);
        self.cache
            .client()
            .download_range(node.id, offset, end)
            .await
            .map_err(|e| FsError::from_remote(target, e))
    }

    /// Start a new file. Nothing reaches the remote until `release`.
    pub async fn create(&self, p: &str) -> FsResult<Handle> {
        let target = path::normalize(p);
        let Some((parent_path, name)) = path::split(&target) else {
            return Err(FsError::AlreadyExists(target));
        };
        let parent = self.cache.resolve(parent_path).await?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory(parent_path.to_string()));
        }
        match self.cache.resolve(&target).await {
            Ok(_) => return Err(FsError::AlreadyExists(target)),
            Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let handle = self.buffers.open(&target, parent.id, name)?;
        info!(path = %target, handle, "created pending file");
        Ok(handle)
    }

    pub async fn write(&self, p: &str, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.buffers.write(p, offset, data).await
    }

    pub async fn truncate(&self, p: &str, size: u64) -> FsResult<()> {
        if self.buffers.contains(p) {
            return self.buffers.truncate(p, size).await;
        }
        self.cache.resolve(p).await?;
        self.reject(Mutation::Truncate, p)
    }

    /// Upload a pending file, if any, and make it visible in the cache.
    ///
    /// The node is installed under the created path before the buffer goes
    /// away, even if the remote stored it under a different name.
    pub async fn release(&self, p: &str) -> FsResult<Option<Arc<RemoteNode>>> {
        let target = path::normalize(p);
        if !self.buffers.contains(&target) {
            return Ok(None);
        }
        let Some((_, name)) = path::split(&target) else {
            return Ok(None);
        };
        let node = self
            .buffers
            .commit_with(&target, |entry| {
                let mut node = RemoteNode::from_entry(&entry);
                if node.name != name {
                    warn!(path = %target, stored_as = %node.name, "remote renamed the upload");
                    node.name = name.to_string();
                }
                self.cache.insert(node)
            })
            .await?;
        info!(path = %target, id = node.id, size = node.size, "upload committed");
        Ok(Some(node))
    }

    /// Release one handle. Only the handle returned by `create` commits the buffer.
    pub async fn release_handle(
        &self,
        p: &str,
        fh: Handle,
    ) -> FsResult<Option<Arc<RemoteNode>>> {
        match self.buffers.handle_of(p) {
            Some(owner) if owner == fh => self.release(p).await,
            _ => Ok(None),
        }
    }

    /// Shared rejection for every structural mutation.
    pub fn reject<T>(&self, op: Mutation, p: &str) -> FsResult<T> {
        debug!(%op, path = p, "rejecting mutation on read-only tree");
        Err(FsError::ReadOnly(path::normalize(p)))
    }

    /// Extended attributes are not part of the remote model.
    pub async fn getxattr(&self, p: &str) -> FsResult<Bytes> {
        self.attributes(p).await?;
        Err(FsError::Unsupported(path::normalize(p)))
    }

    pub async fn listxattr(&self, p: &str) -> FsResult<Bytes> {
        self.attributes(p).await?;
        Err(FsError::Unsupported(path::normalize(p)))
    }

    pub async fn statfs(&self) -> FsResult<FsStats> {
        let usage = self
            .cache
            .client()
            .account_usage()
            .await
            .map_err(|e| FsError::from_remote("/", e))?;
        let block = STAT_BLOCK_SIZE as u64;
        let (blocks, free) = match usage {
            Some(u) => (u.total / block, u.available / block),
            None => (FALLBACK_BLOCKS, FALLBACK_BLOCKS_FREE),
        };
        Ok(FsStats {
            block_size: STAT_BLOCK_SIZE,
            blocks,
            blocks_free: free,
            blocks_available: free,
            files: self.cache.len() as u64,
            files_free: 0,
            name_max: NAME_MAX,
        })
    }
}
