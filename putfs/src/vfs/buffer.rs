//! Write buffers: staging for newly created files until they are uploaded.
//!
//! Each pending path owns an unlinked temporary file. It is closed and gone
//! as soon as the entry is dropped, whether the upload worked or not.

use crate::cadapter::client::{NodeId, RemoteClient, RemoteEntry, UploadBody};
use crate::error::{FsError, FsResult};
use crate::meta::node::FileAttributes;
use crate::meta::path;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, ReadBuf};
use tokio::sync::OwnedMutexGuard;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

pub type Handle = u64;

/// Chunk size used when streaming a staged file to the remote.
const UPLOAD_CHUNK: usize = 256 * 1024;

type Store = Arc<tokio::sync::Mutex<tokio::fs::File>>;

pub struct PendingUpload {
    pub handle: Handle,
    pub parent_id: NodeId,
    pub name: String,
    pub opened_at: SystemTime,
    len: AtomicU64,
    store: Store,
}

impl PendingUpload {
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attributes(&self, now: SystemTime) -> FileAttributes {
        FileAttributes::pending(self.len(), self.opened_at, now)
    }
}

pub struct WriteBuffers<C: RemoteClient> {
    client: Arc<C>,
    spool_dir: Option<PathBuf>,
    table: Mutex<HashMap<String, Arc<PendingUpload>>>,
    next_handle: AtomicU64,
}

impl<C: RemoteClient> WriteBuffers<C> {
    /// `spool_dir` of `None` stages in the system temporary directory.
    pub fn new(client: Arc<C>, spool_dir: Option<PathBuf>) -> Self {
        Self {
            client,
            spool_dir,
            table: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<PendingUpload>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh handle id. Shared by read and write opens.
    pub fn next_handle(&self) -> Handle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn scratch_file(&self, p: &str) -> FsResult<tokio::fs::File> {
        let file = match &self.spool_dir {
            Some(dir) => tempfile::tempfile_in(dir),
            None => tempfile::tempfile(),
        }
        .map_err(|e| FsError::io(p, e))?;
        Ok(tokio::fs::File::from_std(file))
    }

    /// Open a buffer for `p`. Fails with AlreadyOpen if one exists.
    pub fn open(&self, p: &str, parent_id: NodeId, name: &str) -> FsResult<Handle> {
        let key = path::normalize(p);
        let mut table = self.table();
        if table.contains_key(&key) {
            return Err(FsError::AlreadyOpen(key));
        }
        let store = self.scratch_file(&key)?;
        let handle = self.next_handle();
        table.insert(
            key.clone(),
            Arc::new(PendingUpload {
                handle,
                parent_id,
                name: name.to_string(),
                opened_at: SystemTime::now(),
                len: AtomicU64::new(0),
                store: Arc::new(tokio::sync::Mutex::new(store)),
            }),
        );
        debug!(path = %key, handle, "write buffer opened");
        Ok(handle)
    }

    pub fn get(&self, p: &str) -> Option<Arc<PendingUpload>> {
        self.table().get(&path::normalize(p)).cloned()
    }

    pub fn contains(&self, p: &str) -> bool {
        self.table().contains_key(&path::normalize(p))
    }

    pub fn handle_of(&self, p: &str) -> Option<Handle> {
        self.get(p).map(|b| b.handle)
    }

    pub fn stat(&self, p: &str) -> Option<FileAttributes> {
        self.get(p).map(|b| b.attributes(SystemTime::now()))
    }

    /// Names of buffers whose parent is directory `dir`.
    pub fn pending_in(&self, dir: &str) -> Vec<String> {
        let dir = path::normalize(dir);
        let mut names: Vec<String> = self
            .table()
            .keys()
            .filter_map(|k| match path::split(k) {
                Some((parent, name)) if parent == dir => Some(name.to_string()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    fn require(&self, p: &str) -> FsResult<Arc<PendingUpload>> {
        self.get(p)
            .ok_or_else(|| FsError::NotOpen(path::normalize(p)))
    }

    pub async fn write(&self, p: &str, offset: u64, data: &[u8]) -> FsResult<usize> {
        let buf = self.require(p)?;
        let mut store = buf.store.lock().await;
        store
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| FsError::io(p, e))?;
        store.write_all(data).await.map_err(|e| FsError::io(p, e))?;
        store.flush().await.map_err(|e| FsError::io(p, e))?;
        buf.len
            .fetch_max(offset + data.len() as u64, Ordering::AcqRel);
        Ok(data.len())
    }

    pub async fn read(&self, p: &str, offset: u64, size: u32) -> FsResult<Bytes> {
        let buf = self.require(p)?;
        let len = buf.len();
        if offset >= len || size == 0 {
            return Ok(Bytes::new());
        }
        let want = (size as u64).min(len - offset);
        let mut store = buf.store.lock().await;
        store
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| FsError::io(p, e))?;
        let mut out = Vec::with_capacity(want as usize);
        (&mut *store)
            .take(want)
            .read_to_end(&mut out)
            .await
            .map_err(|e| FsError::io(p, e))?;
        Ok(Bytes::from(out))
    }

    pub async fn truncate(&self, p: &str, size: u64) -> FsResult<()> {
        let buf = self.require(p)?;
        let store = buf.store.lock().await;
        store.set_len(size).await.map_err(|e| FsError::io(p, e))?;
        buf.len.store(size, Ordering::Release);
        Ok(())
    }

    /// Stream the staged bytes. Holds the store lock until the body is dropped.
    async fn staged_body(&self, p: &str, buf: &PendingUpload) -> FsResult<UploadBody> {
        let mut store = buf.store.clone().lock_owned().await;
        store.flush().await.map_err(|e| FsError::io(p, e))?;
        store
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| FsError::io(p, e))?;
        let len = buf.len();
        let reader = StagedReader(store).take(len);
        Ok(UploadBody::new(
            len,
            Box::pin(ReaderStream::with_capacity(reader, UPLOAD_CHUNK)),
        ))
    }

    async fn upload_staged(&self, key: &str, buf: &PendingUpload) -> FsResult<RemoteEntry> {
        let body = self.staged_body(key, buf).await?;
        info!(path = %key, bytes = body.len, parent = buf.parent_id, "uploading");
        let mut entry = self
            .client
            .upload(buf.parent_id, &buf.name, body)
            .await
            .map_err(|source| FsError::Remote {
                path: key.to_string(),
                source,
            })?;
        if entry.parent_id.is_none() {
            entry.parent_id = Some(buf.parent_id);
        }
        Ok(entry)
    }

    /// Upload the staged bytes as one object. The buffer is discarded either way.
    pub async fn commit(&self, p: &str) -> FsResult<RemoteEntry> {
        self.commit_with(p, Ok).await
    }

    /// Like `commit`, but runs `install` on the uploaded entry while the
    /// buffer is still registered, so the path never looks missing in between.
    pub async fn commit_with<T>(
        &self,
        p: &str,
        install: impl FnOnce(RemoteEntry) -> FsResult<T>,
    ) -> FsResult<T> {
        let key = path::normalize(p);
        let buf = self.require(&key)?;
        let result = self.upload_staged(&key, &buf).await.and_then(install);

        {
            let mut table = self.table();
            if table.get(&key).is_some_and(|cur| Arc::ptr_eq(cur, &buf)) {
                table.remove(&key);
            }
        }
        if let Err(e) = &result {
            warn!(path = %key, error = %e, "upload failed, staged data discarded");
        }
        result
    }
}

/// Read side of a staged file for the duration of an upload.
struct StagedReader(OwnedMutexGuard<tokio::fs::File>);

impl AsyncRead for StagedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut *this.0).poll_read(cx, buf)
    }
}
