//! FUSE adapter and request handling
//!
//! Exposes `PutFs` to the kernel through the rfuse3 raw (inode based) API.
//! Inodes are mapped to paths by `inode::InodeTable`; every callback turns
//! its inode arguments into paths and delegates to the path-based core.
//!
//! Main components:
//! - `inode`: inode <-> path numbering
//! - `mount`: mount option building and session start
//! - The `Filesystem` implementation for `PutFuse`, plus helpers converting
//!   core attributes and errors into rfuse3 replies and errnos.
pub mod inode;
pub mod mount;

use crate::cadapter::client::RemoteClient;
use crate::error::FsError;
use crate::meta::node::{FileAttributes, NodeKind};
use crate::vfs::fs::{AccessMask, Mutation, PutFs, STAT_BLOCK_SIZE};
use inode::InodeTable;
use rfuse3::Result as FuseResult;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite, ReplyXAttr,
};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use rfuse3::raw::Filesystem;
use rfuse3::{Errno, FileType as FuseFileType, SetAttr, Timestamp};
use tracing::{debug, warn};

pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_WRITE: u32 = 1024 * 1024;

/// The kernel-facing side of a mounted put.io tree.
pub struct PutFuse<C: RemoteClient> {
    fs: Arc<PutFs<C>>,
    inodes: InodeTable,
    attr_ttl: Duration,
    max_write: u32,
}

impl<C: RemoteClient> PutFuse<C> {
    pub fn new(fs: Arc<PutFs<C>>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
            attr_ttl: DEFAULT_ATTR_TTL,
            max_write: DEFAULT_MAX_WRITE,
        }
    }

    pub fn with_attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    fn path(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path_of(ino).ok_or_else(|| libc::ENOENT.into())
    }

    fn child(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        self.inodes
            .child_path(parent, &name.to_string_lossy())
            .ok_or_else(|| libc::ENOENT.into())
    }

    async fn entry(&self, p: &str, req: &Request) -> FuseResult<ReplyEntry> {
        let attr = self.fs.attributes(p).await.map_err(to_errno)?;
        let ino = self.inodes.inode_for(p);
        Ok(ReplyEntry {
            ttl: self.attr_ttl,
            attr: to_fuse_attr(ino, &attr, req),
            generation: 0,
        })
    }

    /// Read-only rejection for callbacks addressed by parent + name.
    fn reject_child<T>(&self, op: Mutation, parent: u64, name: &OsStr) -> FuseResult<T> {
        let p = self.child(parent, name)?;
        self.fs.reject(op, &p).map_err(to_errno)
    }

    fn reject_inode<T>(&self, op: Mutation, ino: u64) -> FuseResult<T> {
        let p = self.path(ino)?;
        self.fs.reject(op, &p).map_err(to_errno)
    }

    /// Upload `p` if `fh` is the handle that created it.
    async fn commit_owned(&self, p: &str, fh: u64) -> FuseResult<()> {
        match self.fs.release_handle(p, fh).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(path = %p, error = %e, "upload on close failed");
                Err(to_errno(e))
            }
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use super::*;
    use crate::cadapter::memory::MemoryRemote;
    use crate::fuse::mount::{MountConfig, mount_putfs};
    use crate::meta::node::ROOT_ID;
    use std::fs;
    use std::io::Write;

    // Mount smoke test on Linux; gated behind PUTFS_FUSE_TEST
    #[tokio::test]
    async fn smoke_mount_and_basic_ops() {
        if std::env::var("PUTFS_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set PUTFS_FUSE_TEST=1 to enable");
            return;
        }

        let remote = Arc::new(MemoryRemote::new());
        let movies = remote.add_dir(ROOT_ID, "Movies");
        remote.add_file(movies, "a.txt", "hello");
        let spool = tempfile::tempdir().expect("tmp spool");
        let fs = Arc::new(PutFs::new(remote.clone(), Some(spool.path().to_path_buf())));

        let mnt = tempfile::tempdir().expect("tmp mount");
        let mnt_path = mnt.path().to_path_buf();
        let handle = match mount_putfs(PutFuse::new(fs), &mnt_path, &MountConfig::default()).await
        {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {}", e);
                return;
            }
        };

        // let the kernel finish INIT
        tokio::time::sleep(Duration::from_millis(2000)).await;

        let content = fs::read(mnt_path.join("Movies/a.txt")).expect("read remote file");
        assert_eq!(content, b"hello");

        let names = fs::read_dir(mnt_path.join("Movies"))
            .expect("readdir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect::<Vec<_>>();
        assert!(names.iter().any(|n| n.to_string_lossy() == "a.txt"));

        {
            let mut f = fs::File::create(mnt_path.join("new.txt")).expect("create file");
            f.write_all(b"abc").expect("write");
        }
        assert_eq!(fs::read(mnt_path.join("new.txt")).expect("read back"), b"abc");

        let err = fs::remove_dir(mnt_path.join("Movies")).expect_err("rmdir must fail");
        assert_eq!(err.raw_os_error(), Some(libc::EROFS));

        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {}", e);
        }
    }
}

impl<C> Filesystem for PutFuse<C>
where
    C: RemoteClient + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(self.max_write).unwrap_or(NonZeroU32::MIN);
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        debug!("fuse session destroyed");
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let p = self.child(parent, name)?;
        self.entry(&p, &req).await
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let p = self.path(ino)?;
        let attr = self.fs.attributes(&p).await.map_err(to_errno)?;
        Ok(ReplyAttr {
            ttl: self.attr_ttl,
            attr: to_fuse_attr(ino, &attr, &req),
        })
    }

    // Only size changes on a file being written are honored.
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let p = self.path(ino)?;
        let pending = self.fs.buffers().contains(&p);
        if let Some(size) = set_attr.size {
            self.fs.truncate(&p, size).await.map_err(to_errno)?;
        }
        if !pending {
            if set_attr.mode.is_some() {
                return self.reject_inode(Mutation::Chmod, ino);
            }
            if set_attr.uid.is_some() || set_attr.gid.is_some() {
                return self.reject_inode(Mutation::Chown, ino);
            }
            if set_attr.atime.is_some() || set_attr.mtime.is_some() {
                return self.reject_inode(Mutation::Utimens, ino);
            }
        }
        let attr = self.fs.attributes(&p).await.map_err(to_errno)?;
        Ok(ReplyAttr {
            ttl: self.attr_ttl,
            attr: to_fuse_attr(ino, &attr, &req),
        })
    }

    async fn access(&self, _req: Request, ino: u64, mask: u32) -> FuseResult<()> {
        let p = self.path(ino)?;
        self.fs
            .access(&p, AccessMask::from_bits_truncate(mask))
            .await
            .map_err(to_errno)
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let p = self.path(ino)?;
        let fh = self.fs.open(&p, flags).await.map_err(to_errno)?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let p = self.path(ino)?;
        let fh = self.fs.open_dir(&p).await.map_err(to_errno)?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let p = self.path(ino)?;
        let data = self.fs.read(&p, size, offset).await.map_err(to_errno)?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let p = self.path(ino)?;
        let n = self.fs.write(&p, offset, data).await.map_err(to_errno)?;
        Ok(ReplyWrite { written: n as u32 })
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let p = self.child(parent, name)?;
        let fh = self.fs.create(&p).await.map_err(to_errno)?;
        let attr = self.fs.attributes(&p).await.map_err(to_errno)?;
        let ino = self.inodes.inode_for(&p);
        Ok(ReplyCreated {
            ttl: self.attr_ttl,
            attr: to_fuse_attr(ino, &attr, &req),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    // Closing the creating handle uploads the file. FLUSH runs first and its
    // result reaches close(2); by RELEASE the buffer is normally gone already.
    async fn release(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        let p = self.path(inode)?;
        self.commit_owned(&p, fh).await
    }

    async fn flush(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        let p = self.path(inode)?;
        self.commit_owned(&p, fh).await
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let p = self.path(ino)?;
        let listing = self.fs.list(&p).await.map_err(to_errno)?;
        let parent_ino = self.inodes.parent_of(ino);

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(listing.len());
        for (i, e) in listing.into_iter().enumerate() {
            let inode = match e.name.as_str() {
                "." => ino,
                ".." => parent_ino,
                name => self.inodes.inode_for(&crate::meta::path::join(&p, name)),
            };
            all.push(DirectoryEntry {
                inode,
                kind: to_fuse_kind(e.kind),
                name: OsString::from(e.name),
                offset: (i as i64) + 1,
            });
        }

        // offset is the last entry the kernel has already seen
        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all.split_off(start)
        };
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let p = self.path(ino)?;
        let listing = self.fs.list(&p).await.map_err(to_errno)?;
        let parent_ino = self.inodes.parent_of(ino);
        let parent_path = self.path(parent_ino)?;

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(listing.len());
        for (i, e) in listing.into_iter().enumerate() {
            let (inode, entry_path) = match e.name.as_str() {
                "." => (ino, p.clone()),
                ".." => (parent_ino, parent_path.clone()),
                name => {
                    let child = crate::meta::path::join(&p, name);
                    (self.inodes.inode_for(&child), child)
                }
            };
            // A pending entry can vanish between the listing and here.
            let attr = match self.fs.attributes(&entry_path).await {
                Ok(attr) => attr,
                Err(FsError::NotFound(_)) => continue,
                Err(err) => return Err(to_errno(err)),
            };
            all.push(DirectoryEntryPlus {
                inode,
                generation: 0,
                kind: to_fuse_kind(e.kind),
                name: OsString::from(e.name),
                offset: (i as i64) + 1,
                attr: to_fuse_attr(inode, &attr, &req),
                entry_ttl: self.attr_ttl,
                attr_ttl: self.attr_ttl,
            });
        }

        let start = offset as usize;
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all.split_off(start)
        };
        let boxed: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let stats = self.fs.statfs().await.map_err(to_errno)?;
        Ok(ReplyStatFs {
            blocks: stats.blocks,
            bfree: stats.blocks_free,
            bavail: stats.blocks_available,
            files: stats.files,
            ffree: stats.files_free,
            bsize: stats.block_size,
            namelen: stats.name_max,
            frsize: stats.block_size,
        })
    }

    // ===== structural mutations: the remote tree is read-only =====
    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        self.reject_child(Mutation::Mkdir, parent, name)
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        self.reject_child(Mutation::Mknod, parent, name)
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        self.reject_child(Mutation::Unlink, parent, name)
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        self.reject_child(Mutation::Rmdir, parent, name)
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        self.reject_child(Mutation::Symlink, parent, name)
    }

    async fn link(
        &self,
        _req: Request,
        _inode: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        self.reject_child(Mutation::Link, new_parent, new_name)
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> FuseResult<()> {
        self.reject_child(Mutation::Rename, parent, name)
    }

    async fn setxattr(
        &self,
        _req: Request,
        inode: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> FuseResult<()> {
        self.reject_inode(Mutation::SetXattr, inode)
    }

    async fn removexattr(&self, _req: Request, inode: u64, _name: &OsStr) -> FuseResult<()> {
        self.reject_inode(Mutation::RemoveXattr, inode)
    }

    async fn getxattr(
        &self,
        _req: Request,
        inode: u64,
        _name: &OsStr,
        _size: u32,
    ) -> FuseResult<ReplyXAttr> {
        let p = self.path(inode)?;
        self.fs
            .getxattr(&p)
            .await
            .map(ReplyXAttr::Data)
            .map_err(to_errno)
    }

    async fn listxattr(&self, _req: Request, inode: u64, _size: u32) -> FuseResult<ReplyXAttr> {
        let p = self.path(inode)?;
        self.fs
            .listxattr(&p)
            .await
            .map(ReplyXAttr::Data)
            .map_err(to_errno)
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

// =============== helpers ===============
pub fn to_errno(e: FsError) -> Errno {
    debug!(error = %e, "fuse request failed");
    e.errno().into()
}

fn to_fuse_kind(k: NodeKind) -> FuseFileType {
    match k {
        NodeKind::Directory => FuseFileType::Directory,
        NodeKind::File => FuseFileType::RegularFile,
    }
}

fn to_fuse_attr(ino: u64, a: &FileAttributes, req: &Request) -> rfuse3::raw::reply::FileAttr {
    let blocks = a.size.div_ceil(STAT_BLOCK_SIZE as u64);
    rfuse3::raw::reply::FileAttr {
        ino,
        size: a.size,
        blocks,
        atime: Timestamp::from(a.atime),
        mtime: Timestamp::from(a.mtime),
        ctime: Timestamp::from(a.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(a.ctime),
        kind: to_fuse_kind(a.kind),
        perm: a.perm,
        nlink: a.nlink,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: STAT_BLOCK_SIZE,
    }
}
