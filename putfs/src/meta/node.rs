//! Remote node model and derived attributes.

use crate::cadapter::client::{NodeId, RemoteEntry};
use chrono::NaiveDateTime;
use std::time::{Duration, SystemTime};

pub use crate::cadapter::client::ROOT_ID;

const REMOTE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// One remote object as the cache sees it. Never mutated after construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub created_at: Option<SystemTime>,
}

/// Attributes handed to the kernel, before inode numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAttributes {
    pub kind: NodeKind,
    pub perm: u16,
    pub size: u64,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileAttributes {
    /// Attributes of a file that only exists in a write buffer so far.
    pub fn pending(len: u64, opened_at: SystemTime, now: SystemTime) -> Self {
        Self {
            kind: NodeKind::File,
            perm: 0o600,
            size: len,
            nlink: 1,
            atime: now,
            mtime: opened_at,
            ctime: opened_at,
        }
    }
}

impl RemoteNode {
    /// The root folder, synthesized locally.
    pub fn root() -> Self {
        Self {
            id: ROOT_ID,
            parent_id: None,
            name: String::new(),
            kind: NodeKind::Directory,
            size: 0,
            created_at: None,
        }
    }

    pub fn from_entry(entry: &RemoteEntry) -> Self {
        let kind = if entry.id == ROOT_ID || entry.is_directory() {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        let size = match kind {
            NodeKind::Directory => 0,
            NodeKind::File => entry.size.unwrap_or(0),
        };
        Self {
            id: entry.id,
            parent_id: if entry.id == ROOT_ID {
                None
            } else {
                entry.parent_id
            },
            name: entry.name.clone(),
            kind,
            size,
            created_at: entry.created_at.as_deref().and_then(parse_remote_time),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Pure attribute projection; `started_at` stands in for a missing creation time.
    pub fn attributes(&self, started_at: SystemTime, now: SystemTime) -> FileAttributes {
        let created = self.created_at.unwrap_or(started_at);
        let (perm, nlink) = match self.kind {
            NodeKind::Directory => (0o500, 2),
            NodeKind::File => (0o400, 1),
        };
        FileAttributes {
            kind: self.kind,
            perm,
            size: self.size,
            nlink,
            atime: now,
            mtime: created,
            ctime: created,
        }
    }
}

/// Parse the remote's `%Y-%m-%dT%H:%M:%S` UTC timestamps.
pub fn parse_remote_time(raw: &str) -> Option<SystemTime> {
    let parsed = NaiveDateTime::parse_from_str(raw, REMOTE_TIME_FORMAT).ok()?;
    let secs = parsed.and_utc().timestamp();
    if secs >= 0 {
        Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64))
    } else {
        SystemTime::UNIX_EPOCH.checked_sub(Duration::from_secs(secs.unsigned_abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_and_file_attributes() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(200);

        let dir = RemoteNode::from_entry(&RemoteEntry::directory(1, Some(0), "Movies"));
        let attr = dir.attributes(start, now);
        assert_eq!(attr.kind, NodeKind::Directory);
        assert_eq!(attr.perm, 0o500);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.mtime, start);
        assert_eq!(attr.atime, now);

        let file = RemoteNode::from_entry(
            &RemoteEntry::file(2, 1, "a.mkv", 1048576).with_created_at("2013-09-07T21:32:03"),
        );
        let attr = file.attributes(start, now);
        assert_eq!(attr.kind, NodeKind::File);
        assert_eq!(attr.perm, 0o400);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.size, 1048576);
        assert_eq!(
            attr.ctime,
            SystemTime::UNIX_EPOCH + Duration::from_secs(1378589523)
        );
    }

    #[test]
    fn root_entry_is_always_a_directory() {
        let entry = RemoteEntry {
            id: ROOT_ID,
            parent_id: Some(7),
            name: "Your Files".into(),
            content_type: None,
            size: Some(99),
            created_at: None,
        };
        let node = RemoteNode::from_entry(&entry);
        assert!(node.is_dir());
        assert_eq!(node.parent_id, None);
        assert_eq!(node.size, 0);
    }

    #[test]
    fn malformed_timestamp_is_ignored() {
        assert!(parse_remote_time("yesterday").is_none());
        let node = RemoteNode::from_entry(&RemoteEntry::file(3, 0, "x", 1).with_created_at("bad"));
        assert!(node.created_at.is_none());
    }

    #[test]
    fn pending_attributes_use_buffer_length() {
        let opened = SystemTime::UNIX_EPOCH + Duration::from_secs(5);
        let attr = FileAttributes::pending(42, opened, SystemTime::now());
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.size, 42);
        assert_eq!(attr.mtime, opened);
    }
}
