//! Inode numbering for the path namespace.
//!
//! The kernel speaks inodes, the core speaks paths. Numbers are handed out on
//! first sight of a path and never reused, so an inode stays valid for the
//! whole mount even after the kernel forgets it.

use crate::meta::path;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

pub const ROOT_INODE: u64 = 1;

struct Table {
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,
    next: u64,
}

pub struct InodeTable {
    inner: RwLock<Table>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut paths = HashMap::new();
        let mut inodes = HashMap::new();
        paths.insert(ROOT_INODE, "/".to_string());
        inodes.insert("/".to_string(), ROOT_INODE);
        Self {
            inner: RwLock::new(Table {
                paths,
                inodes,
                next: ROOT_INODE + 1,
            }),
        }
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .paths
            .get(&ino)
            .cloned()
    }

    /// Path of `name` inside directory inode `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        self.path_of(parent).map(|dir| path::join(&dir, name))
    }

    /// Inode for `p`, allocating one on first use.
    pub fn inode_for(&self, p: &str) -> u64 {
        let key = path::normalize(p);
        if let Some(ino) = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .inodes
            .get(&key)
        {
            return *ino;
        }
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(ino) = table.inodes.get(&key) {
            return *ino;
        }
        let ino = table.next;
        table.next += 1;
        table.paths.insert(ino, key.clone());
        table.inodes.insert(key, ino);
        ino
    }

    /// Parent directory inode, the root being its own parent.
    pub fn parent_of(&self, ino: u64) -> u64 {
        match self.path_of(ino).as_deref().and_then(path::split) {
            Some((parent, _)) => self.inode_for(parent),
            None => ROOT_INODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inodes_are_stable_and_unique() {
        let table = InodeTable::new();
        assert_eq!(table.inode_for("/"), ROOT_INODE);
        let a = table.inode_for("/Movies");
        let b = table.inode_for("/Movies/a.mkv");
        assert_ne!(a, b);
        assert_eq!(table.inode_for("/Movies/"), a);
        assert_eq!(table.path_of(b).as_deref(), Some("/Movies/a.mkv"));
        assert_eq!(table.child_path(a, "x").as_deref(), Some("/Movies/x"));
        assert_eq!(table.child_path(ROOT_INODE, "x").as_deref(), Some("/x"));
        assert_eq!(table.parent_of(b), a);
        assert_eq!(table.parent_of(ROOT_INODE), ROOT_INODE);
        assert!(table.path_of(999).is_none());
    }
}
