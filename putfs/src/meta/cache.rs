//! Path cache: lazily populated map from normalized path to remote node.
//!
//! A directory's children are listed from the remote at most once per process.
//! The listing happens outside the state lock and is installed in a single
//! write-lock section, so a failed or partial fetch never leaves a directory
//! half populated. Concurrent first listings of one directory are coalesced
//! through a per-directory async fetch lock.

use crate::cadapter::client::{NodeId, RemoteClient};
use crate::error::{FsError, FsResult};
use crate::meta::node::{NodeKind, ROOT_ID, RemoteNode};
use crate::meta::path;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Children state of one directory node.
#[derive(Clone, Debug)]
pub enum ChildrenState {
    Unfetched,
    Loaded(Arc<Vec<Arc<RemoteNode>>>),
}

#[derive(Default)]
struct CacheState {
    by_path: HashMap<String, Arc<RemoteNode>>,
    path_by_id: HashMap<NodeId, String>,
    children: HashMap<NodeId, Arc<Vec<Arc<RemoteNode>>>>,
}

impl CacheState {
    fn install(&mut self, path: String, node: Arc<RemoteNode>) {
        self.path_by_id.insert(node.id, path.clone());
        self.by_path.insert(path, node);
    }
}

pub struct PathCache<C: RemoteClient> {
    client: Arc<C>,
    state: RwLock<CacheState>,
    fetch_locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<C: RemoteClient> PathCache<C> {
    /// Build a cache holding only the locally synthesized root.
    pub fn new(client: Arc<C>) -> Self {
        let mut state = CacheState::default();
        state.install("/".to_string(), Arc::new(RemoteNode::root()));
        Self {
            client,
            state: RwLock::new(state),
            fetch_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check the root against the remote. Used once at mount to validate credentials.
    pub async fn fetch_root(&self) -> FsResult<Arc<RemoteNode>> {
        let entry = self
            .client
            .fetch_metadata(ROOT_ID)
            .await
            .map_err(|e| FsError::from_remote("/", e))?;
        info!(name = %entry.name, "remote root reachable");
        Ok(self.get("/").unwrap_or_else(|| Arc::new(RemoteNode::root())))
    }

    /// Cache-only lookup.
    pub fn get(&self, p: &str) -> Option<Arc<RemoteNode>> {
        self.read_state().by_path.get(&path::normalize(p)).cloned()
    }

    pub fn path_of(&self, id: NodeId) -> Option<String> {
        self.read_state().path_by_id.get(&id).cloned()
    }

    pub fn children_state(&self, id: NodeId) -> ChildrenState {
        match self.read_state().children.get(&id) {
            Some(list) => ChildrenState::Loaded(list.clone()),
            None => ChildrenState::Unfetched,
        }
    }

    pub fn len(&self) -> usize {
        self.read_state().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a path to its node, listing missing ancestors on the way down.
    pub async fn resolve(&self, p: &str) -> FsResult<Arc<RemoteNode>> {
        let target = path::normalize(p);
        if let Some(node) = self.get(&target) {
            return Ok(node);
        }

        let mut cur = self
            .get("/")
            .ok_or_else(|| FsError::NotFound("/".to_string()))?;
        let mut cur_path = String::from("/");
        for part in path::components(&target) {
            let next_path = path::join(&cur_path, part);
            let cached = self.read_state().by_path.get(&next_path).cloned();
            let next = match cached {
                Some(node) => node,
                None => {
                    if cur.kind != NodeKind::Directory {
                        return Err(FsError::NotFound(target.clone()));
                    }
                    self.children_of(&cur).await?;
                    self.read_state()
                        .by_path
                        .get(&next_path)
                        .cloned()
                        .ok_or_else(|| FsError::NotFound(target.clone()))?
                }
            };
            cur = next;
            cur_path = next_path;
        }
        Ok(cur)
    }

    fn fetch_lock(&self, id: NodeId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .fetch_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn drop_fetch_lock(&self, id: NodeId) {
        self.fetch_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Ordered children of a directory, listing it from the remote on first use.
    pub async fn children_of(&self, node: &RemoteNode) -> FsResult<Arc<Vec<Arc<RemoteNode>>>> {
        let dir_path = self
            .path_of(node.id)
            .ok_or_else(|| FsError::NotFound(format!("<node {}>", node.id)))?;
        if node.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory(dir_path));
        }
        if let ChildrenState::Loaded(list) = self.children_state(node.id) {
            return Ok(list);
        }

        let lock = self.fetch_lock(node.id);
        let _guard = lock.lock().await;
        // Another task may have finished the listing while we waited.
        if let ChildrenState::Loaded(list) = self.children_state(node.id) {
            return Ok(list);
        }

        debug!(dir = %dir_path, id = node.id, "listing remote directory");
        let entries = self
            .client
            .list_children(node.id)
            .await
            .map_err(|e| FsError::from_remote(dir_path.clone(), e))?;

        let children: Vec<Arc<RemoteNode>> = entries
            .iter()
            .filter(|e| e.id != ROOT_ID)
            .map(|e| Arc::new(RemoteNode::from_entry(e)))
            .collect();
        let list = Arc::new(children);
        {
            let mut state = self.write_state();
            for child in list.iter() {
                state.install(path::join(&dir_path, &child.name), child.clone());
            }
            state.children.insert(node.id, list.clone());
        }
        self.drop_fetch_lock(node.id);
        debug!(dir = %dir_path, count = list.len(), "directory populated");
        Ok(list)
    }

    /// Register a freshly uploaded node under its parent without a remote fetch.
    pub fn insert(&self, node: RemoteNode) -> FsResult<Arc<RemoteNode>> {
        let parent_id = node
            .parent_id
            .ok_or_else(|| FsError::NotFound(node.name.clone()))?;
        let node = Arc::new(node);
        let mut state = self.write_state();
        let parent_path = state
            .path_by_id
            .get(&parent_id)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("<node {parent_id}>")))?;
        let full = path::join(&parent_path, &node.name);

        if let Some(old) = state.by_path.get(&full).cloned() {
            state.path_by_id.remove(&old.id);
        }
        state.install(full, node.clone());
        if let Some(list) = state.children.get(&parent_id) {
            let mut updated: Vec<Arc<RemoteNode>> = list
                .iter()
                .filter(|c| c.name != node.name)
                .cloned()
                .collect();
            updated.push(node.clone());
            state.children.insert(parent_id, Arc::new(updated));
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::client::RemoteEntry;
    use crate::cadapter::memory::{MemoryRemote, RemoteCall};
    use std::time::Duration;

    fn tree() -> (Arc<MemoryRemote>, NodeId, NodeId) {
        let remote = Arc::new(MemoryRemote::new());
        let movies = remote.add_dir(ROOT_ID, "Movies");
        let file = remote.add_file(movies, "a.mkv", "abc");
        remote.add_file(ROOT_ID, "notes.txt", "n");
        (remote, movies, file)
    }

    #[tokio::test]
    async fn resolve_populates_ancestors_once() {
        let (remote, movies, file) = tree();
        let cache = PathCache::new(remote.clone());

        let node = cache.resolve("/Movies/a.mkv").await.unwrap();
        assert_eq!(node.id, file);
        assert!(cache.get("/Movies").is_some());
        assert_eq!(
            remote.calls(),
            vec![RemoteCall::ListChildren(ROOT_ID), RemoteCall::ListChildren(movies)]
        );

        remote.clear_calls();
        cache.resolve("/Movies/a.mkv").await.unwrap();
        cache.resolve("/notes.txt").await.unwrap();
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn root_needs_no_remote_call() {
        let (remote, _, _) = tree();
        let cache = PathCache::new(remote.clone());
        let root = cache.resolve("/").await.unwrap();
        assert!(root.is_dir());
        assert_eq!(cache.len(), 1);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_and_below_file_are_not_found() {
        let (remote, _, _) = tree();
        let cache = PathCache::new(remote.clone());
        assert!(matches!(cache.resolve("/nope").await, Err(FsError::NotFound(_))));
        assert!(matches!(
            cache.resolve("/notes.txt//deeper/").await,
            Err(FsError::NotFound(p)) if p == "/notes.txt/deeper"
        ));
        // the root was listed once, the file never
        assert_eq!(remote.listing_calls(), 1);
    }

    #[tokio::test]
    async fn children_of_file_is_not_a_directory() {
        let (remote, _, _) = tree();
        let cache = PathCache::new(remote.clone());
        let file = cache.resolve("/notes.txt").await.unwrap();
        remote.clear_calls();
        assert!(matches!(
            cache.children_of(&file).await,
            Err(FsError::NotADirectory(_))
        ));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn children_listed_once_in_remote_order() {
        let (remote, _, _) = tree();
        let cache = PathCache::new(remote.clone());
        let root = cache.resolve("/").await.unwrap();
        let first = cache.children_of(&root).await.unwrap();
        let second = cache.children_of(&root).await.unwrap();
        let names: Vec<&str> = first.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Movies", "notes.txt"]);
        assert_eq!(second.len(), 2);
        assert_eq!(remote.listing_calls(), 1);
    }

    #[tokio::test]
    async fn failed_listing_leaves_directory_unfetched() {
        let (remote, _, _) = tree();
        let cache = PathCache::new(remote.clone());
        remote.fail_next_listing(ROOT_ID);
        assert!(matches!(
            cache.resolve("/Movies").await,
            Err(FsError::Remote { .. })
        ));
        assert!(matches!(cache.children_state(ROOT_ID), ChildrenState::Unfetched));
        assert_eq!(cache.len(), 1);

        cache.resolve("/Movies").await.unwrap();
        assert_eq!(remote.listing_calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_first_listing_is_coalesced() {
        let (remote, _, _) = tree();
        remote.set_list_delay(Duration::from_millis(50));
        let cache = Arc::new(PathCache::new(remote.clone()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.resolve("/notes.txt").await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(remote.listing_calls(), 1);
    }

    #[tokio::test]
    async fn insert_appends_to_loaded_listing() {
        let (remote, movies, _) = tree();
        let cache = PathCache::new(remote.clone());
        let dir = cache.resolve("/Movies").await.unwrap();
        cache.children_of(&dir).await.unwrap();

        let entry = RemoteEntry::file(99, movies, "new.txt", 5);
        cache.insert(RemoteNode::from_entry(&entry)).unwrap();

        let node = cache.get("/Movies/new.txt").unwrap();
        assert_eq!(node.size, 5);
        assert_eq!(cache.path_of(99).as_deref(), Some("/Movies/new.txt"));
        match cache.children_state(movies) {
            ChildrenState::Loaded(list) => {
                assert_eq!(list.last().map(|c| c.id), Some(99));
            }
            ChildrenState::Unfetched => panic!("listing should stay loaded"),
        }
    }

    #[tokio::test]
    async fn insert_replaces_same_named_sibling() {
        let (remote, movies, file) = tree();
        let cache = PathCache::new(remote.clone());
        let dir = cache.resolve("/Movies").await.unwrap();
        cache.children_of(&dir).await.unwrap();

        let entry = RemoteEntry::file(77, movies, "a.mkv", 9);
        cache.insert(RemoteNode::from_entry(&entry)).unwrap();
        assert_eq!(cache.get("/Movies/a.mkv").map(|n| n.id), Some(77));
        assert_eq!(cache.path_of(file), None);
        if let ChildrenState::Loaded(list) = cache.children_state(movies) {
            assert_eq!(list.len(), 1);
        }
    }

    #[tokio::test]
    async fn insert_into_unfetched_directory_keeps_it_unfetched() {
        let (remote, movies, _) = tree();
        let cache = PathCache::new(remote.clone());
        cache.resolve("/Movies").await.unwrap();

        let entry = RemoteEntry::file(55, movies, "b.txt", 1);
        cache.insert(RemoteNode::from_entry(&entry)).unwrap();
        assert!(matches!(cache.children_state(movies), ChildrenState::Unfetched));
        assert!(cache.get("/Movies/b.txt").is_some());
    }
}
