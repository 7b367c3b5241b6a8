//! End-to-end behavior of the path-based core against the in-memory remote.

use std::sync::Arc;
use std::time::Duration;

use putfs::cadapter::memory::{MemoryRemote, RemoteCall};
use putfs::error::FsError;
use putfs::meta::{NodeKind, ROOT_ID};
use putfs::vfs::{AccessMask, Mutation, PutFs};

struct Fixture {
    remote: Arc<MemoryRemote>,
    fs: Arc<PutFs<MemoryRemote>>,
    _spool: tempfile::TempDir,
}

fn fixture(remote: MemoryRemote) -> Fixture {
    let remote = Arc::new(remote);
    let spool = tempfile::tempdir().unwrap();
    let fs = Arc::new(PutFs::new(remote.clone(), Some(spool.path().to_path_buf())));
    Fixture {
        remote,
        fs,
        _spool: spool,
    }
}

/// Root with `Movies` (id 1) holding `a.mkv` (id 2, 1 MiB).
fn movies() -> Fixture {
    let remote = MemoryRemote::new();
    let movies = remote.add_dir(ROOT_ID, "Movies");
    remote.add_sized_file(movies, "a.mkv", 1048576);
    fixture(remote)
}

#[tokio::test]
async fn resolving_a_nested_file_lists_each_ancestor_once() {
    let f = movies();
    let node = f.fs.cache().resolve("/Movies/a.mkv").await.unwrap();
    assert_eq!(node.kind, NodeKind::File);
    assert_eq!(node.size, 1048576);
    assert_eq!(
        f.remote.calls(),
        vec![RemoteCall::ListChildren(ROOT_ID), RemoteCall::ListChildren(1)]
    );

    f.remote.clear_calls();
    f.fs.cache().resolve("/Movies/a.mkv").await.unwrap();
    f.fs.attributes("/Movies").await.unwrap();
    assert!(f.remote.calls().is_empty());
}

#[tokio::test]
async fn ranged_read_at_end_of_file() {
    let f = movies();
    f.fs.cache().resolve("/Movies/a.mkv").await.unwrap();
    f.remote.clear_calls();

    let data = f.fs.read("/Movies/a.mkv", 4096, 1044480).await.unwrap();
    assert_eq!(data.len(), 4096);
    assert_eq!(data[0], (1044480u64 % 251) as u8);
    assert_eq!(
        f.remote.calls(),
        vec![RemoteCall::DownloadRange {
            id: 2,
            start: 1044480,
            end: 1048576
        }]
    );
}

#[tokio::test]
async fn short_read_near_end_of_file() {
    let f = movies();
    let data = f.fs.read("/Movies/a.mkv", 4096, 1048000).await.unwrap();
    assert_eq!(data.len(), 576);
}

#[tokio::test]
async fn write_requires_create() {
    let f = movies();
    assert!(matches!(
        f.fs.write("/new.txt", 0, b"hello").await,
        Err(FsError::NotOpen(_))
    ));
    f.fs.create("/new.txt").await.unwrap();
    assert_eq!(f.fs.write("/new.txt", 0, b"hello").await.unwrap(), 5);
}

#[tokio::test]
async fn create_write_release_round_trip() {
    let f = movies();
    let payload = b"some bytes that go up in one piece";

    f.fs.create("/Movies/notes.txt").await.unwrap();
    f.fs.write("/Movies/notes.txt", 0, payload).await.unwrap();
    let listed = f.fs.list("/Movies").await.unwrap();
    assert!(listed.iter().any(|e| e.name == "notes.txt"));

    let committed = f.fs.release("/Movies/notes.txt").await.unwrap().unwrap();
    let listings_before = f.remote.listing_calls();

    let node = f.fs.cache().resolve("/Movies/notes.txt").await.unwrap();
    assert_eq!(node.id, committed.id);
    assert_eq!(node.size, payload.len() as u64);
    assert_eq!(f.remote.listing_calls(), listings_before);
    assert_eq!(
        f.remote.contents(node.id).as_deref(),
        Some(&payload[..])
    );

    // committed files are read from the remote like any other
    let attr = f.fs.attributes("/Movies/notes.txt").await.unwrap();
    assert_eq!(attr.perm, 0o400);
    let names: Vec<String> = f
        .fs
        .list("/Movies")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![".", "..", "a.mkv", "notes.txt"]);
}

#[tokio::test]
async fn write_access_is_denied_everywhere() {
    let f = movies();
    for p in ["/", "/Movies", "/Movies/a.mkv"] {
        assert!(
            matches!(
                f.fs.access(p, AccessMask::WRITE).await,
                Err(FsError::PermissionDenied(_))
            ),
            "{p}"
        );
    }
}

#[tokio::test]
async fn traversal_through_a_file_is_denied() {
    let remote = MemoryRemote::new();
    remote.add_file(ROOT_ID, "a", "not a dir");
    let f = fixture(remote);
    assert!(matches!(
        f.fs.access("/a/b", AccessMask::EXEC).await,
        Err(FsError::PermissionDenied(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_create_admits_one_writer() {
    let f = movies();
    let a = {
        let fs = f.fs.clone();
        tokio::spawn(async move { fs.create("/race.txt").await })
    };
    let b = {
        let fs = f.fs.clone();
        tokio::spawn(async move { fs.create("/race.txt").await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let open = results
        .iter()
        .filter(|r| matches!(r, Err(FsError::AlreadyOpen(_))))
        .count();
    assert_eq!((ok, open), (1, 1));
}

#[tokio::test]
async fn rmdir_is_read_only() {
    let f = movies();
    for p in ["/Movies", "/does/not/exist"] {
        assert!(matches!(
            f.fs.reject::<()>(Mutation::Rmdir, p),
            Err(FsError::ReadOnly(_))
        ));
    }
}

#[tokio::test]
async fn failed_upload_discards_the_buffer() {
    let f = movies();
    f.fs.create("/up.bin").await.unwrap();
    f.fs.write("/up.bin", 0, b"data").await.unwrap();
    f.remote.fail_next_upload();

    let err = f.fs.release("/up.bin").await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    assert!(!f.fs.buffers().contains("/up.bin"));
    assert!(matches!(
        f.fs.attributes("/up.bin").await,
        Err(FsError::NotFound(_))
    ));
    // the name is free again
    f.fs.create("/up.bin").await.unwrap();
}

#[tokio::test]
async fn failed_listing_can_be_retried() {
    let f = movies();
    f.remote.fail_next_listing(1);
    let err = f.fs.list("/Movies").await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);

    let names: Vec<String> = f
        .fs
        .list("/Movies")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![".", "..", "a.mkv"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lookups_share_one_listing() {
    let f = movies();
    f.remote.set_list_delay(Duration::from_millis(30));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let fs = f.fs.clone();
        tasks.push(tokio::spawn(async move {
            fs.attributes("/Movies/a.mkv").await
        }));
    }
    for t in tasks {
        assert_eq!(t.await.unwrap().unwrap().size, 1048576);
    }
    assert_eq!(f.remote.listing_calls(), 2);
}

#[tokio::test]
async fn releasing_a_huge_sparse_file_fails_with_eio() {
    let f = movies();
    f.remote.set_upload_limit(1 << 30);
    f.fs.create("/big.bin").await.unwrap();
    f.fs.write("/big.bin", 1 << 40, b"x").await.unwrap();
    assert_eq!(f.fs.attributes("/big.bin").await.unwrap().size, (1 << 40) + 1);

    let err = f.fs.release("/big.bin").await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    assert!(!f.fs.buffers().contains("/big.bin"));
    assert!(matches!(
        f.fs.attributes("/big.bin").await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_stays_visible_while_being_released() {
    let f = movies();
    f.fs.create("/Movies/live.txt").await.unwrap();
    f.fs.write("/Movies/live.txt", 0, &[7u8; 4096]).await.unwrap();

    let watcher = {
        let fs = f.fs.clone();
        tokio::spawn(async move {
            for _ in 0..500 {
                let attr = fs.attributes("/Movies/live.txt").await.unwrap();
                assert_eq!(attr.size, 4096);
                tokio::task::yield_now().await;
            }
        })
    };
    f.fs.release("/Movies/live.txt").await.unwrap().unwrap();
    watcher.await.unwrap();
}
