//! Persistence across sessions: full syncs, crash replay from the metadata
//! cache, and rejection of damaged or foreign metadata.

mod common;

use std::io::Read;

use cfat_fs::{prehash, DirentId, Permission, EVERYBODY_GROUP, ROOT_USER};
use common::{pattern, Harness};

/// Everything survives a clean close and reopen.
#[test]
fn reopen_after_close() {
    let h = Harness::new();
    let (alice, dir, file) = {
        let fs = h.create();
        let alice = fs
            .add_user(ROOT_USER, "alice", &prehash("alice", "pw"))
            .unwrap();
        let dir = fs
            .mkdir(ROOT_USER, "docs", &DirentId::root(), &[Permission::new(EVERYBODY_GROUP, true, true)])
            .unwrap();
        let file = fs.put(alice, "a.txt", &dir, pattern(300).as_slice(), &[]).unwrap();
        fs.close().unwrap();
        (alice, dir, file)
    };
    assert!(!h.registry.is_active("memory:test"), "close releases the cache");

    let fs = h.open().unwrap();
    assert_eq!(fs.authenticate("alice", &prehash("alice", "pw")).unwrap(), alice);
    assert_eq!(fs.lookup(alice, "/docs/a.txt").unwrap().id, file);
    assert_eq!(fs.list(alice, &dir).unwrap().len(), 1);

    let mut out = Vec::new();
    fs.read(alice, &file).unwrap().read_to_end(&mut out).unwrap();
    assert_eq!(out, pattern(300));
}

/// Dropping without close still syncs.
#[test]
fn drop_syncs() {
    let h = Harness::new();
    {
        let fs = h.create();
        fs.mkdir(ROOT_USER, "kept", &DirentId::root(), &[]).unwrap();
        assert_eq!(fs.pending_changes(), 1);
    }
    let fs = h.open().unwrap();
    assert!(fs.lookup(ROOT_USER, "kept").is_ok());
    assert_eq!(fs.pending_changes(), 0);
}

/// Changes made by a process that died before syncing are replayed from
/// the cache side file on the next open.
#[test]
fn crash_replays_cache() {
    let h = Harness::new();
    let fs = h.create();
    let bob = fs.add_user(ROOT_USER, "bob", &prehash("bob", "pw")).unwrap();
    let d = fs.mkdir(ROOT_USER, "d", &DirentId::root(), &[]).unwrap();
    fs.chown(ROOT_USER, &d, bob).unwrap();
    let gone = fs.mkdir(bob, "gone", &d, &[]).unwrap();
    fs.remove(bob, &gone, false).unwrap();
    let g = fs.add_group(bob, "team").unwrap();
    assert!(fs.pending_changes() > 0);

    // the tables on the backend still describe the freshly created filesystem
    let stale_fat = h.conn.raw("meta/fat").unwrap();

    // simulate a crash: no sync, no drop, cache lease never released
    std::mem::forget(fs);
    assert_eq!(h.conn.raw("meta/fat").unwrap(), stale_fat);
    assert!(h.open().unwrap_err().is_illegal(), "same process still holds the cache");

    let fs = h.open_fresh_process().unwrap();
    assert_eq!(fs.pending_changes(), 0, "replay is folded into a full sync");
    assert_ne!(h.conn.raw("meta/fat").unwrap(), stale_fat);
    assert_eq!(fs.authenticate("bob", &prehash("bob", "pw")).unwrap(), bob);
    assert_eq!(fs.entry(ROOT_USER, &d).unwrap().owner, bob);
    assert!(fs.entry(ROOT_USER, &gone).unwrap_err().is_illegal());
    assert_eq!(fs.group_by_name("team").unwrap().id, g);
}

/// Periodic syncs keep the cache short.
#[test]
fn periodic_sync() {
    let h = Harness::new().with_sync_every(3);
    let fs = h.create();
    fs.mkdir(ROOT_USER, "a", &DirentId::root(), &[]).unwrap();
    fs.mkdir(ROOT_USER, "b", &DirentId::root(), &[]).unwrap();
    assert_eq!(fs.pending_changes(), 2);
    fs.mkdir(ROOT_USER, "c", &DirentId::root(), &[]).unwrap();
    assert_eq!(fs.pending_changes(), 0);
}

/// Only one engine per backend in a process.
#[test]
fn second_open_refused() {
    let h = Harness::new();
    let fs = h.create();
    assert!(h.open().unwrap_err().is_illegal());
    drop(fs);
    h.open().unwrap();
}

#[test]
fn open_without_filesystem() {
    let h = Harness::new();
    assert!(h.open().unwrap_err().is_illegal());
}

/// A damaged table is corrupt data, not a silent reset.
#[test]
fn corrupt_fat_refused() {
    let h = Harness::new();
    drop(h.create());
    let mut raw = h.conn.raw("meta/fat").unwrap();
    let mid = raw.len() / 2;
    raw[mid] ^= 0xff;
    h.conn.set_raw("meta/fat", raw);

    let err = h.open().unwrap_err();
    assert!(err.is_corrupt(), "{err}");
}

#[test]
fn empty_user_table_refused() {
    let h = Harness::new();
    drop(h.create());
    h.conn.set_raw("meta/users", Vec::new());
    assert!(h.open().unwrap_err().is_corrupt());
}

/// Opening with the wrong volume key fails on the first table.
#[test]
fn wrong_key_refused() {
    let h = Harness::new();
    drop(h.create());
    let err = h.open_with(&h.registry, 2).unwrap_err();
    assert!(err.is_corrupt(), "{err}");
    assert!(!h.registry.is_active("memory:test"));
}

/// Tables are resealed under a new salt on every sync.
#[test]
fn sync_reseals_tables() {
    let h = Harness::new();
    let fs = h.create();
    let first = h.conn.raw("meta/groups").unwrap();
    fs.sync().unwrap();
    let second = h.conn.raw("meta/groups").unwrap();
    assert_ne!(first, second);
    assert_eq!(first.len(), second.len());
}

/// A cache left by an earlier filesystem under another key does not block
/// creating a new one on a backend with the same identity.
#[test]
fn create_discards_stale_cache() {
    let h = Harness::new();
    let fs = h.create();
    fs.mkdir(ROOT_USER, "old", &DirentId::root(), &[]).unwrap();
    std::mem::forget(fs);

    let fresh = cfat_storage::MemoryConnector::new("test");
    let fs = cfat_fs::Filesystem::create(
        std::sync::Arc::new(fresh),
        common::cipher(2),
        common::base_iv(),
        h.opts(),
        &cfat_fs::CacheRegistry::new(),
        &prehash("root", "other"),
    )
    .unwrap();
    assert_eq!(fs.pending_changes(), 0);
    assert!(fs.lookup(ROOT_USER, "old").unwrap_err().is_illegal());
}

fn content_keys(h: &Harness) -> Vec<String> {
    h.conn
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("content/"))
        .collect()
}

/// Replacing a file whose metadata change cannot be cached leaves the
/// previous version in place and readable; the next replace that does
/// commit removes the superseded blob.
#[test]
fn failed_metadata_write_keeps_old_version() {
    let h = Harness::new();
    let fs = h.create();
    let f = fs.put(ROOT_USER, "f", &DirentId::root(), &b"hello world"[..], &[]).unwrap();
    fs.sync().unwrap();
    let v1_keys = content_keys(&h);
    assert_eq!(v1_keys.len(), 1);

    let cache = fs.cache_path().to_path_buf();
    std::fs::create_dir(&cache).unwrap();
    assert!(fs.put(ROOT_USER, "f", &DirentId::root(), &b"v2"[..], &[]).is_err());
    assert_eq!(fs.entry(ROOT_USER, &f).unwrap().size, 11);
    assert_eq!(content_keys(&h), v1_keys, "no blob left behind, none lost");
    std::fs::remove_dir(&cache).unwrap();

    let mut old = Vec::new();
    fs.read(ROOT_USER, &f).unwrap().read_to_end(&mut old).unwrap();
    assert_eq!(old, b"hello world");

    let same = fs.put(ROOT_USER, "f", &DirentId::root(), &b"v3"[..], &[]).unwrap();
    assert_eq!(same, f);
    let v3_keys = content_keys(&h);
    assert_eq!(v3_keys.len(), 1);
    assert_ne!(v3_keys, v1_keys);
    let mut new = Vec::new();
    fs.read(ROOT_USER, &f).unwrap().read_to_end(&mut new).unwrap();
    assert_eq!(new, b"v3");

    drop(fs);
    let fs = h.open().unwrap();
    let mut reopened = Vec::new();
    fs.read(ROOT_USER, &f).unwrap().read_to_end(&mut reopened).unwrap();
    assert_eq!(reopened, b"v3");
}
