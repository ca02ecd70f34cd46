//! Traversal, firstkey/nextkey, and tombstone reclamation.

use std::collections::HashSet;
use std::path::Path;

use tdb::{Flags, StoreMode, Tdb};

fn open_new(path: &Path, hash_size: u32) -> Tdb {
    Tdb::open(
        path,
        hash_size,
        Flags::default(),
        libc::O_RDWR | libc::O_CREAT,
        0o600,
    )
    .unwrap()
}

#[test]
fn traverse_empty_database() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_new(&dir.path().join("empty.tdb"), 7);
    assert_eq!(db.traverse(|_, _, _| false).unwrap(), 0);
    assert_eq!(db.firstkey().unwrap(), None);
}

#[test]
fn traverse_visits_every_pair_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_new(&dir.path().join("visit.tdb"), 7);

    for i in 0..50 {
        db.store(
            format!("key{i}").as_bytes(),
            format!("val{i}").as_bytes(),
            StoreMode::Insert,
        )
        .unwrap();
    }

    let mut seen = HashSet::new();
    let count = db
        .traverse(|_, k, v| {
            assert_eq!(&v[..3], b"val");
            assert!(seen.insert(k.to_vec()));
            false
        })
        .unwrap();
    assert_eq!(count, 50);
    assert_eq!(seen.len(), 50);
}

#[test]
fn traverse_stops_when_callback_asks() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_new(&dir.path().join("stop.tdb"), 7);

    for i in 0..10 {
        db.store(format!("k{i}").as_bytes(), b"v", StoreMode::Insert)
            .unwrap();
    }
    let count = db.traverse(|_, _, _| true).unwrap();
    assert_eq!(count, 1);
}

#[test]
fn firstkey_nextkey_iterates_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_new(&dir.path().join("iter.tdb"), 7);

    let mut expected = HashSet::new();
    for i in 0..40 {
        let key = format!("key{i}").into_bytes();
        db.store(&key, b"x", StoreMode::Insert).unwrap();
        expected.insert(key);
    }

    let mut seen = HashSet::new();
    let mut cursor = db.firstkey().unwrap();
    while let Some(key) = cursor {
        assert!(seen.insert(key.clone()));
        cursor = db.nextkey(&key).unwrap();
    }
    assert_eq!(seen, expected);
}

#[test]
fn delete_under_cursor_leaves_tombstone() {
    let dir = tempfile::tempdir().unwrap();
    // One bucket, so every record shares a chain: head is the newest.
    let mut db = open_new(&dir.path().join("dead.tdb"), 1);

    db.store(b"a", b"1", StoreMode::Insert).unwrap();
    db.store(b"b", b"2", StoreMode::Insert).unwrap();
    db.store(b"c", b"3", StoreMode::Insert).unwrap();

    let first = db.firstkey().unwrap().unwrap();
    assert_eq!(first, b"c".to_vec());

    // The cursor pins the record, so delete falls back to a tombstone,
    // and still reports success.
    db.delete(b"c").unwrap();
    assert!(!db.exists(b"c"));
    assert_eq!(db.fetch(b"c").unwrap(), None);

    // The cursor is still usable: the dead record keeps its key bytes.
    assert_eq!(db.nextkey(b"c").unwrap(), Some(b"b".to_vec()));
    assert_eq!(db.nextkey(b"b").unwrap(), Some(b"a".to_vec()));
    assert_eq!(db.nextkey(b"a").unwrap(), None);

    // A full traversal no longer sees the key and reclaims the space.
    let before = db.freelist().unwrap();
    let count = db.traverse(|_, _, _| false).unwrap();
    assert_eq!(count, 2);
    let after = db.freelist().unwrap();
    assert!(after.1 > before.1, "tombstone was not reclaimed");
}

#[test]
fn nextkey_survives_deletion_of_another_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_new(&dir.path().join("skip.tdb"), 1);

    db.store(b"a", b"1", StoreMode::Insert).unwrap();
    db.store(b"b", b"2", StoreMode::Insert).unwrap();
    db.store(b"c", b"3", StoreMode::Insert).unwrap();

    // Chain order is c, b, a. Drop b while the cursor sits on c.
    assert_eq!(db.firstkey().unwrap(), Some(b"c".to_vec()));
    db.delete(b"b").unwrap();
    assert_eq!(db.nextkey(b"c").unwrap(), Some(b"a".to_vec()));
    assert_eq!(db.nextkey(b"a").unwrap(), None);
}

#[test]
fn nextkey_refinds_a_stale_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_new(&dir.path().join("stale.tdb"), 1);

    db.store(b"a", b"1", StoreMode::Insert).unwrap();
    db.store(b"b", b"2", StoreMode::Insert).unwrap();

    // No firstkey was called: nextkey has to find its bearings from the
    // key alone.
    assert_eq!(db.nextkey(b"b").unwrap(), Some(b"a".to_vec()));
    assert_eq!(db.nextkey(b"missing").unwrap(), None);
}

#[test]
fn callback_may_delete_the_current_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_new(&dir.path().join("cbdel.tdb"), 7);

    for i in 0..20 {
        db.store(format!("k{i}").as_bytes(), b"v", StoreMode::Insert)
            .unwrap();
    }

    // Each record is pinned while its callback runs, so these deletes
    // all take the tombstone path; every one succeeds.
    let count = db
        .traverse(|t, k, _| {
            t.delete(k).unwrap();
            false
        })
        .unwrap();
    assert_eq!(count, 20);

    for i in 0..20 {
        assert!(!db.exists(format!("k{i}").as_bytes()));
    }

    // The next traversal sees nothing and sweeps the tombstones.
    assert_eq!(db.traverse(|_, _, _| false).unwrap(), 0);
    let (entries, _) = db.freelist().unwrap();
    assert_eq!(entries, 1);
}

#[test]
fn callback_may_update_the_current_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_new(&dir.path().join("cbupd.tdb"), 7);

    for i in 0..10 {
        db.store(format!("k{i}").as_bytes(), b"old!", StoreMode::Insert)
            .unwrap();
    }
    db.traverse(|t, k, _| {
        t.store(k, b"new!", StoreMode::Replace).unwrap();
        false
    })
    .unwrap();

    for i in 0..10 {
        assert_eq!(
            db.fetch(format!("k{i}").as_bytes()).unwrap(),
            Some(b"new!".to_vec())
        );
    }
}
