//! Property test: a database driven by arbitrary operation sequences
//! behaves like a map, traversal sees exactly the live set, and freeing
//! everything coalesces the arena.

use std::collections::HashMap;

use proptest::prelude::*;

use tdb::{Flags, StoreMode, Tdb};

#[derive(Debug, Clone)]
enum Op {
    Store(u8, Vec<u8>),
    Delete(u8),
    Fetch(u8),
}

fn key(i: u8) -> Vec<u8> {
    format!("key{i}").into_bytes()
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..24, proptest::collection::vec(any::<u8>(), 0..48))
            .prop_map(|(k, v)| Op::Store(k, v)),
        (0u8..24).prop_map(Op::Delete),
        (0u8..24).prop_map(Op::Fetch),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn behaves_like_a_map(ops in proptest::collection::vec(op(), 1..80)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tdb");
        let mut db = Tdb::open(
            &path,
            13,
            Flags::default(),
            libc::O_RDWR | libc::O_CREAT,
            0o600,
        )
        .unwrap();
        let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

        for op in ops {
            match op {
                Op::Store(k, v) => {
                    db.store(&key(k), &v, StoreMode::Replace).unwrap();
                    model.insert(key(k), v);
                }
                Op::Delete(k) => {
                    let deleted = db.delete(&key(k)).is_ok();
                    prop_assert_eq!(deleted, model.remove(&key(k)).is_some());
                }
                Op::Fetch(k) => {
                    prop_assert_eq!(db.fetch(&key(k)).unwrap(), model.get(&key(k)).cloned());
                }
            }
        }

        // Traversal sees exactly the live set.
        let mut seen = HashMap::new();
        db.traverse(|_, k, v| {
            seen.insert(k.to_vec(), v.to_vec());
            false
        })
        .unwrap();
        prop_assert_eq!(&seen, &model);

        // firstkey/nextkey walk the same set.
        let mut keys = Vec::new();
        let mut cursor = db.firstkey().unwrap();
        while let Some(k) = cursor {
            cursor = db.nextkey(&k).unwrap();
            keys.push(k);
        }
        keys.sort();
        let mut expected: Vec<Vec<u8>> = model.keys().cloned().collect();
        expected.sort();
        prop_assert_eq!(keys, expected);

        // Dropping everything coalesces the arena back into one block.
        for k in model.keys() {
            db.delete(k).unwrap();
        }
        let (entries, _) = db.freelist().unwrap();
        prop_assert!(entries <= 1, "free list fragmented into {} entries", entries);
    }
}
