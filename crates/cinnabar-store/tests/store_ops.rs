//! End-to-end operation tests over a real backing file.

use bytes::Bytes;
use cinnabar_store::{RecordStore, StoreConfig, StoreError};
use tempfile::TempDir;
use test_case::test_case;

fn scratch() -> (TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    (dir, path)
}

fn config(initial_size: u64) -> StoreConfig {
    StoreConfig {
        initial_size,
        ..StoreConfig::default()
    }
}

// ============================================================================
// Core scenarios
// ============================================================================

#[test]
fn create_and_insert_one() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(4096)).unwrap();

    store.insert(b"\x01\x02", b"hello").unwrap();
    assert_eq!(&store.read(b"\x01\x02").unwrap()[..], b"hello");
    assert_eq!(store.size().unwrap(), 1);

    // One slot is 64 + 24 = 88 bytes; the frame fills the top of the
    // reserved band, lowering the data region start from 4096 to 4008.
    assert_eq!(store.file_length(), 4096);
    assert_eq!(store.data_start_ptr(), 4096 - 88);
    store.close().unwrap();

    let raw = std::fs::read(&path).unwrap();
    // header: max_key_length, num_records = 1, data_start_ptr = 4008
    assert_eq!(raw[0], 0x40);
    assert_eq!(&raw[1..5], &1i32.to_be_bytes());
    assert_eq!(&raw[5..13], &4008i64.to_be_bytes());
    // slot 0 key area: length byte, key, key CRC
    assert_eq!(raw[13], 2);
    assert_eq!(&raw[14..16], b"\x01\x02");
    assert_eq!(&raw[16..20], &crc32fast::hash(b"\x01\x02").to_be_bytes());
    // value frame at 4008: length, payload, payload CRC
    assert_eq!(&raw[4008..4012], &5i32.to_be_bytes());
    assert_eq!(&raw[4012..4017], b"hello");
    assert_eq!(&raw[4017..4021], &crc32fast::hash(b"hello").to_be_bytes());
}

#[test]
fn duplicate_insert_rejected() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(4096)).unwrap();

    store.insert(b"\x01\x02", b"hello").unwrap();
    let err = store.insert(b"\x01\x02", b"world").unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey));
    assert_eq!(&store.read(b"\x01\x02").unwrap()[..], b"hello");
    assert_eq!(store.size().unwrap(), 1);
}

#[test]
fn update_grow_forces_append() {
    // Room for exactly one slot, so the prefix-gap branch can never fire.
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(13 + 88)).unwrap();

    store.insert(b"a", &[0u8; 8]).unwrap();
    store.insert(b"b", &[0u8; 8]).unwrap();
    store.update(b"a", &[0x11u8; 200]).unwrap();

    assert_eq!(&store.read(b"a").unwrap()[..], &[0x11u8; 200][..]);
    assert_eq!(&store.read(b"b").unwrap()[..], &[0u8; 8][..]);

    // "a" was relocated to a fresh frame at the end of the file
    // (4 + 200 + 4 bytes), and its old frame was handed back to the gap.
    assert_eq!(store.file_length(), 13 + 88 + 3 * 88 + 208);
}

#[test]
fn swap_delete_moves_last_slot_forward() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, StoreConfig::default()).unwrap();

    store.insert(b"k1", b"v1").unwrap();
    store.insert(b"k2", b"v2").unwrap();
    store.insert(b"k3", b"v3").unwrap();
    store.delete(b"k1").unwrap();

    let mut keys = store.keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec![Bytes::from_static(b"k2"), Bytes::from_static(b"k3")]);
    assert_eq!(store.size().unwrap(), 2);
    assert_eq!(&store.read(b"k2").unwrap()[..], b"v2");
    assert_eq!(&store.read(b"k3").unwrap()[..], b"v3");
    store.close().unwrap();

    // Raw dump: the slot formerly holding k1 now carries the last record's
    // bytes, and the header says two records.
    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[1..5], &2i32.to_be_bytes());
    assert_eq!(raw[13], 2);
    assert_eq!(&raw[14..16], b"k3");
}

// ============================================================================
// Allocator branches
// ============================================================================

#[test]
fn prefix_gap_allocation_does_not_extend_the_file() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(8192)).unwrap();

    for i in 0..8u8 {
        store.insert(&[i], &[i; 16]).unwrap();
    }
    // Every frame fit in the pre-sized band.
    assert_eq!(store.file_length(), 8192);
    assert_eq!(store.data_start_ptr(), 8192 - 8 * 88);
}

#[test]
fn interior_free_space_is_reused_smallest_fit() {
    // Three slots of reserve, so the prefix gap can never fit a frame and
    // the free-tail branch gets its turn.
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(13 + 3 * 88)).unwrap();

    // A 300-byte value gets a 308-byte frame appended at the end.
    store.insert(b"k1", &[0xAAu8; 300]).unwrap();
    // Shrink in place: 290 bytes of tail become reusable.
    store.update(b"k1", &[0xBBu8; 10]).unwrap();
    let before = store.file_length();
    assert_eq!(store.stats().unwrap().interior_free_bytes, 290);

    // A small insert carves its 88-byte frame out of that tail instead of
    // growing the file; k2's own frame then has 88 - 13 spare bytes.
    store.insert(b"k2", b"small").unwrap();
    assert_eq!(store.file_length(), before);
    assert_eq!(store.stats().unwrap().interior_free_bytes, 290 - 88 + 75);
    assert_eq!(&store.read(b"k1").unwrap()[..], &[0xBBu8; 10][..]);
    assert_eq!(&store.read(b"k2").unwrap()[..], b"small");
}

#[test]
fn append_allocation_extends_the_file() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(0)).unwrap();

    store.insert(b"k1", b"v1").unwrap();
    let before = store.file_length();
    store.insert(b"k2", b"v2").unwrap();
    assert!(store.file_length() > before);
}

#[test]
fn insert_into_empty_zero_sized_file() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(0)).unwrap();
    assert_eq!(store.file_length(), 13);

    store.insert(b"k", b"v").unwrap();
    assert_eq!(&store.read(b"k").unwrap()[..], b"v");
    // index slot + one padded frame
    assert_eq!(store.file_length(), 13 + 88 + 88);
    assert_eq!(store.data_start_ptr(), 13 + 88);
}

#[test]
fn index_growth_relocates_front_record() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(13 + 88)).unwrap();

    store.insert(b"a", b"va").unwrap();
    let first_frame = store.data_start_ptr();
    // The second insert needs a second slot; the front record moves to the
    // end of the file to make room.
    store.insert(b"b", b"vb").unwrap();
    assert!(store.data_start_ptr() > first_frame);
    assert_eq!(&store.read(b"a").unwrap()[..], b"va");
    assert_eq!(&store.read(b"b").unwrap()[..], b"vb");
}

// ============================================================================
// Updates
// ============================================================================

#[test]
fn update_same_size_in_place() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(1024)).unwrap();

    store.insert(b"k", &[1u8; 80]).unwrap();
    let len_before = store.file_length();
    store.update(b"k", &[2u8; 80]).unwrap();
    assert_eq!(store.file_length(), len_before);
    assert_eq!(&store.read(b"k").unwrap()[..], &[2u8; 80][..]);
}

#[test]
fn update_shrink_in_place_with_value_crc() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(1024)).unwrap();

    store.insert(b"k", &[1u8; 70]).unwrap();
    let len_before = store.file_length();
    store.update(b"k", b"tiny").unwrap();
    assert_eq!(store.file_length(), len_before);
    assert_eq!(&store.read(b"k").unwrap()[..], b"tiny");
}

#[test]
fn update_shrink_without_value_crc_relocates() {
    let cfg = StoreConfig {
        initial_size: 0,
        value_crc_enabled: false,
        ..StoreConfig::default()
    };
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, cfg.clone()).unwrap();

    store.insert(b"k1", &[1u8; 70]).unwrap();
    store.insert(b"k2", b"v2").unwrap();
    // k1 is neither at the tail nor allowed to shrink in place; the engine
    // must take the relocate path, never abort.
    store.update(b"k1", b"small").unwrap();
    assert_eq!(&store.read(b"k1").unwrap()[..], b"small");
    assert_eq!(&store.read(b"k2").unwrap()[..], b"v2");

    drop(store);
    let mut reopened = RecordStore::open(&path, cfg).unwrap();
    assert_eq!(&reopened.read(b"k1").unwrap()[..], b"small");
}

#[test]
fn update_shrink_without_crc_but_with_override_stays_in_place() {
    let cfg = StoreConfig {
        initial_size: 1024,
        value_crc_enabled: false,
        allow_in_place_shrink: true,
        ..StoreConfig::default()
    };
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, cfg).unwrap();

    store.insert(b"k", &[1u8; 70]).unwrap();
    let len_before = store.file_length();
    store.update(b"k", b"small").unwrap();
    assert_eq!(store.file_length(), len_before);
    assert_eq!(&store.read(b"k").unwrap()[..], b"small");
}

#[test]
fn update_tail_record_resizes_the_file() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(0)).unwrap();

    store.insert(b"k", &[1u8; 100]).unwrap();
    // The only record's frame ends at the end of the file.
    let grown = 500usize;
    store.update(b"k", &vec![2u8; grown]).unwrap();
    assert_eq!(&store.read(b"k").unwrap()[..], &vec![2u8; grown][..]);
    assert_eq!(store.file_length(), store.data_start_ptr() + 4 + grown as u64 + 4);

    // Tail shrink without in-place rights also resizes exactly.
    let cfg = StoreConfig {
        value_crc_enabled: false,
        ..StoreConfig::default()
    };
    let path2 = path.with_extension("2");
    let mut store2 = RecordStore::create(&path2, cfg).unwrap();
    store2.insert(b"k", &[1u8; 100]).unwrap();
    store2.update(b"k", b"xs").unwrap();
    assert_eq!(&store2.read(b"k").unwrap()[..], b"xs");
    assert_eq!(store2.file_length(), store2.data_start_ptr() + 4 + 2);
}

#[test]
fn update_missing_key_reports_not_found() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, StoreConfig::default()).unwrap();
    assert!(matches!(
        store.update(b"ghost", b"v"),
        Err(StoreError::NotFound)
    ));
}

// ============================================================================
// Deletes
// ============================================================================

#[test]
fn delete_reclaims_tail_middle_and_front() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(4096)).unwrap();

    // Frames stack downward from 4096: a@4008, b@3920, c@3832.
    store.insert(b"a", b"va").unwrap();
    store.insert(b"b", b"vb").unwrap();
    store.insert(b"c", b"vc").unwrap();
    assert_eq!(store.data_start_ptr(), 3832);

    // Middle frame: merged into its predecessor's capacity. b's own 78
    // spare bytes leave the books; its full 88-byte frame joins c's.
    let free_before = store.stats().unwrap().interior_free_bytes;
    assert_eq!(free_before, 3 * 78);
    store.delete(b"b").unwrap();
    assert_eq!(
        store.stats().unwrap().interior_free_bytes,
        free_before - 78 + 88
    );

    // Tail frame: the file is cut back.
    store.delete(b"a").unwrap();
    assert_eq!(store.file_length(), 4008);

    // Front (and only) frame: now at the tail, cut back again.
    store.delete(b"c").unwrap();
    assert_eq!(store.file_length(), 3832);
    assert!(store.is_empty().unwrap());
}

#[test]
fn delete_front_record_advances_data_start() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(4096)).unwrap();

    store.insert(b"a", b"va").unwrap();
    store.insert(b"b", b"vb").unwrap();
    store.insert(b"c", b"vc").unwrap();

    // c owns the lowest frame; its space returns to the prefix gap.
    assert_eq!(store.data_start_ptr(), 3832);
    store.delete(b"c").unwrap();
    assert_eq!(store.data_start_ptr(), 3920);
    assert_eq!(&store.read(b"a").unwrap()[..], b"va");
    assert_eq!(&store.read(b"b").unwrap()[..], b"vb");
}

#[test]
fn delete_is_not_idempotent() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, StoreConfig::default()).unwrap();

    store.insert(b"k", b"v").unwrap();
    store.delete(b"k").unwrap();
    assert!(matches!(store.delete(b"k"), Err(StoreError::NotFound)));
    assert!(!store.exists(b"k").unwrap());
}

// ============================================================================
// Keys, config, state
// ============================================================================

#[test_case(59; "exactly at the limit")]
fn key_length_accepted(len: usize) {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, StoreConfig::default()).unwrap();
    let key = vec![7u8; len];
    store.insert(&key, b"v").unwrap();
    assert_eq!(&store.read(&key).unwrap()[..], b"v");
}

#[test_case(60; "one byte over")]
#[test_case(200; "far over")]
fn key_length_rejected(len: usize) {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, StoreConfig::default()).unwrap();
    let key = vec![7u8; len];
    assert!(matches!(
        store.insert(&key, b"v"),
        Err(StoreError::KeyTooLong { length, max: 59 }) if length == len
    ));
}

#[test]
fn empty_key_rejected() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, StoreConfig::default()).unwrap();
    assert!(matches!(store.insert(b"", b"v"), Err(StoreError::EmptyKey)));
}

#[test]
fn empty_value_roundtrips() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, StoreConfig::default()).unwrap();
    store.insert(b"k", b"").unwrap();
    assert_eq!(store.read(b"k").unwrap().len(), 0);
}

#[test]
fn put_inserts_then_updates() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, StoreConfig::default()).unwrap();

    store.put(b"k", b"first").unwrap();
    assert_eq!(&store.read(b"k").unwrap()[..], b"first");
    store.put(b"k", b"second").unwrap();
    assert_eq!(&store.read(b"k").unwrap()[..], b"second");
    assert_eq!(store.size().unwrap(), 1);
}

#[test]
fn keys_snapshot_is_decoupled_from_mutations() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, StoreConfig::default()).unwrap();

    store.insert(b"a", b"1").unwrap();
    store.insert(b"b", b"2").unwrap();
    let snapshot = store.keys().unwrap();
    store.delete(b"a").unwrap();

    assert_eq!(snapshot.len(), 2);
    assert_eq!(store.size().unwrap(), 1);
}

#[test]
fn closed_store_rejects_operations() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, StoreConfig::default()).unwrap();
    store.close().unwrap();
    store.close().unwrap(); // idempotent

    assert!(matches!(
        store.insert(b"k", b"v"),
        Err(StoreError::IllegalState { state: "closed" })
    ));
    assert!(matches!(store.size(), Err(StoreError::IllegalState { .. })));
}

#[test]
fn open_validates_expected_key_limit() {
    let (_dir, path) = scratch();
    let store = RecordStore::create(&path, StoreConfig::default()).unwrap();
    drop(store);

    let err = RecordStore::open(
        &path,
        StoreConfig {
            expected_max_key_length: Some(32),
            ..StoreConfig::default()
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        StoreError::MaxKeyLengthMismatch {
            expected: 32,
            actual: 64
        }
    ));

    RecordStore::open(
        &path,
        StoreConfig {
            expected_max_key_length: Some(64),
            ..StoreConfig::default()
        },
    )
    .unwrap();
}

#[test_case(0; "zero")]
#[test_case(4; "no room for the length byte and CRC")]
#[test_case(5; "no room for any key byte")]
#[test_case(253; "over the header range")]
fn create_rejects_out_of_range_key_limit(limit: u8) {
    let (_dir, path) = scratch();
    let err = RecordStore::create(
        &path,
        StoreConfig {
            max_key_length: limit,
            ..StoreConfig::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::InvalidConfig { .. }));
    // the bad config was rejected before any file was created
    assert!(!path.exists());
}

#[test]
fn smallest_key_limit_accepts_exactly_one_byte_keys() {
    // max_key_length = 6 is the floor: one key byte next to the length
    // byte and the key CRC.
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(
        &path,
        StoreConfig {
            max_key_length: 6,
            ..StoreConfig::default()
        },
    )
    .unwrap();

    store.insert(b"k", b"v").unwrap();
    assert_eq!(&store.read(b"k").unwrap()[..], b"v");
    assert!(matches!(
        store.insert(b"kk", b"v"),
        Err(StoreError::KeyTooLong { length: 2, max: 1 })
    ));
    assert!(matches!(store.insert(b"", b"v"), Err(StoreError::EmptyKey)));
}

#[test]
fn reopen_is_monotonic() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(2048)).unwrap();
    store.insert(b"a", b"alpha").unwrap();
    store.insert(b"b", b"bravo").unwrap();
    store.insert(b"c", b"charlie").unwrap();
    store.delete(b"b").unwrap();
    store.close().unwrap();
    drop(store);

    let mut first = RecordStore::open(&path, StoreConfig::default()).unwrap();
    let mut first_keys = first.keys().unwrap();
    first_keys.sort();
    let first_values: Vec<_> = first_keys
        .iter()
        .map(|k| first.read(k).unwrap())
        .collect();
    drop(first);

    let mut second = RecordStore::open(&path, StoreConfig::default()).unwrap();
    let mut second_keys = second.keys().unwrap();
    second_keys.sort();
    let second_values: Vec<_> = second_keys
        .iter()
        .map(|k| second.read(k).unwrap())
        .collect();

    assert_eq!(first_keys, second_keys);
    assert_eq!(first_values, second_values);
    assert_eq!(first_keys.len(), 2);
}

#[test]
fn large_workload_survives_reopen() {
    let (_dir, path) = scratch();
    let mut store = RecordStore::create(&path, config(1024)).unwrap();

    for i in 0..50u32 {
        let key = i.to_be_bytes();
        let value = vec![i as u8; (i as usize * 7) % 230];
        store.insert(&key, &value).unwrap();
    }
    for i in (0..50u32).step_by(3) {
        store.delete(&i.to_be_bytes()).unwrap();
    }
    for i in (1..50u32).step_by(3) {
        let value = vec![0xEE; (i as usize * 11) % 300];
        store.update(&i.to_be_bytes(), &value).unwrap();
    }
    store.sync().unwrap();
    store.close().unwrap();
    drop(store);

    let mut reopened = RecordStore::open(&path, StoreConfig::default()).unwrap();
    for i in 0..50u32 {
        let key = i.to_be_bytes();
        if i % 3 == 0 {
            assert!(!reopened.exists(&key).unwrap());
        } else if i % 3 == 1 {
            let expect = vec![0xEE; (i as usize * 11) % 300];
            assert_eq!(&reopened.read(&key).unwrap()[..], &expect[..]);
        } else {
            let expect = vec![i as u8; (i as usize * 7) % 230];
            assert_eq!(&reopened.read(&key).unwrap()[..], &expect[..]);
        }
    }
}

// ============================================================================
// Model-based property test
// ============================================================================

mod model {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, Vec<u8>),
        Delete(u8),
        Read(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6u8, proptest::collection::vec(any::<u8>(), 0..160)).prop_map(|(k, v)| Op::Put(k, v)),
            (0..6u8).prop_map(Op::Delete),
            (0..6u8).prop_map(Op::Read),
        ]
    }

    fn key_bytes(k: u8) -> Vec<u8> {
        vec![b'k', k]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn store_agrees_with_hashmap_model(ops in proptest::collection::vec(op_strategy(), 1..48)) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("model.db");
            let mut store = RecordStore::create(&path, StoreConfig::default()).unwrap();
            let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

            for op in ops {
                match op {
                    Op::Put(k, v) => {
                        store.put(&key_bytes(k), &v).unwrap();
                        model.insert(key_bytes(k), v);
                    }
                    Op::Delete(k) => {
                        let expected = model.remove(&key_bytes(k)).is_some();
                        let result = store.delete(&key_bytes(k));
                        prop_assert_eq!(result.is_ok(), expected);
                    }
                    Op::Read(k) => match model.get(&key_bytes(k)) {
                        Some(v) => prop_assert_eq!(&store.read(&key_bytes(k)).unwrap()[..], &v[..]),
                        None => prop_assert!(matches!(
                            store.read(&key_bytes(k)),
                            Err(StoreError::NotFound)
                        )),
                    },
                }
            }

            prop_assert_eq!(store.size().unwrap(), model.len());
            store.close().unwrap();
            drop(store);

            let mut reopened = RecordStore::open(&path, StoreConfig::default()).unwrap();
            prop_assert_eq!(reopened.size().unwrap(), model.len());
            for (k, v) in &model {
                prop_assert_eq!(&reopened.read(k).unwrap()[..], &v[..]);
            }
        }
    }
}
