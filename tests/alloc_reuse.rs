//! # Allocator Reuse Tests
//!
//! The free lists are part of the committed state:
//! 1. Freed pages are reused lowest-id-first, also after a reopen
//! 2. Fragmented free lists round-trip through their on-disk chain
//! 3. The size limit binds allocations and persists in the meta page

use pagestore::{File, Options, StorageError};
use tempfile::tempdir;

fn opts() -> Options {
    Options {
        page_size: 512,
        max_size: 0,
    }
}

#[test]
fn freed_pages_are_reused_lowest_first() {
    let dir = tempdir().unwrap();
    let store = File::open(dir.path().join("store.dat"), opts()).unwrap();

    let mut tx = store.begin();
    let ids = tx.alloc_n(5).unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin();
    tx.page(ids[3]).unwrap().free().unwrap();
    tx.page(ids[1]).unwrap().free().unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin();
    assert_eq!(tx.alloc().unwrap(), ids[1]);
    assert_eq!(tx.alloc().unwrap(), ids[3]);
    tx.commit().unwrap();
    store.close().unwrap();
}

#[test]
fn free_list_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.dat");

    let store = File::open(&path, opts()).unwrap();
    let mut tx = store.begin();
    let ids = tx.alloc_n(6).unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin();
    for &id in [ids[4], ids[1], ids[2]].iter() {
        tx.page(id).unwrap().free().unwrap();
    }
    tx.commit().unwrap();
    let free_before = store.stats().free_data_pages;
    assert_eq!(free_before, 3);
    store.close().unwrap();

    let store = File::open(&path, opts()).unwrap();
    assert_eq!(store.stats().free_data_pages, free_before);

    let mut tx = store.begin();
    // ids[1] and ids[2] were adjacent and come back first
    assert_eq!(tx.alloc_n(3).unwrap(), vec![ids[1], ids[2], ids[4]]);
    tx.rollback().unwrap();
    store.close().unwrap();
}

#[test]
fn fresh_pages_freed_in_the_same_tx_never_commit() {
    let dir = tempdir().unwrap();
    let store = File::open(dir.path().join("store.dat"), opts()).unwrap();

    let mut tx = store.begin();
    let keep = tx.alloc().unwrap();
    let gone = tx.alloc().unwrap();
    tx.page(gone).unwrap().free().unwrap();
    // the freed fresh page is immediately reusable
    assert_eq!(tx.alloc().unwrap(), gone);
    tx.page(keep).unwrap().set_bytes(b"keep").unwrap();
    tx.commit().unwrap();

    assert_eq!(store.stats().free_data_pages, 0);
    store.close().unwrap();
}

#[test]
fn size_limit_binds_and_reports() {
    let dir = tempdir().unwrap();
    let store = File::open(
        dir.path().join("store.dat"),
        Options {
            page_size: 512,
            max_size: 16 * 512,
        },
    )
    .unwrap();

    let mut tx = store.begin();
    let err = tx.alloc_n(100).unwrap_err();
    assert_eq!(
        err.downcast_ref::<StorageError>(),
        Some(&StorageError::SizeLimitExceeded {
            requested: 100,
            max_pages: 16,
        })
    );
    // smaller requests still succeed afterwards
    tx.alloc_n(4).unwrap();
    tx.commit().unwrap();
    store.close().unwrap();
}

#[test]
fn size_limit_persists_in_the_meta_page() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.dat");

    let store = File::open(
        &path,
        Options {
            page_size: 512,
            max_size: 16 * 512,
        },
    )
    .unwrap();
    store.close().unwrap();

    // reopened without an explicit limit, the stored one applies
    let store = File::open(&path, opts()).unwrap();
    let mut tx = store.begin();
    assert!(tx.alloc_n(100).is_err());
    tx.rollback().unwrap();
    store.close().unwrap();
}

#[test]
fn freeing_makes_room_under_the_limit() {
    let dir = tempdir().unwrap();
    let store = File::open(
        dir.path().join("store.dat"),
        Options {
            page_size: 512,
            max_size: 12 * 512,
        },
    )
    .unwrap();

    let mut tx = store.begin();
    let ids = tx.alloc_n(8).unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin();
    assert!(tx.alloc_n(4).is_err());
    for &id in &ids[..4] {
        tx.page(id).unwrap().free().unwrap();
    }
    tx.commit().unwrap();

    let mut tx = store.begin();
    assert_eq!(tx.alloc_n(4).unwrap(), ids[..4].to_vec());
    tx.commit().unwrap();
    store.close().unwrap();
}

#[test]
fn alloc_n_returns_distinct_ids() {
    let dir = tempdir().unwrap();
    let store = File::open(dir.path().join("store.dat"), opts()).unwrap();

    let mut tx = store.begin();
    let mut ids = tx.alloc_n(50).unwrap();
    tx.commit().unwrap();
    store.close().unwrap();

    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 50);
}
