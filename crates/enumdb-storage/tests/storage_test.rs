//! Storage integration tests.
//!
//! Exercises the storage kinds and the B-tree against real files sharing one
//! page pool:
//! - Page-spanning reads and writes
//! - Closed storage behavior
//! - B-tree splits, persistence and header validation
//! - Concurrent access through the shared pool

use enumdb_buffer::{PagePool, PagePoolConfig};
use enumdb_common::{ByteOrder, StorageConfig, StorageError, StorageKind};
use enumdb_storage::{
    open_storage, BTreeConfig, ByteStorage, IntToIntBTree, PagedFileStorage, ResizeableMappedFile,
    BTREE_MAGIC,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

const PAGE_SIZE: usize = 4096;

fn small_pool(pages: usize) -> Arc<PagePool> {
    Arc::new(PagePool::new(PagePoolConfig {
        capacity_bytes: pages * PAGE_SIZE,
        ..PagePoolConfig::default()
    }))
}

fn config(kind: StorageKind) -> StorageConfig {
    StorageConfig::default()
        .with_page_size(PAGE_SIZE)
        .with_kind(kind)
}

fn open_tree(path: &Path, pool: &Arc<PagePool>, max_children: u32) -> IntToIntBTree {
    let storage = open_storage(path, &config(StorageKind::PagedFile), pool).unwrap();
    IntToIntBTree::open(storage, &BTreeConfig { max_children }).unwrap()
}

// =============================================================================
// Byte storage
// =============================================================================

#[test]
fn test_read_spanning_three_pages() {
    let dir = tempdir().unwrap();
    let pool = small_pool(16);
    let storage = PagedFileStorage::open(
        &dir.path().join("pages"),
        &config(StorageKind::PagedFile),
        Arc::clone(&pool),
    )
    .unwrap();

    storage.write(0, b"first").unwrap();
    storage.write(4096, b"second").unwrap();
    storage.write(8192, b"x").unwrap();

    let mut buf = vec![0xAAu8; 8193];
    storage.read(0, &mut buf).unwrap();
    assert_eq!(&buf[0..5], b"first");
    assert!(buf[5..4096].iter().all(|&b| b == 0));
    assert_eq!(&buf[4096..4102], b"second");
    assert!(buf[4102..8192].iter().all(|&b| b == 0));
    assert_eq!(buf[8192], b'x');
    assert_eq!(storage.len().unwrap(), 8193);
}

#[test]
fn test_every_kind_rejects_use_after_close() {
    let dir = tempdir().unwrap();
    let pool = small_pool(8);
    for kind in [StorageKind::PagedFile, StorageKind::RandomAccessFile, StorageKind::InMemory] {
        let path = dir.path().join(format!("{kind:?}"));
        let storage = open_storage(&path, &config(kind), &pool).unwrap();
        storage.put_i32(0, 7).unwrap();
        storage.close().unwrap();
        storage.close().unwrap();

        assert!(matches!(storage.get_i32(0), Err(StorageError::Closed { .. })));
        assert!(matches!(storage.put_i32(0, 8), Err(StorageError::Closed { .. })));
        assert!(storage.force().unwrap_err().is_closed());
    }
}

#[test]
fn test_paged_and_direct_storage_see_same_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared");
    let pool = small_pool(8);
    {
        let paged = open_storage(&path, &config(StorageKind::PagedFile), &pool).unwrap();
        paged.put_i64(10_000, -123_456_789).unwrap();
        paged.put_u8(3, 9).unwrap();
        paged.close().unwrap();
    }
    let direct = open_storage(&path, &config(StorageKind::RandomAccessFile), &pool).unwrap();
    assert_eq!(direct.get_i64(10_000).unwrap(), -123_456_789);
    assert_eq!(direct.get_u8(3).unwrap(), 9);
    assert_eq!(direct.len().unwrap(), 10_008);
}

#[test]
fn test_files_larger_than_pool() {
    let dir = tempdir().unwrap();
    let pool = small_pool(4);
    let a = open_storage(&dir.path().join("a"), &config(StorageKind::PagedFile), &pool).unwrap();
    let b = open_storage(&dir.path().join("b"), &config(StorageKind::PagedFile), &pool).unwrap();

    for page in 0..32u64 {
        a.put_i64(page * 4096, page as i64).unwrap();
        b.put_i64(page * 4096 + 8, -(page as i64)).unwrap();
    }
    for page in 0..32u64 {
        assert_eq!(a.get_i64(page * 4096).unwrap(), page as i64);
        assert_eq!(b.get_i64(page * 4096 + 8).unwrap(), -(page as i64));
    }

    let stats = pool.stats();
    assert!(stats.evictions > 0);
    assert!(stats.resident_bytes <= stats.capacity_bytes);
}

#[test]
fn test_concurrent_writers_on_shared_pool() {
    let dir = tempdir().unwrap();
    let pool = small_pool(8);
    let storages: Vec<Arc<PagedFileStorage>> = (0..4)
        .map(|i| {
            Arc::new(
                PagedFileStorage::open(
                    &dir.path().join(format!("t{i}")),
                    &config(StorageKind::PagedFile),
                    Arc::clone(&pool),
                )
                .unwrap(),
            )
        })
        .collect();

    let handles: Vec<_> = storages
        .iter()
        .enumerate()
        .map(|(i, storage)| {
            let storage = Arc::clone(storage);
            thread::spawn(move || {
                for n in 0..2_000u64 {
                    storage.put_i32(n * 4, (i as i32) << 16 | n as i32).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for (i, storage) in storages.iter().enumerate() {
        for n in 0..2_000u64 {
            assert_eq!(storage.get_i32(n * 4).unwrap(), (i as i32) << 16 | n as i32);
        }
    }
}

#[test]
fn test_resizeable_file_over_paged_storage() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("log");
    let pool = small_pool(4);
    let mut offsets = Vec::new();
    {
        let storage = open_storage(&path, &config(StorageKind::PagedFile), &pool).unwrap();
        let file = ResizeableMappedFile::open(storage, 4096).unwrap();
        for n in 0..1_000u32 {
            offsets.push(file.append(format!("record-{n}").as_bytes()).unwrap());
        }
        file.close().unwrap();
    }

    let storage = open_storage(&path, &config(StorageKind::PagedFile), &pool).unwrap();
    let file = ResizeableMappedFile::open(storage, 4096).unwrap();
    for (n, &offset) in offsets.iter().enumerate() {
        let expected = format!("record-{n}");
        let mut buf = vec![0u8; expected.len()];
        file.read(offset, &mut buf).unwrap();
        assert_eq!(buf, expected.as_bytes());
    }
    assert!(file.physical_len().unwrap() >= file.len());
}

// =============================================================================
// B-tree
// =============================================================================

#[test]
fn test_btree_small_fanout_on_disk() {
    let dir = tempdir().unwrap();
    let pool = small_pool(8);
    let mut tree = open_tree(&dir.path().join("tree"), &pool, 4);

    for key in [5, 3, 8, 1, 4, 7, 9, 2, 6] {
        tree.put(key, key * 100).unwrap();
    }
    for key in 1..=9 {
        assert_eq!(tree.get(key).unwrap(), Some(key * 100));
    }
    let mut keys = Vec::new();
    tree.process_mappings(|k, _| {
        keys.push(k);
        true
    })
    .unwrap();
    assert_eq!(keys, (1..=9).collect::<Vec<_>>());
    tree.close().unwrap();
}

#[test]
fn test_btree_reopen_persists() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree");
    let pool = small_pool(8);
    let mut rng = StdRng::seed_from_u64(99);
    let mut reference = BTreeMap::new();
    {
        let mut tree = open_tree(&path, &pool, 16);
        for _ in 0..20_000 {
            let key: i32 = rng.random_range(-100_000..100_000);
            let value: i32 = rng.random();
            tree.put(key, value).unwrap();
            reference.insert(key, value);
        }
        tree.close().unwrap();
    }

    // Requested fanout differs; the stored one wins
    let tree = open_tree(&path, &pool, 64);
    assert_eq!(tree.max_children(), 16);
    assert_eq!(tree.len(), reference.len() as u64);
    for (&key, &value) in &reference {
        assert_eq!(tree.get(key).unwrap(), Some(value));
    }
    let mut pairs = Vec::with_capacity(reference.len());
    tree.process_mappings(|k, v| {
        pairs.push((k, v));
        true
    })
    .unwrap();
    assert_eq!(pairs, reference.into_iter().collect::<Vec<_>>());
}

#[test]
fn test_btree_version_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree");
    let pool = small_pool(8);
    {
        let mut tree = open_tree(&path, &pool, 4);
        tree.put(1, 1).unwrap();
        tree.close().unwrap();
    }

    let mut bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[0..4], &BTREE_MAGIC);
    let order = StorageConfig::default().byte_order;
    order.write_u32(&mut bytes, 4, 77);
    std::fs::write(&path, &bytes).unwrap();

    let storage = open_storage(&path, &config(StorageKind::PagedFile), &pool).unwrap();
    let err = IntToIntBTree::open(storage, &BTreeConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        StorageError::VersionMismatch { actual: 77, .. }
    ));
}

#[test]
fn test_btree_truncated_file_is_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree");
    let pool = small_pool(8);
    {
        let mut tree = open_tree(&path, &pool, 4);
        for key in 0..200 {
            tree.put(key, key).unwrap();
        }
        tree.close().unwrap();
    }
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(200).unwrap();
    drop(file);

    let storage = open_storage(&path, &config(StorageKind::PagedFile), &pool).unwrap();
    let err = IntToIntBTree::open(storage, &BTreeConfig { max_children: 4 }).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_btree_byte_order_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree");
    let pool = small_pool(8);
    let big = StorageConfig {
        byte_order: ByteOrder::BigEndian,
        ..config(StorageKind::PagedFile)
    };
    let little = StorageConfig {
        byte_order: ByteOrder::LittleEndian,
        ..config(StorageKind::PagedFile)
    };
    {
        let storage = open_storage(&path, &big, &pool).unwrap();
        let mut tree = IntToIntBTree::open(storage, &BTreeConfig::default()).unwrap();
        tree.put(1, 2).unwrap();
        tree.close().unwrap();
    }
    let storage = open_storage(&path, &little, &pool).unwrap();
    let err = IntToIntBTree::open(storage, &BTreeConfig::default()).unwrap_err();
    assert!(matches!(err, StorageError::Corrupted(_)));
}

#[test]
fn test_btree_closed() {
    let dir = tempdir().unwrap();
    let pool = small_pool(8);
    let mut tree = open_tree(&dir.path().join("tree"), &pool, 4);
    tree.put(1, 1).unwrap();
    tree.close().unwrap();
    assert!(tree.is_closed());
    assert!(matches!(tree.get(1), Err(StorageError::Closed { .. })));
    assert!(matches!(tree.put(1, 2), Err(StorageError::Closed { .. })));
}
