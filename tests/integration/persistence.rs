//! Round trips through the file-backed store: build, reopen, mutate,
//! reopen again.

use ntfs_index::{BytewiseOrdering, FileStore, Index, IndexOptions, IndexStore};

const BLOCK_SIZE: usize = 512;

fn opts() -> IndexOptions {
    IndexOptions {
        block_size: BLOCK_SIZE,
        root_capacity: 256,
        ..IndexOptions::default()
    }
}

fn key(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

fn val(n: u64) -> Vec<u8> {
    format!("value-{n}").into_bytes()
}

#[test]
fn index_survives_reopen_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("names.idx");

    let store = FileStore::create(&path, BLOCK_SIZE).unwrap();
    let mut index = Index::create(store, Box::new(BytewiseOrdering), opts()).unwrap();
    // Enough entries to push the tree out of the resident root.
    for n in 0..100u64 {
        index.insert(&key(n), &val(n)).unwrap();
    }
    drop(index.into_store());

    let store = FileStore::open(&path, BLOCK_SIZE).unwrap();
    let mut index = Index::open(store, Box::new(BytewiseOrdering), opts()).unwrap();
    for n in 0..100u64 {
        assert_eq!(index.try_get(&key(n)).unwrap(), Some(val(n)));
    }
    let flat = index.entries().unwrap();
    assert_eq!(flat.len(), 100);
    assert!(flat.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn mutations_after_reopen_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("churn.idx");

    let store = FileStore::create(&path, BLOCK_SIZE).unwrap();
    let mut index = Index::create(store, Box::new(BytewiseOrdering), opts()).unwrap();
    for n in 0..60u64 {
        index.insert(&key(n), &val(n)).unwrap();
    }
    drop(index.into_store());

    let store = FileStore::open(&path, BLOCK_SIZE).unwrap();
    let mut index = Index::open(store, Box::new(BytewiseOrdering), opts()).unwrap();
    for n in (0..60u64).step_by(2) {
        assert!(index.remove(&key(n)).unwrap());
    }
    index.insert(&key(1000), &val(1000)).unwrap();
    drop(index.into_store());

    let store = FileStore::open(&path, BLOCK_SIZE).unwrap();
    let mut index = Index::open(store, Box::new(BytewiseOrdering), opts()).unwrap();
    for n in 0..60u64 {
        let expected = if n % 2 == 0 { None } else { Some(val(n)) };
        assert_eq!(index.try_get(&key(n)).unwrap(), expected);
    }
    assert_eq!(index.try_get(&key(1000)).unwrap(), Some(val(1000)));
    assert_eq!(index.entries().unwrap().len(), 31);
}

#[test]
fn freed_blocks_are_reused_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bitmap.idx");

    let store = FileStore::create(&path, BLOCK_SIZE).unwrap();
    let mut index = Index::create(store, Box::new(BytewiseOrdering), opts()).unwrap();
    for n in 0..100u64 {
        index.insert(&key(n), &val(n)).unwrap();
    }
    for n in 0..100u64 {
        assert!(index.remove(&key(n)).unwrap());
    }
    drop(index.into_store());

    // An emptied tree reopened from disk allocates from the start again.
    let store = FileStore::open(&path, BLOCK_SIZE).unwrap();
    let mut index = Index::open(store, Box::new(BytewiseOrdering), opts()).unwrap();
    assert!(index.entries().unwrap().is_empty());
    for n in 0..100u64 {
        index.insert(&key(n), &val(n)).unwrap();
    }
    assert_eq!(index.entries().unwrap().len(), 100);
}

#[test]
fn torn_block_is_reported_as_corruption() {
    use std::io::{Seek, SeekFrom, Write};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.idx");

    let store = FileStore::create(&path, BLOCK_SIZE).unwrap();
    let mut index = Index::create(store, Box::new(BytewiseOrdering), opts()).unwrap();
    for n in 0..100u64 {
        index.insert(&key(n), &val(n)).unwrap();
    }
    drop(index.into_store());

    // Flip payload bytes in the first block region, past the container
    // header so the damage only shows up in the checksum.
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap();
    file.seek(SeekFrom::Start(8192 + 64)).unwrap();
    file.write_all(&[0xFF; 16]).unwrap();
    drop(file);

    let store = FileStore::open(&path, BLOCK_SIZE).unwrap();
    let mut index = Index::open(store, Box::new(BytewiseOrdering), opts()).unwrap();
    let mut saw_corruption = false;
    for n in 0..100u64 {
        if index.try_get(&key(n)).is_err() {
            saw_corruption = true;
            break;
        }
    }
    assert!(saw_corruption, "damaged block went undetected");
}

#[test]
fn file_store_round_trips_its_regions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("regions.idx");
    let mut store = FileStore::create(&path, BLOCK_SIZE).unwrap();
    store.write_root(b"root bytes").unwrap();
    store.write_bitmap(&[0b1]).unwrap();
    assert_eq!(store.read_root().unwrap(), b"root bytes");
    assert_eq!(store.read_bitmap().unwrap(), vec![0b1]);
}
