//! End-to-end tests for the storage engine: buffer manager, slotted
//! record segment, free-space inventory, and B+tree working together.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ferrite_buffer::BufferManager;
use ferrite_common::{BufferManagerConfig, PAGE_SIZE};
use ferrite_storage::{BTree, FsiSegment, SlottedPageRef, SpSegment, Table, TupleId};

fn create_buffer(page_count: usize, dir: &tempfile::TempDir) -> Arc<BufferManager> {
    Arc::new(
        BufferManager::new(BufferManagerConfig {
            data_dir: dir.path().to_path_buf(),
            page_count,
            fsync_enabled: false,
        })
        .unwrap(),
    )
}

fn create_record_segment(
    buffer: &Arc<BufferManager>,
) -> (SpSegment, Arc<FsiSegment>, Arc<Table>) {
    let table = Arc::new(Table::new("records", 1, 2));
    let fsi = Arc::new(FsiSegment::new(buffer.clone(), table.clone()).unwrap());
    let segment = SpSegment::new(buffer.clone(), fsi.clone(), table.clone());
    (segment, fsi, table)
}

#[test]
fn leaf_fill_keeps_single_leaf_root() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = create_buffer(64, &dir);
    let tree: BTree<u64, u64> = BTree::new(3, buffer).unwrap();
    let capacity = BTree::<u64, u64>::leaf_capacity() as u64;
    let root = tree.root_page();

    for key in 0..capacity {
        tree.insert(key, 2 * key).unwrap();
        assert_eq!(tree.lookup(&key).unwrap(), Some(2 * key));
    }

    assert_eq!(tree.height(), 1);
    assert_eq!(tree.root_page(), root);
}

#[test]
fn first_split_creates_two_child_root() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = create_buffer(64, &dir);
    let tree: BTree<u64, u64> = BTree::new(3, buffer.clone()).unwrap();
    let capacity = BTree::<u64, u64>::leaf_capacity() as u64;

    for key in 0..capacity {
        tree.insert(key, 2 * key).unwrap();
    }
    tree.insert(424242, 42).unwrap();

    assert_eq!(tree.height(), 2);
    let guard = buffer.fix_page(tree.root_page(), false).unwrap();
    let header = ferrite_storage::NodeHeader::read(guard.data());
    assert_eq!(header.level, 1);
    assert_eq!(header.count, 2);
    drop(guard);

    for key in 0..capacity {
        assert_eq!(tree.lookup(&key).unwrap(), Some(2 * key));
    }
    assert_eq!(tree.lookup(&424242).unwrap(), Some(42));
}

#[test]
fn erase_all_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = create_buffer(64, &dir);
    let tree: BTree<u64, u64> = BTree::new(3, buffer).unwrap();
    let n = 2 * BTree::<u64, u64>::leaf_capacity() as u64;

    for key in 0..n {
        tree.insert(key, 2 * key).unwrap();
    }

    for key in 0..n {
        tree.erase(&key).unwrap();
        assert_eq!(tree.lookup(&key).unwrap(), None);
        for probe in [key + 1, n - 1] {
            if probe > key && probe < n {
                assert_eq!(tree.lookup(&probe).unwrap(), Some(2 * probe));
            }
        }
    }
}

#[test]
fn record_grows_into_redirect() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = create_buffer(64, &dir);
    let (segment, _fsi, _table) = create_record_segment(&buffer);

    let quarter = PAGE_SIZE / 4;
    let tid = segment.allocate(quarter as u32, false).unwrap();
    let pattern: Vec<u8> = (0..quarter).map(|i| (i % 251) as u8).collect();
    segment.write(tid, &pattern).unwrap();

    // Occupy the rest of the page so the grown record has to move.
    segment.allocate((PAGE_SIZE / 2) as u32, false).unwrap();

    segment.resize(tid, (PAGE_SIZE * 3 / 4) as u32).unwrap();

    // The original slot is now a redirect and the target carries the
    // redirect-target flag.
    let guard = buffer.fix_page(tid.to_page_id(1), false).unwrap();
    let slot = SlottedPageRef::new(guard.data()).slot(tid.slot_id());
    assert!(slot.is_redirect());
    let target = slot.redirect_target();
    buffer.unfix_page(guard, false);

    let guard = buffer.fix_page(target.to_page_id(1), false).unwrap();
    let rslot = SlottedPageRef::new(guard.data()).slot(target.slot_id());
    assert!(rslot.is_redirect_target());
    buffer.unfix_page(guard, false);

    // The record still reads through the original TID, pattern intact.
    let mut buf = vec![0u8; PAGE_SIZE];
    let n = segment.read(tid, &mut buf).unwrap();
    assert_eq!(n, PAGE_SIZE * 3 / 4);
    assert_eq!(&buf[..quarter], &pattern[..]);
}

#[test]
fn free_cache_finds_next_page_after_vacate() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = create_buffer(64, &dir);
    let table = Arc::new(Table::new("t", 1, 2));
    table.allocated_pages.store(40, Ordering::Relaxed);
    let fsi = FsiSegment::new(buffer, table).unwrap();

    // 40 pages with known classes; pages 3, 19, 35 share class 3.
    for page in 0..40u64 {
        let class = (page % 16) as u8;
        fsi.update(page, fsi.decode_free_space(class)).unwrap();
    }
    assert_eq!(fsi.find(fsi.decode_free_space(3)), Some(3));

    // Page 3 vacates its class; the next page of that class takes over.
    fsi.update(3, 0).unwrap();
    assert_eq!(fsi.find(fsi.decode_free_space(3)), Some(19));

    // Vacate the remaining class-3 pages: the class drains to none, so a
    // request of that exact size falls through to a higher class.
    fsi.update(19, 0).unwrap();
    fsi.update(35, 0).unwrap();
    let fallthrough = fsi.find(fsi.decode_free_space(3));
    assert_eq!(fallthrough, Some(4));
}

#[test]
fn records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let tid;
    let payload = b"durable record payload";

    {
        let buffer = create_buffer(16, &dir);
        let (segment, _fsi, table) = create_record_segment(&buffer);
        tid = segment.allocate(payload.len() as u32, false).unwrap();
        segment.write(tid, payload).unwrap();
        assert_eq!(table.allocated_pages.load(Ordering::Relaxed), 1);
        // Dropping the buffer manager flushes all dirty pages.
    }

    {
        let buffer = create_buffer(16, &dir);
        let table = Arc::new(Table::new("records", 1, 2));
        table.allocated_pages.store(1, Ordering::Relaxed);
        let fsi = Arc::new(FsiSegment::new(buffer.clone(), table.clone()).unwrap());
        let segment = SpSegment::new(buffer, fsi, table);

        let mut buf = vec![0u8; payload.len()];
        assert_eq!(segment.read(tid, &mut buf).unwrap(), payload.len());
        assert_eq!(&buf[..], payload);
    }
}

#[test]
fn concurrent_disjoint_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = create_buffer(256, &dir);
    let tree: Arc<BTree<u64, u64>> = Arc::new(BTree::new(3, buffer).unwrap());

    let threads = 36u64;
    let per_thread = 2 * BTree::<u64, u64>::leaf_capacity() as u64;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = tree.clone();
            std::thread::spawn(move || {
                let start = t * per_thread;
                for key in start..start + per_thread {
                    tree.insert(key, 2 * key).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for key in 0..threads * per_thread {
        assert_eq!(tree.lookup(&key).unwrap(), Some(2 * key), "key {key}");
    }
}

#[test]
fn concurrent_readers_and_writers() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = create_buffer(128, &dir);
    let tree: Arc<BTree<u64, u64>> = Arc::new(BTree::new(3, buffer).unwrap());

    let n = 4 * BTree::<u64, u64>::leaf_capacity() as u64;
    for key in (0..n).step_by(2) {
        tree.insert(key, key).unwrap();
    }

    let writer = {
        let tree = tree.clone();
        std::thread::spawn(move || {
            for key in (1..n).step_by(2) {
                tree.insert(key, key).unwrap();
            }
        })
    };
    let reader = {
        let tree = tree.clone();
        std::thread::spawn(move || {
            for key in (0..n).step_by(2) {
                assert_eq!(tree.lookup(&key).unwrap(), Some(key));
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();

    for key in 0..n {
        assert_eq!(tree.lookup(&key).unwrap(), Some(key));
    }
}

#[test]
fn record_erase_frees_space_for_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = create_buffer(64, &dir);
    let (segment, _fsi, table) = create_record_segment(&buffer);

    // Two large records fill a page each.
    let big = (PAGE_SIZE * 2 / 3) as u32;
    let a = segment.allocate(big, false).unwrap();
    let b = segment.allocate(big, false).unwrap();
    assert_ne!(a.page_index(), b.page_index());
    assert_eq!(table.allocated_pages.load(Ordering::Relaxed), 2);

    // After erasing the first, its page serves the next allocation
    // instead of growing the table.
    segment.erase(a).unwrap();
    let c = segment.allocate(big, false).unwrap();
    assert_eq!(c.page_index(), a.page_index());
    assert_eq!(table.allocated_pages.load(Ordering::Relaxed), 2);
}

#[test]
fn many_small_records_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = create_buffer(32, &dir);
    let (segment, _fsi, _table) = create_record_segment(&buffer);

    let mut tids: Vec<(TupleId, Vec<u8>)> = Vec::new();
    for i in 0..500u32 {
        let len = 16 + (i % 48) as usize;
        let payload: Vec<u8> = (0..len).map(|j| (i as usize + j) as u8).collect();
        let tid = segment.allocate(len as u32, false).unwrap();
        segment.write(tid, &payload).unwrap();
        tids.push((tid, payload));
    }

    for (tid, payload) in &tids {
        let mut buf = vec![0u8; payload.len()];
        assert_eq!(segment.read(*tid, &mut buf).unwrap(), payload.len());
        assert_eq!(&buf, payload);
    }
}
