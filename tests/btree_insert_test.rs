//! End-to-end B+ tree insert scenarios against a real on-disk index file.

use std::sync::Arc;

use ferrokv::heap::handle_pool::FileHandlePool;
use ferrokv::{BTree, Pointer};
use tempfile::tempdir;

async fn open_tree(dir: &std::path::Path, degree: usize) -> BTree<u64, Pointer> {
    let handle_pool = Arc::new(FileHandlePool::new(8));
    BTree::open(1, degree, dir, handle_pool, true).await.unwrap()
}

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn sequential_insert_round_trips_in_order() {
    init_log();
    let dir = tempdir().unwrap();
    let tree = open_tree(dir.path(), 64).await;

    for i in 0..100u64 {
        tree.put(i, Pointer::data(i as i64 * 100 + 1, 0)).await.unwrap();
    }
    tree.flush().await.unwrap();

    for i in 0..100u64 {
        let got = tree.get(&i).await.unwrap().unwrap();
        assert_eq!(got, Pointer::data(i as i64 * 100 + 1, 0));
    }
    assert_eq!(tree.count().await.unwrap(), 100);
}

#[tokio::test]
async fn descending_insert_still_orders_ascending_on_range() {
    init_log();
    let dir = tempdir().unwrap();
    let tree = open_tree(dir.path(), 64).await;

    for i in (0..1000u64).rev() {
        tree.put(i, Pointer::data(i as i64, 0)).await.unwrap();
    }
    tree.flush().await.unwrap();

    assert_eq!(tree.count().await.unwrap(), 1000);
    let all = tree.range(&0u64, &999u64).await.unwrap();
    assert_eq!(all.len(), 1000);
    let keys: Vec<u64> = all.iter().map(|(k, _)| *k).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}

#[tokio::test]
async fn low_degree_tree_splits_root_into_internal_node() {
    init_log();
    let dir = tempdir().unwrap();
    let tree = open_tree(dir.path(), 10).await;

    // A degree-10 leaf holds at most 10 keys; the 11th insert forces a
    // root split, turning a single leaf root into a 2-level tree.
    for i in 0..10u64 {
        tree.put(i, Pointer::data(i as i64, 0)).await.unwrap();
    }
    for i in 0..10u64 {
        assert_eq!(tree.get(&i).await.unwrap(), Some(Pointer::data(i as i64, 0)));
    }

    tree.put(10, Pointer::data(10, 0)).await.unwrap();
    for i in 0..=10u64 {
        assert_eq!(tree.get(&i).await.unwrap(), Some(Pointer::data(i as i64, 0)));
    }
    assert_eq!(tree.count().await.unwrap(), 11);
}

#[tokio::test]
async fn hotspot_keys_resolve_correctly_in_large_tree() {
    init_log();
    let dir = tempdir().unwrap();
    let tree = open_tree(dir.path(), 32).await;

    for i in 0..1000u64 {
        tree.put(i, Pointer::data(i as i64, 0)).await.unwrap();
    }
    tree.flush().await.unwrap();

    let hotspots = [902u64, 903, 904, 905, 908, 909, 910, 913, 914, 915];
    for key in hotspots {
        assert_eq!(tree.get(&key).await.unwrap(), Some(Pointer::data(key as i64, 0)));
    }
}

#[tokio::test]
async fn reopening_index_file_preserves_contents() {
    init_log();
    let dir = tempdir().unwrap();
    {
        let tree = open_tree(dir.path(), 16).await;
        for i in 0..200u64 {
            tree.put(i, Pointer::data(i as i64, 0)).await.unwrap();
        }
        tree.flush().await.unwrap();
    }
    let reopened = open_tree(dir.path(), 16).await;
    for i in 0..200u64 {
        assert_eq!(reopened.get(&i).await.unwrap(), Some(Pointer::data(i as i64, 0)));
    }
}
