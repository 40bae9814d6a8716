//! End-to-end B+ tree delete/rebalance scenarios.

use std::sync::Arc;

use ferrokv::heap::handle_pool::FileHandlePool;
use ferrokv::{BTree, Pointer};
use tempfile::tempdir;

async fn open_tree(dir: &std::path::Path, degree: usize) -> BTree<u64, Pointer> {
    let handle_pool = Arc::new(FileHandlePool::new(8));
    BTree::open(1, degree, dir, handle_pool, true).await.unwrap()
}

#[tokio::test]
async fn delete_of_missing_key_is_a_no_op() {
    let dir = tempdir().unwrap();
    let tree = open_tree(dir.path(), 16).await;
    tree.put(1, Pointer::data(1, 0)).await.unwrap();
    assert_eq!(tree.remove(&99u64).await.unwrap(), None);
    assert_eq!(tree.count().await.unwrap(), 1);
}

#[tokio::test]
async fn delete_then_get_returns_none_and_reinsert_works() {
    let dir = tempdir().unwrap();
    let tree = open_tree(dir.path(), 16).await;
    for i in 0..50u64 {
        tree.put(i, Pointer::data(i as i64, 0)).await.unwrap();
    }

    let removed = tree.remove(&25u64).await.unwrap();
    assert_eq!(removed, Some(Pointer::data(25, 0)));
    assert_eq!(tree.get(&25u64).await.unwrap(), None);

    tree.put(25, Pointer::data(2500, 0)).await.unwrap();
    assert_eq!(tree.get(&25u64).await.unwrap(), Some(Pointer::data(2500, 0)));
}

#[tokio::test]
async fn deleting_down_to_one_key_collapses_internal_levels() {
    let dir = tempdir().unwrap();
    let tree = open_tree(dir.path(), 10).await;

    for i in 0..100u64 {
        tree.put(i, Pointer::data(i as i64, 0)).await.unwrap();
    }
    assert_eq!(tree.count().await.unwrap(), 100);

    for i in 1..100u64 {
        tree.remove(&i).await.unwrap();
    }
    assert_eq!(tree.count().await.unwrap(), 1);
    assert_eq!(tree.get(&0u64).await.unwrap(), Some(Pointer::data(0, 0)));

    // The tree is still usable after collapsing back to a single leaf root.
    tree.put(500, Pointer::data(500, 0)).await.unwrap();
    assert_eq!(tree.count().await.unwrap(), 2);
}

#[tokio::test]
async fn deleting_every_key_leaves_an_empty_tree() {
    let dir = tempdir().unwrap();
    let tree = open_tree(dir.path(), 8).await;
    for i in 0..30u64 {
        tree.put(i, Pointer::data(i as i64, 0)).await.unwrap();
    }
    for i in 0..30u64 {
        assert_eq!(tree.remove(&i).await.unwrap(), Some(Pointer::data(i as i64, 0)));
    }
    assert_eq!(tree.count().await.unwrap(), 0);
    assert_eq!(tree.get(&0u64).await.unwrap(), None);

    tree.put(1, Pointer::data(1, 0)).await.unwrap();
    assert_eq!(tree.get(&1u64).await.unwrap(), Some(Pointer::data(1, 0)));
}

#[tokio::test]
async fn range_reflects_deletions() {
    let dir = tempdir().unwrap();
    let tree = open_tree(dir.path(), 16).await;
    for i in 0..40u64 {
        tree.put(i, Pointer::data(i as i64, 0)).await.unwrap();
    }
    for i in (10..20u64).rev() {
        tree.remove(&i).await.unwrap();
    }
    let remaining = tree.range(&0u64, &39u64).await.unwrap();
    assert_eq!(remaining.len(), 30);
    assert!(remaining.iter().all(|(k, _)| !(10..20).contains(k)));
}
