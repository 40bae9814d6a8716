//! Disk-backed ordered map: search/insert/delete/range (spec §4.4).

use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};

use crate::btree::node::Node;
use crate::btree::session::{BufferedSession, ImmediateSession, NodeSession};
use crate::btree::storage_manager::IndexStorageManager;
use crate::codec::FixedSize;
use crate::error::StorageResult;
use crate::heap::handle_pool::FileHandlePool;
use crate::pointer::Pointer;

pub struct BTree<K: FixedSize, V: FixedSize> {
    storage: Arc<IndexStorageManager<K, V>>,
    session: Arc<dyn NodeSession<K, V>>,
    degree: usize,
}

impl<K: FixedSize, V: FixedSize> BTree<K, V> {
    pub async fn open(
        index_id: i32,
        degree: usize,
        base_path: impl AsRef<Path>,
        handle_pool: Arc<FileHandlePool>,
        use_buffered_io: bool,
    ) -> StorageResult<Self> {
        let storage = Arc::new(
            IndexStorageManager::open(index_id, degree, base_path, handle_pool).await?,
        );
        let session: Arc<dyn NodeSession<K, V>> = if use_buffered_io {
            Arc::new(BufferedSession::new(Arc::clone(&storage)))
        } else {
            Arc::new(ImmediateSession::new(Arc::clone(&storage)))
        };
        Ok(Self {
            storage,
            session,
            degree,
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    fn minimum(&self) -> usize {
        Node::<K, V>::minimum(self.degree)
    }

    async fn root_pointer(&self) -> Pointer {
        self.storage.header().await.root_pointer
    }

    /// Allocates the next value for an auto-incrementing integer primary
    /// key, persisted in the index header's `last_auto_key`.
    pub async fn next_auto_key(&self) -> StorageResult<i64> {
        self.storage.next_auto_key().await
    }

    pub async fn get(&self, key: &K) -> StorageResult<Option<V>> {
        let root_ptr = self.root_pointer().await;
        if root_ptr.is_empty() {
            return Ok(None);
        }
        let mut ptr = root_ptr;
        let mut node = self.session.read(&ptr).await?;
        while !node.is_leaf() {
            let idx = node.keys.partition_point(|k| k <= key);
            ptr = node.children[idx];
            node = self.session.read(&ptr).await?;
        }
        Ok(match node.keys.binary_search(key) {
            Ok(pos) => Some(node.values[pos].clone()),
            Err(_) => None,
        })
    }

    pub async fn contains_key(&self, key: &K) -> StorageResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn count(&self) -> StorageResult<usize> {
        let root_ptr = self.root_pointer().await;
        if root_ptr.is_empty() {
            return Ok(0);
        }
        let mut ptr = self.leftmost_leaf_ptr(root_ptr).await?;
        let mut total = 0usize;
        loop {
            let node = self.session.read(&ptr).await?;
            total += node.keys.len();
            match node.next_leaf {
                Some(next) => ptr = next,
                None => break,
            }
        }
        Ok(total)
    }

    async fn leftmost_leaf_ptr(&self, mut ptr: Pointer) -> StorageResult<Pointer> {
        let mut node = self.session.read(&ptr).await?;
        while !node.is_leaf() {
            ptr = node.children[0];
            node = self.session.read(&ptr).await?;
        }
        Ok(ptr)
    }

    async fn leaf_ptr_for(&self, mut ptr: Pointer, key: &K) -> StorageResult<Pointer> {
        let mut node = self.session.read(&ptr).await?;
        while !node.is_leaf() {
            let idx = node.keys.partition_point(|k| k <= key);
            ptr = node.children[idx];
            node = self.session.read(&ptr).await?;
        }
        Ok(ptr)
    }

    /// Every key `k` with `min <= k <= max`, ascending.
    pub async fn range(&self, min: &K, max: &K) -> StorageResult<Vec<(K, V)>> {
        let root_ptr = self.root_pointer().await;
        if root_ptr.is_empty() {
            return Ok(Vec::new());
        }
        let mut ptr = self.leaf_ptr_for(root_ptr, min).await?;
        let mut out = Vec::new();
        'outer: loop {
            let node = self.session.read(&ptr).await?;
            for (k, v) in node.keys.iter().zip(node.values.iter()) {
                if k < min {
                    continue;
                }
                if k > max {
                    break 'outer;
                }
                out.push((k.clone(), v.clone()));
            }
            match node.next_leaf {
                Some(next) => ptr = next,
                None => break,
            }
        }
        Ok(out)
    }

    pub async fn greater_than(&self, min: &K) -> StorageResult<Vec<(K, V)>> {
        let root_ptr = self.root_pointer().await;
        if root_ptr.is_empty() {
            return Ok(Vec::new());
        }
        let mut ptr = self.leaf_ptr_for(root_ptr, min).await?;
        let mut out = Vec::new();
        loop {
            let node = self.session.read(&ptr).await?;
            for (k, v) in node.keys.iter().zip(node.values.iter()) {
                if k >= min {
                    out.push((k.clone(), v.clone()));
                }
            }
            match node.next_leaf {
                Some(next) => ptr = next,
                None => break,
            }
        }
        Ok(out)
    }

    pub async fn less_than(&self, max: &K) -> StorageResult<Vec<(K, V)>> {
        let root_ptr = self.root_pointer().await;
        if root_ptr.is_empty() {
            return Ok(Vec::new());
        }
        let mut ptr = self.leftmost_leaf_ptr(root_ptr).await?;
        let mut out = Vec::new();
        'outer: loop {
            let node = self.session.read(&ptr).await?;
            for (k, v) in node.keys.iter().zip(node.values.iter()) {
                if k >= max {
                    break 'outer;
                }
                out.push((k.clone(), v.clone()));
            }
            match node.next_leaf {
                Some(next) => ptr = next,
                None => break,
            }
        }
        Ok(out)
    }

    pub async fn put(&self, key: K, value: V) -> StorageResult<()> {
        let root_ptr = self.root_pointer().await;
        if root_ptr.is_empty() {
            let mut leaf = Node::new_leaf();
            leaf.is_root = true;
            leaf.keys.push(key);
            leaf.values.push(value);
            let ptr = self.session.write(leaf).await?;
            self.storage.set_root_pointer(ptr).await?;
            return Ok(());
        }

        let mut ptr = root_ptr;
        let mut node = self.session.read(&ptr).await?;

        if node.is_full(self.degree) {
            node.is_root = false;
            self.session.update(&ptr, node.clone()).await?;

            let mut new_root = Node::new_internal();
            new_root.is_root = true;
            new_root.children = vec![ptr];
            let new_root_ptr = self.session.write(new_root.clone()).await?;

            self.split_child(&new_root_ptr, &mut new_root, 0, &ptr, &mut node)
                .await?;
            self.storage.set_root_pointer(new_root_ptr).await?;

            ptr = new_root_ptr;
            node = new_root;
        }

        self.insert_non_full(ptr, node, key, value).await
    }

    fn insert_non_full<'a>(
        &'a self,
        ptr: Pointer,
        mut node: Node<K, V>,
        key: K,
        value: V,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = StorageResult<()>> + Send + 'a>>
    where
        K: 'a,
        V: 'a,
    {
        Box::pin(async move {
            if node.is_leaf() {
                match node.keys.binary_search(&key) {
                    Ok(pos) => node.values[pos] = value,
                    Err(pos) => {
                        node.keys.insert(pos, key);
                        node.values.insert(pos, value);
                    }
                }
                self.session.update(&ptr, node).await
            } else {
                let mut idx = node.keys.partition_point(|k| *k <= key);
                let mut child_ptr = node.children[idx];
                let mut child = self.session.read(&child_ptr).await?;

                if child.is_full(self.degree) {
                    self.split_child(&ptr, &mut node, idx, &child_ptr, &mut child)
                        .await?;
                    if idx < node.keys.len() && key >= node.keys[idx] {
                        idx += 1;
                    }
                    child_ptr = node.children[idx];
                    child = self.session.read(&child_ptr).await?;
                }
                self.insert_non_full(child_ptr, child, key, value).await
            }
        })
    }

    /// Splits the full child at `child_idx` of `parent`, promoting/linking
    /// as appropriate, and persists parent, child and the new sibling.
    async fn split_child(
        &self,
        parent_ptr: &Pointer,
        parent: &mut Node<K, V>,
        child_idx: usize,
        child_ptr: &Pointer,
        child: &mut Node<K, V>,
    ) -> StorageResult<()> {
        if child.is_leaf() {
            let mid = child.keys.len() / 2;
            let mut right = Node::new_leaf();
            right.keys = child.keys.split_off(mid);
            right.values = child.values.split_off(mid);
            right.next_leaf = child.next_leaf;

            let right_ptr = self.session.write(right.clone()).await?;
            child.next_leaf = Some(right_ptr);
            self.session.update(child_ptr, child.clone()).await?;

            let sep = right.keys[0].clone();
            parent.keys.insert(child_idx, sep);
            parent.children.insert(child_idx + 1, right_ptr);
            self.session.update(parent_ptr, parent.clone()).await?;
            debug!("split leaf {child_ptr:?} -> new right sibling {right_ptr:?}");
        } else {
            let mid = child.keys.len() / 2;
            let mut right = Node::new_internal();
            right.keys = child.keys.split_off(mid + 1);
            let median = child.keys.pop().expect("full internal node has a median key");
            right.children = child.children.split_off(mid + 1);

            let right_ptr = self.session.write(right.clone()).await?;
            self.session.update(child_ptr, child.clone()).await?;

            parent.keys.insert(child_idx, median);
            parent.children.insert(child_idx + 1, right_ptr);
            self.session.update(parent_ptr, parent.clone()).await?;
            debug!("split internal {child_ptr:?} -> new right sibling {right_ptr:?}");
        }
        Ok(())
    }

    pub async fn remove(&self, key: &K) -> StorageResult<Option<V>> {
        let root_ptr = self.root_pointer().await;
        if root_ptr.is_empty() {
            return Ok(None);
        }

        let mut path: Vec<(Pointer, usize)> = Vec::new();
        let mut ptr = root_ptr;
        let mut node = self.session.read(&ptr).await?;
        while !node.is_leaf() {
            let idx = node.keys.partition_point(|k| k <= key);
            path.push((ptr, idx));
            ptr = node.children[idx];
            node = self.session.read(&ptr).await?;
        }

        let pos = match node.keys.binary_search(key) {
            Ok(pos) => pos,
            Err(_) => return Ok(None),
        };
        node.keys.remove(pos);
        let removed_value = node.values.remove(pos);
        self.session.update(&ptr, node.clone()).await?;

        let mut current_ptr = ptr;
        let mut current = node;
        while let Some((parent_ptr, child_idx)) = path.pop() {
            if current.is_root || !current.is_under_minimum(self.degree) {
                break;
            }
            let mut parent = self.session.read(&parent_ptr).await?;
            self.rebalance(&parent_ptr, &mut parent, child_idx, &current_ptr, current)
                .await?;
            current_ptr = parent_ptr;
            current = parent;
        }

        self.collapse_empty_root().await?;
        Ok(Some(removed_value))
    }

    async fn collapse_empty_root(&self) -> StorageResult<()> {
        let root_ptr = self.root_pointer().await;
        if root_ptr.is_empty() {
            return Ok(());
        }
        let root = self.session.read(&root_ptr).await?;
        if !root.is_leaf() && root.keys.is_empty() {
            let only_child_ptr = root.children[0];
            let mut child = self.session.read(&only_child_ptr).await?;
            child.is_root = true;
            self.session.update(&only_child_ptr, child).await?;
            self.storage.set_root_pointer(only_child_ptr).await?;
            self.session.free(&root_ptr).await;
        }
        Ok(())
    }

    /// Fixes up an under-minimum child by borrowing from a sibling or
    /// merging, per §4.4's delete algorithm.
    async fn rebalance(
        &self,
        parent_ptr: &Pointer,
        parent: &mut Node<K, V>,
        child_idx: usize,
        child_ptr: &Pointer,
        mut child: Node<K, V>,
    ) -> StorageResult<()> {
        let minimum = self.minimum();

        if child_idx > 0 {
            let left_ptr = parent.children[child_idx - 1];
            let mut left = self.session.read(&left_ptr).await?;
            if left.keys.len() > minimum {
                if child.is_leaf() {
                    let k = left.keys.pop().unwrap();
                    let v = left.values.pop().unwrap();
                    child.keys.insert(0, k.clone());
                    child.values.insert(0, v);
                    parent.keys[child_idx - 1] = k;
                } else {
                    let moved_key = left.keys.pop().unwrap();
                    let moved_child = left.children.pop().unwrap();
                    let old_sep = parent.keys[child_idx - 1].clone();
                    child.keys.insert(0, old_sep);
                    child.children.insert(0, moved_child);
                    parent.keys[child_idx - 1] = moved_key;
                }
                self.session.update(&left_ptr, left).await?;
                self.session.update(child_ptr, child).await?;
                self.session.update(parent_ptr, parent.clone()).await?;
                return Ok(());
            }
        }

        if child_idx + 1 < parent.children.len() {
            let right_ptr = parent.children[child_idx + 1];
            let mut right = self.session.read(&right_ptr).await?;
            if right.keys.len() > minimum {
                if child.is_leaf() {
                    let k = right.keys.remove(0);
                    let v = right.values.remove(0);
                    child.keys.push(k);
                    child.values.push(v);
                    parent.keys[child_idx] = right.keys[0].clone();
                } else {
                    let moved_key = right.keys.remove(0);
                    let moved_child = right.children.remove(0);
                    let old_sep = parent.keys[child_idx].clone();
                    child.keys.push(old_sep);
                    child.children.push(moved_child);
                    parent.keys[child_idx] = moved_key;
                }
                self.session.update(&right_ptr, right).await?;
                self.session.update(child_ptr, child).await?;
                self.session.update(parent_ptr, parent.clone()).await?;
                return Ok(());
            }
        }

        // Neither sibling has spare entries: merge into whichever side
        // exists, preferring the left.
        if child_idx > 0 {
            let left_ptr = parent.children[child_idx - 1];
            let mut left = self.session.read(&left_ptr).await?;
            let separator = parent.keys[child_idx - 1].clone();
            if self.merge_into(&mut left, &child, separator) {
                self.session.update(&left_ptr, left).await?;
                self.session.free(child_ptr).await;
                parent.keys.remove(child_idx - 1);
                parent.children.remove(child_idx);
                self.session.update(parent_ptr, parent.clone()).await?;
            } else {
                warn!(
                    "merge aborted: combined key count would exceed degree {}; leaving nodes unmerged",
                    self.degree
                );
                self.session.update(child_ptr, child).await?;
            }
        } else if child_idx + 1 < parent.children.len() {
            let right_ptr = parent.children[child_idx + 1];
            let right = self.session.read(&right_ptr).await?;
            let separator = parent.keys[child_idx].clone();
            if self.merge_into(&mut child, &right, separator) {
                self.session.update(child_ptr, child).await?;
                self.session.free(&right_ptr).await;
                parent.keys.remove(child_idx);
                parent.children.remove(child_idx + 1);
                self.session.update(parent_ptr, parent.clone()).await?;
            } else {
                warn!(
                    "merge aborted: combined key count would exceed degree {}; leaving nodes unmerged",
                    self.degree
                );
                self.session.update(child_ptr, child).await?;
            }
        }
        Ok(())
    }

    /// Merges `right` into `left` in place. Returns `false` (and leaves
    /// both untouched) if the combined key count would exceed `degree`.
    fn merge_into(&self, left: &mut Node<K, V>, right: &Node<K, V>, separator: K) -> bool {
        if left.is_leaf() {
            if left.keys.len() + right.keys.len() > self.degree {
                return false;
            }
            left.keys.extend(right.keys.iter().cloned());
            left.values.extend(right.values.iter().cloned());
            left.next_leaf = right.next_leaf;
        } else {
            if left.keys.len() + 1 + right.keys.len() > self.degree {
                return false;
            }
            left.keys.push(separator);
            left.keys.extend(right.keys.iter().cloned());
            left.children.extend(right.children.iter().cloned());
        }
        true
    }

    pub async fn flush(&self) -> StorageResult<()> {
        self.session.flush().await
    }
}
