//! Abstraction between the tree algorithm and the on-disk index file
//! (spec §4.5): immediate (every write durable right away) and buffered
//! (writes batched, flushed together) node sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::btree::node::Node;
use crate::btree::storage_manager::IndexStorageManager;
use crate::codec::FixedSize;
use crate::error::StorageResult;
use crate::pointer::Pointer;

#[async_trait]
pub trait NodeSession<K: FixedSize, V: FixedSize>: Send + Sync {
    async fn read(&self, pointer: &Pointer) -> StorageResult<Node<K, V>>;
    /// Writes `node` as a brand new node and returns its pointer.
    async fn write(&self, node: Node<K, V>) -> StorageResult<Pointer>;
    /// Overwrites an existing node at `pointer` with new contents.
    async fn update(&self, pointer: &Pointer, node: Node<K, V>) -> StorageResult<()>;
    async fn free(&self, pointer: &Pointer);
    async fn flush(&self) -> StorageResult<()>;
    async fn dispose(&self) -> StorageResult<()> {
        self.flush().await
    }
}

/// Every write goes straight to disk; the returned pointer is already
/// the durable location.
pub struct ImmediateSession<K: FixedSize, V: FixedSize> {
    storage: Arc<IndexStorageManager<K, V>>,
}

impl<K: FixedSize, V: FixedSize> ImmediateSession<K, V> {
    pub fn new(storage: Arc<IndexStorageManager<K, V>>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl<K: FixedSize, V: FixedSize> NodeSession<K, V> for ImmediateSession<K, V> {
    async fn read(&self, pointer: &Pointer) -> StorageResult<Node<K, V>> {
        self.storage.read_node(pointer).await
    }

    async fn write(&self, node: Node<K, V>) -> StorageResult<Pointer> {
        self.storage.write_new_node(&node).await
    }

    async fn update(&self, pointer: &Pointer, node: Node<K, V>) -> StorageResult<()> {
        self.storage.update_node(pointer, &node).await
    }

    async fn free(&self, pointer: &Pointer) {
        self.storage.free_node(pointer).await
    }

    async fn flush(&self) -> StorageResult<()> {
        self.storage.flush().await
    }
}

enum DirtyEntry<K: FixedSize, V: FixedSize> {
    New(Node<K, V>),
    Updated(Node<K, V>),
}

/// Reads are memoized; writes place the node in a dirty set under a
/// *temporary* pointer so the tree algorithm can keep referencing it
/// before it has a durable home. `flush` persists new nodes in the order
/// written, rewrites their pointers, and leaves updates to
/// already-persisted nodes to go through `update_node`.
pub struct BufferedSession<K: FixedSize, V: FixedSize> {
    storage: Arc<IndexStorageManager<K, V>>,
    read_cache: tokio::sync::Mutex<HashMap<Pointer, Node<K, V>>>,
    dirty: tokio::sync::Mutex<Vec<(Pointer, DirtyEntry<K, V>)>>,
    next_temp_id: std::sync::atomic::AtomicI64,
}

impl<K: FixedSize, V: FixedSize> BufferedSession<K, V> {
    pub fn new(storage: Arc<IndexStorageManager<K, V>>) -> Self {
        Self {
            storage,
            read_cache: tokio::sync::Mutex::new(HashMap::new()),
            dirty: tokio::sync::Mutex::new(Vec::new()),
            next_temp_id: std::sync::atomic::AtomicI64::new(-1),
        }
    }

    fn next_temp_pointer(&self) -> Pointer {
        let id = self
            .next_temp_id
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        Pointer::node(id, 0)
    }
}

#[async_trait]
impl<K: FixedSize, V: FixedSize> NodeSession<K, V> for BufferedSession<K, V> {
    async fn read(&self, pointer: &Pointer) -> StorageResult<Node<K, V>> {
        if let Some(node) = self.read_cache.lock().await.get(pointer) {
            return Ok(node.clone());
        }
        for (ptr, entry) in self.dirty.lock().await.iter() {
            if ptr == pointer {
                return Ok(match entry {
                    DirtyEntry::New(n) | DirtyEntry::Updated(n) => n.clone(),
                });
            }
        }
        let node = self.storage.read_node(pointer).await?;
        self.read_cache.lock().await.insert(*pointer, node.clone());
        Ok(node)
    }

    async fn write(&self, node: Node<K, V>) -> StorageResult<Pointer> {
        let temp = self.next_temp_pointer();
        self.dirty
            .lock()
            .await
            .push((temp, DirtyEntry::New(node.clone())));
        self.read_cache.lock().await.insert(temp, node);
        Ok(temp)
    }

    async fn update(&self, pointer: &Pointer, node: Node<K, V>) -> StorageResult<()> {
        let mut dirty = self.dirty.lock().await;
        if let Some(slot) = dirty.iter_mut().find(|(p, _)| p == pointer) {
            slot.1 = DirtyEntry::Updated(node.clone());
        } else {
            dirty.push((*pointer, DirtyEntry::Updated(node.clone())));
        }
        drop(dirty);
        self.read_cache.lock().await.insert(*pointer, node);
        Ok(())
    }

    async fn free(&self, pointer: &Pointer) {
        self.dirty.lock().await.retain(|(p, _)| p != pointer);
        self.read_cache.lock().await.remove(pointer);
        if !pointer.is_temporary() {
            self.storage.free_node(pointer).await;
        }
    }

    async fn flush(&self) -> StorageResult<()> {
        let entries: Vec<(Pointer, DirtyEntry<K, V>)> =
            std::mem::take(&mut *self.dirty.lock().await);
        let mut rewrites: HashMap<Pointer, Pointer> = HashMap::new();
        let mut cache = self.read_cache.lock().await;

        for (temp_or_real, entry) in entries {
            match entry {
                DirtyEntry::New(mut node) => {
                    rewrite_children(&mut node, &rewrites);
                    let real = self.storage.write_new_node(&node).await?;
                    debug!("buffered session: flushed new node {temp_or_real:?} -> {real:?}");
                    rewrites.insert(temp_or_real, real);
                    cache.remove(&temp_or_real);
                    cache.insert(real, node);
                }
                DirtyEntry::Updated(mut node) => {
                    rewrite_children(&mut node, &rewrites);
                    let real = *rewrites.get(&temp_or_real).unwrap_or(&temp_or_real);
                    self.storage.update_node(&real, &node).await?;
                    cache.insert(real, node);
                }
            }
        }
        drop(cache);

        // A brand new root (or a root reached only through a chain of
        // temporary pointers, e.g. right after a root split) is still
        // named by its temporary pointer in the on-disk header until the
        // rewrite is propagated here.
        let header = self.storage.header().await;
        let mut root = header.root_pointer;
        while let Some(&real) = rewrites.get(&root) {
            root = real;
        }
        if root != header.root_pointer {
            self.storage.set_root_pointer(root).await?;
        }

        self.storage.flush().await
    }
}

/// Propagates temporary-pointer-to-real-pointer rewrites into any
/// in-memory parent that references a newly-written child.
fn rewrite_children<K: FixedSize, V: FixedSize>(
    node: &mut Node<K, V>,
    rewrites: &HashMap<Pointer, Pointer>,
) {
    for child in node.children.iter_mut() {
        if let Some(real) = rewrites.get(child) {
            *child = *real;
        }
    }
    if let Some(next) = node.next_leaf.as_mut() {
        if let Some(real) = rewrites.get(next) {
            *next = *real;
        }
    }
}
