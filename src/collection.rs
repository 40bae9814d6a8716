//! Public per-collection API gluing the paged heap to its primary-key
//! B+ tree index (spec §6, "Caller-facing operations").

use std::sync::Arc;

use crate::btree::tree::BTree;
use crate::codec::FixedSize;
use crate::database::Transaction;
use crate::error::{StorageError, StorageResult};
use crate::heap::heap::PagedHeap;
use crate::pointer::Pointer;
use crate::wal::WalManager;

/// Extracts the primary key from a record's serialized bytes.
pub type KeyExtractor<K> = Arc<dyn Fn(&[u8]) -> K + Send + Sync>;

pub struct Collection<K: FixedSize> {
    collection_id: i32,
    name: String,
    heap: Arc<PagedHeap>,
    index: Arc<BTree<K, Pointer>>,
    key_extractor: KeyExtractor<K>,
    wal: Arc<WalManager>,
}

impl<K: FixedSize> Collection<K> {
    pub fn new(
        collection_id: i32,
        name: impl Into<String>,
        heap: Arc<PagedHeap>,
        index: Arc<BTree<K, Pointer>>,
        key_extractor: KeyExtractor<K>,
        wal: Arc<WalManager>,
    ) -> Self {
        Self {
            collection_id,
            name: name.into(),
            heap,
            index,
            key_extractor,
            wal,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection_id(&self) -> i32 {
        self.collection_id
    }

    pub fn heap(&self) -> &Arc<PagedHeap> {
        &self.heap
    }

    pub fn index(&self) -> &Arc<BTree<K, Pointer>> {
        &self.index
    }

    /// Stores `record` under its extracted key and logs the insert to the
    /// WAL so it survives a crash once `txn` commits (spec §4.7, §5's
    /// force-log-at-commit policy).
    pub async fn insert(&self, txn: &Transaction, record: Vec<u8>) -> StorageResult<Pointer> {
        let key = (self.key_extractor)(&record);
        if self.index.get(&key).await?.is_some() {
            return Err(StorageError::invalid_argument(format!(
                "duplicate primary key in collection {}",
                self.name
            )));
        }
        let pointer = self.heap.store(0, self.collection_id, 0, record).await?;
        let after_image = self
            .heap
            .raw_bytes(&pointer)
            .await?
            .expect("just-stored pointer must resolve");
        // Undoing an insert has no prior slot to restore; the before-image
        // is the same slot with its alive bit cleared, so undo just hides it.
        let before_image = crate::page::Page::raw_slot_with_alive(&after_image, false);
        self.wal
            .update(txn.id, self.collection_id, pointer, before_image, after_image)
            .await?;
        self.index.put(key, pointer).await?;
        Ok(pointer)
    }

    pub async fn select(&self, key: &K) -> StorageResult<Option<Vec<u8>>> {
        match self.index.get(key).await? {
            Some(pointer) => Ok(self.heap.select(&pointer).await?.map(|o| o.data)),
            None => Ok(None),
        }
    }

    /// Re-extracts the key from `record` and rewrites it in place; the new
    /// encoding must not exceed the original slot's capacity.
    pub async fn update(&self, txn: &Transaction, record: Vec<u8>) -> StorageResult<()> {
        let key = (self.key_extractor)(&record);
        let pointer = self
            .index
            .get(&key)
            .await?
            .ok_or_else(|| StorageError::invalid_argument("update of nonexistent key"))?;
        let before_image = self
            .heap
            .raw_bytes(&pointer)
            .await?
            .ok_or_else(|| StorageError::invalid_argument("update of nonexistent key"))?;
        self.heap.update(&pointer, &record).await?;
        let after_image = self
            .heap
            .raw_bytes(&pointer)
            .await?
            .expect("just-updated pointer must resolve");
        self.wal
            .update(txn.id, self.collection_id, pointer, before_image, after_image)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, txn: &Transaction, key: &K) -> StorageResult<bool> {
        match self.index.remove(key).await? {
            Some(pointer) => {
                let before_image = self
                    .heap
                    .raw_bytes(&pointer)
                    .await?
                    .expect("indexed pointer must resolve to a live record");
                self.heap.delete(&pointer).await?;
                let after_image = crate::page::Page::raw_slot_with_alive(&before_image, false);
                self.wal
                    .update(txn.id, self.collection_id, pointer, before_image, after_image)
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn scan(&self) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self
            .heap
            .scan(self.collection_id)
            .await?
            .into_iter()
            .map(|o| o.data)
            .collect())
    }

    async fn resolve_pairs(&self, pairs: Vec<(K, Pointer)>) -> StorageResult<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(pairs.len());
        for (_, pointer) in pairs {
            if let Some(obj) = self.heap.select(&pointer).await? {
                out.push(obj.data);
            }
        }
        Ok(out)
    }

    pub async fn range(&self, min_key: &K, max_key: &K) -> StorageResult<Vec<Vec<u8>>> {
        let pairs = self.index.range(min_key, max_key).await?;
        self.resolve_pairs(pairs).await
    }

    pub async fn greater_than(&self, key: &K) -> StorageResult<Vec<Vec<u8>>> {
        let pairs = self.index.greater_than(key).await?;
        self.resolve_pairs(pairs).await
    }

    pub async fn less_than(&self, key: &K) -> StorageResult<Vec<Vec<u8>>> {
        let pairs = self.index.less_than(key).await?;
        self.resolve_pairs(pairs).await
    }

    pub async fn count(&self) -> StorageResult<usize> {
        self.index.count().await
    }

    pub async fn flush(&self) -> StorageResult<()> {
        self.heap.flush().await?;
        self.index.flush().await
    }
}
