//! Duplicate-key secondary indexes: a thin decorator over a unique B+
//! tree whose value is a length-prefixed sorted vector of fixed-size
//! values (a "BinaryList"), stored through the paged heap and addressed
//! by the inner index via a [`Pointer`] (spec §4.4, last paragraph).
//!
//! Absent in the teacher repo (`small-db` only ever indexes a single
//! primary key); grounded on the fixed-width `Tuple` serialization style
//! used throughout the rest of this crate.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::btree::tree::BTree;
use crate::codec::FixedSize;
use crate::error::StorageResult;
use crate::heap::heap::PagedHeap;
use crate::pointer::Pointer;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryList<V: FixedSize> {
    values: Vec<V>,
}

impl<V: FixedSize> BinaryList<V> {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.values.len() * V::WIDTH);
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, self.values.len() as u32);
        buf.extend_from_slice(&len_buf);
        for v in &self.values {
            buf.extend_from_slice(&v.to_fixed_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let count = LittleEndian::read_u32(&bytes[0..4]) as usize;
        let mut values = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            values.push(V::decode_fixed(&bytes[offset..offset + V::WIDTH]));
            offset += V::WIDTH;
        }
        Self { values }
    }

    fn insert_sorted(&mut self, value: V) {
        match self.values.binary_search(&value) {
            Ok(pos) => self.values[pos] = value,
            Err(pos) => self.values.insert(pos, value),
        }
    }

    fn remove_sorted(&mut self, value: &V) -> bool {
        match self.values.binary_search(value) {
            Ok(pos) => {
                self.values.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn values(&self) -> &[V] {
        &self.values
    }
}

/// A secondary index allowing repeated keys: `K -> {V}`.
pub struct DuplicateIndex<K: FixedSize, V: FixedSize> {
    inner: BTree<K, Pointer>,
    heap: Arc<PagedHeap>,
    collection_id: i32,
}

impl<K: FixedSize, V: FixedSize> DuplicateIndex<K, V> {
    pub fn new(inner: BTree<K, Pointer>, heap: Arc<PagedHeap>, collection_id: i32) -> Self {
        Self {
            inner,
            heap,
            collection_id,
        }
    }

    pub async fn get(&self, key: &K) -> StorageResult<Vec<V>> {
        match self.inner.get(key).await? {
            Some(ptr) => {
                let obj = self.heap.select(&ptr).await?;
                Ok(obj
                    .map(|o| BinaryList::<V>::from_bytes(&o.data).values)
                    .unwrap_or_default())
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn put(&self, key: K, value: V) -> StorageResult<()> {
        match self.inner.get(&key).await? {
            Some(ptr) => {
                let mut list = match self.heap.select(&ptr).await? {
                    Some(obj) => BinaryList::<V>::from_bytes(&obj.data),
                    None => BinaryList::default(),
                };
                list.insert_sorted(value);
                let bytes = list.to_bytes();
                match self.heap.update(&ptr, &bytes).await {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        // Grew past the slot's reserved capacity: relocate.
                        self.heap.delete(&ptr).await?;
                        let new_ptr = self.heap.store(0, self.collection_id, 0, bytes).await?;
                        self.inner.put(key, new_ptr).await
                    }
                }
            }
            None => {
                let mut list = BinaryList::default();
                list.insert_sorted(value);
                let ptr = self
                    .heap
                    .store(0, self.collection_id, 0, list.to_bytes())
                    .await?;
                self.inner.put(key, ptr).await
            }
        }
    }

    /// Removes `value` from `key`'s list, deleting the key entirely when
    /// the list becomes empty.
    pub async fn remove(&self, key: &K, value: &V) -> StorageResult<bool> {
        let Some(ptr) = self.inner.get(key).await? else {
            return Ok(false);
        };
        let Some(obj) = self.heap.select(&ptr).await? else {
            return Ok(false);
        };
        let mut list = BinaryList::<V>::from_bytes(&obj.data);
        let removed = list.remove_sorted(value);
        if !removed {
            return Ok(false);
        }
        if list.values().is_empty() {
            self.heap.delete(&ptr).await?;
            self.inner.remove(key).await?;
        } else {
            self.heap.update(&ptr, &list.to_bytes()).await?;
        }
        Ok(true)
    }

    pub async fn count(&self, key: &K) -> StorageResult<usize> {
        Ok(self.get(key).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::handle_pool::FileHandlePool;
    use crate::heap::page_manager::PageManager;
    use tempfile::tempdir;

    #[test]
    fn binary_list_round_trips_through_bytes() {
        let mut list = BinaryList::<u64>::default();
        list.insert_sorted(30);
        list.insert_sorted(10);
        list.insert_sorted(20);
        assert_eq!(list.values(), &[10, 20, 30]);

        let bytes = list.to_bytes();
        let decoded = BinaryList::<u64>::from_bytes(&bytes);
        assert_eq!(decoded, list);
    }

    #[test]
    fn binary_list_insert_sorted_overwrites_duplicate() {
        let mut list = BinaryList::<u64>::default();
        list.insert_sorted(5);
        list.insert_sorted(5);
        assert_eq!(list.values(), &[5]);
    }

    #[test]
    fn binary_list_remove_sorted_reports_presence() {
        let mut list = BinaryList::<u64>::default();
        list.insert_sorted(1);
        list.insert_sorted(2);
        assert!(list.remove_sorted(&1));
        assert!(!list.remove_sorted(&1));
        assert_eq!(list.values(), &[2]);
    }

    async fn open_index(
        dir: &std::path::Path,
        degree: usize,
    ) -> DuplicateIndex<u64, u64> {
        let handle_pool = Arc::new(FileHandlePool::new(8));
        let inner = BTree::open(1, degree, dir, Arc::clone(&handle_pool), true)
            .await
            .unwrap();
        let page_manager = Arc::new(PageManager::new(256, 16, false));
        let heap = Arc::new(PagedHeap::new(
            2,
            dir.join("duplicate_heap.db"),
            page_manager,
            handle_pool,
        ));
        DuplicateIndex::new(inner, heap, 2)
    }

    #[tokio::test]
    async fn put_then_get_collects_every_value_for_a_key() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), 8).await;

        index.put(1, 100).await.unwrap();
        index.put(1, 200).await.unwrap();
        index.put(1, 50).await.unwrap();

        assert_eq!(index.get(&1).await.unwrap(), vec![50, 100, 200]);
        assert_eq!(index.count(&1).await.unwrap(), 3);
        assert!(index.get(&2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_drops_a_single_value_and_deletes_the_key_once_empty() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), 8).await;

        index.put(1, 100).await.unwrap();
        index.put(1, 200).await.unwrap();

        assert!(index.remove(&1, &100).await.unwrap());
        assert_eq!(index.get(&1).await.unwrap(), vec![200]);
        assert!(!index.remove(&1, &999).await.unwrap());

        assert!(index.remove(&1, &200).await.unwrap());
        assert!(index.get(&1).await.unwrap().is_empty());
        // Key is gone from the inner index entirely now, not just empty.
        assert!(index.inner.get(&1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_relocates_the_list_once_it_outgrows_its_slot() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), 8).await;

        // The slot's capacity is fixed at first write (shrink-only update
        // semantics), so growing a one-value list past its original size
        // forces `put` onto the delete-and-restore relocation path.
        for v in 0..64u64 {
            index.put(1, v).await.unwrap();
        }

        let mut values = index.get(&1).await.unwrap();
        values.sort_unstable();
        let expected: Vec<u64> = (0..64).collect();
        assert_eq!(values, expected);
        assert_eq!(index.count(&1).await.unwrap(), 64);
    }
}
