//! Fixed-size page allocator and LRU cache keyed by `(collection_id,
//! position)` (spec §4.3).

use std::collections::HashMap;
use std::io::SeekFrom;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{StorageError, StorageResult};
use crate::heap::handle_pool::FileHandlePool;
use crate::page::Page;

type CacheKey = (i32, i64);

struct PerCollectionState {
    free_list: Vec<i64>,
    /// Next unallocated byte position; page 0 is reserved and skipped.
    next_position: i64,
}

impl PerCollectionState {
    fn new(page_size: usize) -> Self {
        Self {
            free_list: Vec::new(),
            next_position: page_size as i64,
        }
    }
}

pub struct PageManager {
    page_size: usize,
    checksums: bool,
    cache: AsyncMutex<LruCache<CacheKey, Page>>,
    /// Pages currently checked out for mutation. Bounded like `cache`: a
    /// page never leaves RAM while referenced here, but pushing past
    /// capacity evicts the least-recently-touched entry and, if it is
    /// dirty, forces a write before it is dropped (spec §3).
    active: AsyncMutex<LruCache<CacheKey, Page>>,
    collections: AsyncMutex<HashMap<i32, PerCollectionState>>,
}

impl PageManager {
    pub fn new(page_size: usize, cache_capacity: usize, checksums: bool) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        Self {
            page_size,
            checksums,
            cache: AsyncMutex::new(LruCache::new(capacity)),
            active: AsyncMutex::new(LruCache::new(capacity)),
            collections: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Inserts `page` into the bounded active set. If this pushes the set
    /// past capacity, the evicted entry is written back first when dirty,
    /// per the eviction-forces-a-write lifecycle.
    async fn insert_active(
        &self,
        collection_id: i32,
        position: i64,
        page: Page,
        handle_pool: &FileHandlePool,
        path: impl AsRef<std::path::Path>,
    ) -> StorageResult<()> {
        let key = (collection_id, position);
        let evicted = self.active.lock().await.push(key, page);
        if let Some((evicted_key, evicted_page)) = evicted {
            if evicted_key != key && evicted_page.dirty {
                self.write_page(evicted_key.0, evicted_key.1, evicted_page, handle_pool, path)
                    .await?;
            }
        }
        Ok(())
    }

    /// (1) pops the collection's free list if non-empty, zeroing the page;
    /// (2) otherwise advances the next-position counter, skipping page 0.
    pub async fn allocate_page(
        &self,
        collection_id: i32,
        handle_pool: &FileHandlePool,
        path: impl AsRef<std::path::Path>,
    ) -> StorageResult<Page> {
        let mut collections = self.collections.lock().await;
        let state = collections
            .entry(collection_id)
            .or_insert_with(|| PerCollectionState::new(self.page_size));

        let position = if let Some(pos) = state.free_list.pop() {
            pos
        } else {
            let pos = state.next_position;
            state.next_position += self.page_size as i64;
            pos
        };
        drop(collections);

        let page_number = (position / self.page_size as i64) as i32;
        let page = Page::zeroed(page_number, self.page_size);
        self.insert_active(collection_id, position, page.clone(), handle_pool, path)
            .await?;
        Ok(page)
    }

    /// Consults the cache, then the in-memory active-page set, then disk.
    /// A read past end-of-file yields a freshly zeroed page so a
    /// newly-allocated-but-unflushed page can still be found.
    pub async fn load_page(
        &self,
        collection_id: i32,
        position: i64,
        handle_pool: &FileHandlePool,
        path: impl AsRef<std::path::Path>,
    ) -> StorageResult<Page> {
        let key = (collection_id, position);

        if let Some(page) = self.cache.lock().await.get(&key) {
            return Ok(page.clone());
        }
        if let Some(page) = self.active.lock().await.get(&key) {
            return Ok(page.clone());
        }

        let handle = handle_pool.get(collection_id, path).await?;
        let mut file = handle.lock().await;
        let file_len = file.metadata()?.len();
        let page_number = (position / self.page_size as i64) as i32;

        if (position as u64) + (self.page_size as u64) > file_len {
            return Ok(Page::zeroed(page_number, self.page_size));
        }

        use std::io::{Read, Seek};
        file.seek(SeekFrom::Start(position as u64))?;
        let mut buf = vec![0u8; self.page_size];
        match file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(Page::zeroed(page_number, self.page_size));
            }
            Err(e) => return Err(e.into()),
        }
        let page = Page::from_bytes(buf)?;
        if self.checksums && !page.verify_checksum() {
            return Err(StorageError::CorruptWireFormat(format!(
                "page checksum mismatch at collection {collection_id} position {position}"
            )));
        }
        self.cache.lock().await.put(key, page.clone());
        Ok(page)
    }

    /// Serializes `page` to its position, fsyncs through the handle pool,
    /// clears the dirty bit and refreshes the cache entry.
    pub async fn write_page(
        &self,
        collection_id: i32,
        position: i64,
        mut page: Page,
        handle_pool: &FileHandlePool,
        path: impl AsRef<std::path::Path>,
    ) -> StorageResult<()> {
        if self.checksums {
            page.write_checksum();
        }
        let handle = handle_pool.get(collection_id, path).await?;
        {
            let mut file = handle.lock().await;
            use std::io::{Seek, Write as _};
            file.seek(SeekFrom::Start(position as u64))?;
            file.write_all(page.to_bytes())?;
            file.sync_all()?;
        }
        page.dirty = false;
        let key = (collection_id, position);
        self.active.lock().await.pop(&key);
        self.cache.lock().await.put(key, page);
        Ok(())
    }

    /// Pushes `position` to the free list and drops any cached copy.
    pub async fn free_page(&self, collection_id: i32, position: i64) {
        let mut collections = self.collections.lock().await;
        let state = collections
            .entry(collection_id)
            .or_insert_with(|| PerCollectionState::new(self.page_size));
        state.free_list.push(position);
        drop(collections);

        let key = (collection_id, position);
        self.active.lock().await.pop(&key);
        self.cache.lock().await.pop(&key);
    }

    /// Writes back every dirty page currently checked out as active for
    /// `collection_id`.
    pub async fn flush_active(
        &self,
        collection_id: i32,
        handle_pool: &FileHandlePool,
        path: impl AsRef<std::path::Path> + Clone,
    ) -> StorageResult<()> {
        let dirty: Vec<(i64, Page)> = {
            let active = self.active.lock().await;
            active
                .iter()
                .filter(|((cid, _), page)| *cid == collection_id && page.dirty)
                .map(|((_, pos), page)| (*pos, page.clone()))
                .collect()
        };
        for (position, page) in dirty {
            self.write_page(collection_id, position, page, handle_pool, path.clone())
                .await?;
        }
        Ok(())
    }

    /// Updates the checked-out copy of an active page in place (used by
    /// the heap after `append`/`update_at`/`mark_deleted`). May force a
    /// write of a different page evicted to make room (see
    /// [`PageManager::insert_active`]).
    pub async fn put_active(
        &self,
        collection_id: i32,
        position: i64,
        page: Page,
        handle_pool: &FileHandlePool,
        path: impl AsRef<std::path::Path>,
    ) -> StorageResult<()> {
        self.insert_active(collection_id, position, page, handle_pool, path)
            .await
    }

    pub async fn get_active(&self, collection_id: i32, position: i64) -> Option<Page> {
        self.active
            .lock()
            .await
            .get(&(collection_id, position))
            .cloned()
    }

    pub fn position_to_offsets(&self, position: i64) -> (i32, usize) {
        let page_number = (position / self.page_size as i64) as i32;
        let offset_in_page = (position % self.page_size as i64) as usize;
        (page_number, offset_in_page)
    }
}

pub(crate) type SharedPageManager = Arc<PageManager>;
