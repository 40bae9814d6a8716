//! Top-level database handle (spec §6): opens the on-disk layout, runs
//! WAL recovery, and routes collection creation/lookup plus transaction
//! bookkeeping to the kernel components below it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use log::info;
use tokio::sync::Mutex as AsyncMutex;

use crate::btree::tree::BTree;
use crate::catalog::Catalog;
use crate::codec::FixedSize;
use crate::collection::{Collection, KeyExtractor};
use crate::config::{Config, IsolationLevel};
use crate::error::{StorageError, StorageResult};
use crate::heap::handle_pool::FileHandlePool;
use crate::heap::heap::PagedHeap;
use crate::heap::page_manager::PageManager;
use crate::lock::LockManager;
use crate::mvcc::MvccManager;
use crate::pointer::Pointer;
use crate::wal::{recover, WalManager};

/// Type-erases a `BTree<K, V>` so [`Database`] can hold every open
/// collection's index in one map and flush them all at checkpoint/close
/// time without being generic over every collection's key type.
#[async_trait]
trait FlushableIndex: Send + Sync {
    async fn flush_index(&self) -> StorageResult<()>;
}

#[async_trait]
impl<K: FixedSize, V: FixedSize> FlushableIndex for BTree<K, V> {
    async fn flush_index(&self) -> StorageResult<()> {
        self.flush().await
    }
}

/// A begun-but-not-yet-resolved transaction. Collection operations take
/// this by reference to thread WAL logging and MVCC visibility through
/// the kernel; resolving it is the caller's job via
/// [`Database::commit`]/[`Database::rollback`].
pub struct Transaction {
    pub id: i64,
    pub isolation: IsolationLevel,
    pub start_ts: i64,
}

pub struct Database {
    base_path: PathBuf,
    config: Config,
    catalog: Catalog,
    handle_pool: Arc<FileHandlePool>,
    page_manager: Arc<PageManager>,
    heaps: DashMap<i32, Arc<PagedHeap>>,
    indices: DashMap<i32, Arc<dyn FlushableIndex>>,
    wal: Arc<WalManager>,
    lock_manager: Arc<LockManager>,
    mvcc: Arc<MvccManager>,
    next_txn_id: AtomicI64,
    logical_clock: AtomicI64,
    active_txns: DashSet<i64>,
    committed_since_checkpoint: AtomicU64,
    group_commit: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Database {
    /// Opens (creating if missing) the database rooted at `base_path`,
    /// replaying the WAL before returning so no user traffic observes a
    /// torn recovery.
    pub async fn open(base_path: impl AsRef<Path>, config: Config) -> StorageResult<Self> {
        let config = config.validate()?;
        let base_path = base_path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_path).await?;

        let catalog = Catalog::open(&base_path).await?;
        let handle_pool = Arc::new(FileHandlePool::new(config.max_file_handles));
        let page_manager = Arc::new(PageManager::new(
            config.page_size as usize,
            config.cache.page_cache_size,
            config.storage.enable_checksums,
        ));

        let heaps = DashMap::new();
        for entry in catalog.list().await {
            let heap = Arc::new(PagedHeap::new(
                entry.collection_id,
                base_path.join(format!("data_{}.db", entry.collection_id)),
                Arc::clone(&page_manager),
                Arc::clone(&handle_pool),
            ));
            heaps.insert(entry.collection_id, heap);
        }

        let wal = Arc::new(
            WalManager::open(
                base_path.join("wal"),
                config.wal_max_file_size,
                config.enable_wal,
                config.storage.enable_checksums,
            )
            .await?,
        );

        if config.enable_wal {
            let snapshot: std::collections::HashMap<i32, Arc<PagedHeap>> = heaps
                .iter()
                .map(|e| (*e.key(), Arc::clone(e.value())))
                .collect();
            let report = recover(&wal, &snapshot).await?;
            info!(
                "recovery complete: {} redone updates, {} transactions undone",
                report.redone,
                report.undone_transactions.len()
            );
        }

        let db = Self {
            base_path,
            config,
            catalog,
            handle_pool,
            page_manager,
            heaps,
            indices: DashMap::new(),
            wal,
            lock_manager: Arc::new(LockManager::new()),
            mvcc: Arc::new(MvccManager::new()),
            next_txn_id: AtomicI64::new(1),
            logical_clock: AtomicI64::new(1),
            active_txns: DashSet::new(),
            committed_since_checkpoint: AtomicU64::new(0),
            group_commit: AsyncMutex::new(None),
        };

        if db.config.enable_wal {
            let handle = Arc::clone(&db.wal).spawn_group_commit();
            *db.group_commit.lock().await = Some(handle);
        }

        Ok(db)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn heap_for(&self, collection_id: i32) -> Arc<PagedHeap> {
        Arc::clone(
            self.heaps
                .entry(collection_id)
                .or_insert_with(|| {
                    Arc::new(PagedHeap::new(
                        collection_id,
                        self.base_path.join(format!("data_{collection_id}.db")),
                        Arc::clone(&self.page_manager),
                        Arc::clone(&self.handle_pool),
                    ))
                })
                .value(),
        )
    }

    async fn open_index<K: FixedSize, V: FixedSize>(
        &self,
        index_id: i32,
    ) -> StorageResult<BTree<K, V>> {
        BTree::open(
            index_id,
            self.config.b_tree_degree as usize,
            &self.base_path,
            Arc::clone(&self.handle_pool),
            self.config.use_buffered_io,
        )
        .await
    }

    /// Registers a new collection in the catalog and opens its heap and
    /// primary-key index.
    pub async fn create_collection<K: FixedSize>(
        &self,
        name: &str,
        schema_version: i32,
        key_extractor: KeyExtractor<K>,
    ) -> StorageResult<Collection<K>> {
        let entry = self.catalog.create(name, schema_version).await?;
        let heap = self.heap_for(entry.collection_id);
        let index: Arc<BTree<K, Pointer>> = Arc::new(self.open_index(entry.collection_id).await?);
        self.indices
            .insert(entry.collection_id, Arc::clone(&index) as Arc<dyn FlushableIndex>);
        Ok(Collection::new(
            entry.collection_id,
            name,
            heap,
            index,
            key_extractor,
            Arc::clone(&self.wal),
        ))
    }

    /// Reopens a previously created collection by name.
    pub async fn get_collection<K: FixedSize>(
        &self,
        name: &str,
        key_extractor: KeyExtractor<K>,
    ) -> StorageResult<Collection<K>> {
        let entry = self
            .catalog
            .find(name)
            .await
            .ok_or_else(|| StorageError::CollectionNotFound(name.to_string()))?;
        let heap = self.heap_for(entry.collection_id);
        let index: Arc<BTree<K, Pointer>> = Arc::new(self.open_index(entry.collection_id).await?);
        self.indices
            .insert(entry.collection_id, Arc::clone(&index) as Arc<dyn FlushableIndex>);
        Ok(Collection::new(
            entry.collection_id,
            name,
            heap,
            index,
            key_extractor,
            Arc::clone(&self.wal),
        ))
    }

    pub async fn drop_collection(&self, name: &str) -> StorageResult<()> {
        if let Some(entry) = self.catalog.find(name).await {
            self.heaps.remove(&entry.collection_id);
            self.indices.remove(&entry.collection_id);
            self.handle_pool.release(entry.collection_id).await?;
        }
        self.catalog.drop_collection(name).await
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn mvcc(&self) -> &Arc<MvccManager> {
        &self.mvcc
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    /// Writes a Begin record and returns a handle threading WAL/lock/MVCC
    /// bookkeeping through subsequent collection operations.
    pub async fn begin_transaction(&self, isolation: IsolationLevel) -> StorageResult<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let start_ts = self.logical_clock.fetch_add(1, Ordering::SeqCst);
        self.wal.begin(id).await?;
        self.active_txns.insert(id);
        Ok(Transaction {
            id,
            isolation,
            start_ts,
        })
    }

    /// Forces the transaction's Commit record to stable storage,
    /// publishes its MVCC versions, releases its locks, and triggers an
    /// auto-checkpoint once `wal_checkpoint_interval` commits have
    /// accumulated (open question resolved in DESIGN.md).
    pub async fn commit(&self, txn: Transaction) -> StorageResult<()> {
        self.wal.commit(txn.id).await?;
        let commit_ts = self.logical_clock.fetch_add(1, Ordering::SeqCst);
        self.mvcc.commit(txn.id, commit_ts);
        self.lock_manager.release_all(txn.id).await;
        self.active_txns.remove(&txn.id);

        if self.config.wal_auto_checkpoint {
            let count = self.committed_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.config.wal_checkpoint_interval {
                self.committed_since_checkpoint.store(0, Ordering::SeqCst);
                self.create_checkpoint().await?;
            }
        }
        Ok(())
    }

    pub async fn rollback(&self, txn: Transaction) -> StorageResult<()> {
        self.wal.abort(txn.id).await?;
        self.mvcc.abort(txn.id);
        self.lock_manager.release_all(txn.id).await;
        self.active_txns.remove(&txn.id);
        Ok(())
    }

    pub async fn create_checkpoint(&self) -> StorageResult<i64> {
        let active: Vec<i64> = self.active_txns.iter().map(|e| *e).collect();
        self.wal.create_checkpoint(&active).await
    }

    /// Flushes every open collection's heap and index plus the WAL.
    pub async fn flush(&self) -> StorageResult<()> {
        for entry in self.heaps.iter() {
            entry.value().flush().await?;
        }
        for entry in self.indices.iter() {
            entry.value().flush_index().await?;
        }
        self.handle_pool.flush_all().await?;
        self.wal.flush().await
    }

    /// Flushes pending state and releases resources deterministically.
    pub async fn close(self) -> StorageResult<()> {
        self.flush().await?;
        self.wal.stop_group_commit();
        if let Some(handle) = self.group_commit.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}
