//! ARIES-style three-phase recovery (spec §4.7.3): analysis, redo, undo.
//! Runs once at open, before any user write is permitted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::info;

use crate::error::StorageResult;
use crate::heap::heap::PagedHeap;
use crate::wal::manager::{list_wal_files, read_records, WalManager};
use crate::wal::record::{LogRecord, RecordBody, UpdatePayload};

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub redone: usize,
    pub undone_transactions: Vec<i64>,
}

struct AnalysisResult {
    committed: HashSet<i64>,
    /// Transactions that reached an Abort record before the crash; redo
    /// and undo must never touch them (their effects are already reversed
    /// by the Abort's own prior undo pass, or they never took effect).
    aborted: HashSet<i64>,
    /// Still-open transactions and the `(lsn, payload)` of every Update
    /// record collected for them, in log order, awaiting undo.
    active: HashMap<i64, Vec<(i64, UpdatePayload)>>,
}

fn analyze(records: impl Iterator<Item = LogRecord>) -> AnalysisResult {
    let mut committed = HashSet::new();
    let mut aborted = HashSet::new();
    let mut active: HashMap<i64, Vec<(i64, UpdatePayload)>> = HashMap::new();

    for record in records {
        match &record.body {
            RecordBody::Begin => {
                active.entry(record.txn_id).or_default();
            }
            RecordBody::Commit => {
                committed.insert(record.txn_id);
                active.remove(&record.txn_id);
            }
            RecordBody::Abort => {
                aborted.insert(record.txn_id);
                active.remove(&record.txn_id);
            }
            RecordBody::Update(u) => {
                active
                    .entry(record.txn_id)
                    .or_default()
                    .push((record.lsn, u.clone()));
            }
            RecordBody::CheckpointStart(_) | RecordBody::CheckpointEnd | RecordBody::Clr(_) => {}
        }
    }

    AnalysisResult {
        committed,
        aborted,
        active,
    }
}

/// Replays every WAL file in `wal.dir()` against the supplied per-collection
/// heaps. `collections` maps `collection_id` to the heap that owns it; a
/// collection referenced by the log but missing from the map is skipped
/// (it no longer exists, e.g. dropped after the crash).
pub async fn recover(
    wal: &WalManager,
    collections: &HashMap<i32, Arc<PagedHeap>>,
) -> StorageResult<RecoveryReport> {
    if !wal.is_enabled() {
        return Ok(RecoveryReport::default());
    }

    let files = list_wal_files(wal.dir())?;
    let mut all_records = Vec::new();
    for file in &files {
        all_records.extend(read_records(file, wal.checksums_enabled())?);
    }

    let analysis = analyze(all_records.iter().cloned());
    info!(
        "recovery analysis: {} committed, {} aborted, {} still-active transactions",
        analysis.committed.len(),
        analysis.aborted.len(),
        analysis.active.len()
    );

    let mut redone = 0;
    for record in &all_records {
        if let RecordBody::Update(u) = &record.body {
            debug_assert!(
                !analysis.aborted.contains(&record.txn_id),
                "redo must never replay an update from an aborted transaction"
            );
            if analysis.committed.contains(&record.txn_id) {
                if let Some(heap) = collections.get(&u.collection_id) {
                    heap.apply_raw(&u.pointer, &u.after_image).await?;
                    redone += 1;
                }
            }
        }
    }

    let mut undone_transactions = Vec::new();
    for (txn_id, updates) in analysis.active {
        debug_assert!(
            !analysis.aborted.contains(&txn_id),
            "a transaction cannot be both aborted and still active after analysis"
        );
        if let Some((last_lsn, _)) = updates.last() {
            wal.seed_last_lsn(txn_id, *last_lsn).await;
        }
        for (lsn, update) in updates.iter().rev() {
            if let Some(heap) = collections.get(&update.collection_id) {
                heap.apply_raw(&update.pointer, &update.before_image).await?;
            }
            // `undo_next_lsn` points at the Update record this CLR
            // compensates for (spec §3).
            wal.compensate(
                txn_id,
                update.collection_id,
                update.pointer,
                *lsn,
                update.before_image.clone(),
            )
            .await?;
        }
        wal.abort(txn_id).await?;
        undone_transactions.push(txn_id);
    }

    // Recovery must leave the heap files themselves consistent, not just
    // the in-memory page cache: a page redone into existence here but
    // never flushed would vanish again on the next crash, and callers that
    // scan by file length (rather than through the index) need the file
    // to actually reflect it.
    for heap in collections.values() {
        heap.flush().await?;
    }

    Ok(RecoveryReport {
        redone,
        undone_transactions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::handle_pool::FileHandlePool;
    use crate::heap::page_manager::PageManager;
    use crate::pointer::Pointer;
    use tempfile::tempdir;

    async fn new_heap(dir: &std::path::Path, collection_id: i32) -> Arc<PagedHeap> {
        let page_manager = Arc::new(PageManager::new(256, 16, false));
        let handle_pool = Arc::new(FileHandlePool::new(8));
        Arc::new(PagedHeap::new(
            collection_id,
            dir.join(format!("data_{collection_id}.db")),
            page_manager,
            handle_pool,
        ))
    }

    #[tokio::test]
    async fn redoes_committed_update_and_undoes_open_transaction() {
        let dir = tempdir().unwrap();
        let heap = new_heap(dir.path(), 1).await;
        let ptr = heap.store(0, 1, 0, b"original8".to_vec()).await.unwrap();
        let original = heap.raw_bytes(&ptr).await.unwrap().unwrap();
        heap.update(&ptr, b"revised11").await.unwrap();
        let revised1 = heap.raw_bytes(&ptr).await.unwrap().unwrap();
        heap.update(&ptr, b"dirty0000").await.unwrap();
        let dirty = heap.raw_bytes(&ptr).await.unwrap().unwrap();
        heap.flush().await.unwrap();

        let wal_dir = dir.path().join("wal");
        let wal = WalManager::open(&wal_dir, 1024 * 1024, true, false).await.unwrap();

        wal.begin(1).await.unwrap();
        wal.update(1, 1, ptr, original.clone(), revised1.clone())
            .await
            .unwrap();
        wal.commit(1).await.unwrap();

        wal.begin(2).await.unwrap();
        wal.update(2, 1, ptr, revised1.clone(), dirty)
            .await
            .unwrap();
        // txn 2 never commits or aborts: simulates a crash mid-transaction.

        let mut collections = HashMap::new();
        collections.insert(1, heap.clone());
        let report = recover(&wal, &collections).await.unwrap();

        assert_eq!(report.redone, 1);
        assert_eq!(report.undone_transactions, vec![2]);

        let obj = heap.select(&ptr).await.unwrap().unwrap();
        assert_eq!(obj.data, b"revised11");
    }
}
