//! Write-ahead log manager: LSN assignment, group commit, file rollover,
//! and checkpointing (spec §4.7.1-§4.7.2).
//!
//! Mirrors the rest of this crate's pattern of a `std::fs::File` guarded
//! by a `tokio::sync::Mutex` rather than `tokio::fs`, since every access
//! here is already serialized by the single writer mutex the spec calls
//! for (§5: "WAL writer state: single mutex for LSN assignment and buffer
//! append; the file handle is flushed under the same mutex.").

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::ByteOrder;
use log::{debug, info};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::StorageResult;
use crate::pointer::Pointer;
use crate::wal::record::{CheckpointPayload, LogRecord, RecordBody, UpdatePayload};

const FILE_PREFIX: &str = "wal_";
const FILE_SUFFIX: &str = ".log";

pub fn wal_file_name(number: u32) -> String {
    format!("{FILE_PREFIX}{number:08}{FILE_SUFFIX}")
}

fn parse_wal_file_number(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    digits.parse().ok()
}

/// Lists `wal_NNNNNNNN.log` files in ascending numeric order.
pub fn list_wal_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<(u32, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter_map(|p| parse_wal_file_number(&p).map(|n| (n, p)))
        .collect();
    files.sort_by_key(|(n, _)| *n);
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

/// Reads every complete record frame in a file, stopping at the first
/// short or corrupt frame (a torn tail from a crash mid-write).
///
/// When `checksums` is set, every frame is expected to carry a trailing
/// 4-byte CRC32 of its body (written by [`WalManager::append`] under the
/// same flag); a mismatch is treated the same as a torn tail, since both
/// mean the record cannot be trusted.
pub fn read_records(path: &Path, checksums: bool) -> std::io::Result<Vec<LogRecord>> {
    let bytes = std::fs::read(path)?;
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= bytes.len() {
        let len = byteorder::LittleEndian::read_i32(&bytes[offset..offset + 4]) as usize;
        if offset + 4 + len > bytes.len() {
            debug!("torn WAL tail in {path:?} at offset {offset}");
            break;
        }
        let frame = &bytes[offset + 4..offset + 4 + len];
        let body = if checksums {
            if len < 4 {
                debug!("WAL frame too short for its checksum trailer in {path:?}");
                break;
            }
            let (body, trailer) = frame.split_at(len - 4);
            let stored = byteorder::LittleEndian::read_u32(trailer);
            if crc32fast::hash(body) != stored {
                debug!("WAL checksum mismatch in {path:?} at offset {offset}");
                break;
            }
            body
        } else {
            frame
        };
        match LogRecord::from_body_bytes(body) {
            Ok(record) => out.push(record),
            Err(_) => {
                debug!("corrupt WAL frame in {path:?} at offset {offset}");
                break;
            }
        }
        offset += 4 + len;
    }
    Ok(out)
}

struct WriterState {
    file: std::fs::File,
    file_number: u32,
    file_size: u64,
    next_lsn: i64,
    last_lsn_by_txn: HashMap<i64, i64>,
    pending: Vec<u8>,
}

pub struct WalManager {
    dir: PathBuf,
    max_file_size: u64,
    enabled: bool,
    checksums: bool,
    writer: AsyncMutex<WriterState>,
    stop_group_commit: AtomicBool,
}

impl WalManager {
    /// Scans `dir` for existing log files, resumes numbering and LSN
    /// assignment from the highest one found, and opens the active file
    /// for append. Does not run recovery; callers are expected to run
    /// [`crate::wal::recovery::recover`] before permitting writes.
    pub async fn open(
        dir: impl Into<PathBuf>,
        max_file_size: u64,
        enabled: bool,
        checksums: bool,
    ) -> StorageResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let files = list_wal_files(&dir)?;
        let (file_number, next_lsn) = if let Some(last) = files.last() {
            let number = parse_wal_file_number(last).unwrap_or(0);
            let records = read_records(last, checksums)?;
            let max_lsn = records.iter().map(|r| r.lsn).max().unwrap_or(0);
            (number, max_lsn + 1)
        } else {
            (0, 1)
        };

        let path = dir.join(wal_file_name(file_number));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let file_size = file.metadata()?.len();

        Ok(Self {
            dir,
            max_file_size,
            enabled,
            checksums,
            writer: AsyncMutex::new(WriterState {
                file,
                file_number,
                file_size,
                next_lsn,
                last_lsn_by_txn: HashMap::new(),
                pending: Vec::new(),
            }),
            stop_group_commit: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn checksums_enabled(&self) -> bool {
        self.checksums
    }

    fn now_ticks() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }

    async fn append(&self, txn_id: i64, mut body: RecordBody) -> StorageResult<i64> {
        if !self.enabled {
            return Ok(0);
        }
        let mut state = self.writer.lock().await;
        let lsn = state.next_lsn;
        state.next_lsn += 1;
        let prev_lsn = *state.last_lsn_by_txn.get(&txn_id).unwrap_or(&-1);
        // An Update's own `undo_next_lsn` is its transaction's prior LSN,
        // computed atomically with `prev_lsn` under the same lock.
        if let RecordBody::Update(u) = &mut body {
            u.undo_next_lsn = prev_lsn;
        }
        let is_commit = body.is_commit();
        let record = LogRecord::new(lsn, txn_id, prev_lsn, Self::now_ticks(), body);
        let mut bytes = record.to_bytes();
        if self.checksums {
            let body_len = bytes.len() - 4;
            let crc = crc32fast::hash(&bytes[4..]);
            byteorder::LittleEndian::write_i32(&mut bytes[0..4], (body_len + 4) as i32);
            bytes.extend_from_slice(&crc.to_le_bytes());
        }
        state.pending.extend_from_slice(&bytes);
        state.last_lsn_by_txn.insert(txn_id, lsn);

        if is_commit {
            self.flush_locked(&mut state)?;
        }
        Ok(lsn)
    }

    fn flush_locked(&self, state: &mut WriterState) -> StorageResult<()> {
        if !state.pending.is_empty() {
            state.file.write_all(&state.pending)?;
            state.file.sync_all()?;
            state.file_size += state.pending.len() as u64;
            state.pending.clear();
        }
        if state.file_size > self.max_file_size {
            state.file_number += 1;
            let path = self.dir.join(wal_file_name(state.file_number));
            state.file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .read(true)
                .open(&path)?;
            state.file_size = 0;
            info!("rolled over WAL to {path:?}");
        }
        Ok(())
    }

    /// Flushes the pending buffer to disk (the group-commit tick, and
    /// every Commit, call through here).
    /// Seeds the in-memory `prev_lsn` chain for a transaction so records
    /// emitted during recovery continue the chain from before a restart,
    /// rather than starting a fresh one at `-1`.
    pub async fn seed_last_lsn(&self, txn_id: i64, lsn: i64) {
        self.writer.lock().await.last_lsn_by_txn.insert(txn_id, lsn);
    }

    pub async fn flush(&self) -> StorageResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut state = self.writer.lock().await;
        self.flush_locked(&mut state)
    }

    pub async fn begin(&self, txn_id: i64) -> StorageResult<i64> {
        self.append(txn_id, RecordBody::Begin).await
    }

    pub async fn commit(&self, txn_id: i64) -> StorageResult<i64> {
        self.append(txn_id, RecordBody::Commit).await
    }

    pub async fn abort(&self, txn_id: i64) -> StorageResult<i64> {
        self.append(txn_id, RecordBody::Abort).await
    }

    pub async fn update(
        &self,
        txn_id: i64,
        collection_id: i32,
        pointer: Pointer,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    ) -> StorageResult<i64> {
        self.append(
            txn_id,
            RecordBody::Update(UpdatePayload {
                collection_id,
                pointer,
                undo_next_lsn: -1, // filled in by `append` under the writer lock
                before_image,
                after_image,
            }),
        )
        .await
    }

    /// Emitted only during ARIES undo (§4.7.3 step 3).
    pub async fn compensate(
        &self,
        txn_id: i64,
        collection_id: i32,
        pointer: Pointer,
        undo_next_lsn: i64,
        compensating_image: Vec<u8>,
    ) -> StorageResult<i64> {
        self.append(
            txn_id,
            RecordBody::Clr(crate::wal::record::ClrPayload {
                collection_id,
                pointer,
                undo_next_lsn,
                compensating_image,
            }),
        )
        .await
    }

    /// Writes CheckpointStart, flushes, writes CheckpointEnd, flushes
    /// again; returns the CheckpointStart LSN. `active` is the set of
    /// transactions the caller's transaction manager currently considers
    /// in-flight.
    pub async fn create_checkpoint(&self, active: &[i64]) -> StorageResult<i64> {
        let active_transactions = {
            let state = self.writer.lock().await;
            active
                .iter()
                .map(|txn_id| (*txn_id, *state.last_lsn_by_txn.get(txn_id).unwrap_or(&-1)))
                .collect()
        };
        let lsn = self
            .append(
                -1,
                RecordBody::CheckpointStart(CheckpointPayload { active_transactions }),
            )
            .await?;
        self.flush().await?;
        self.append(-1, RecordBody::CheckpointEnd).await?;
        self.flush().await?;
        Ok(lsn)
    }

    /// Spawns the ~100ms autonomous group-commit timer (§4.7.1). Returns
    /// the join handle so the owner can abort it on close.
    pub fn spawn_group_commit(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(100));
            loop {
                interval.tick().await;
                if self.stop_group_commit.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = self.flush().await {
                    log::warn!("group commit flush failed: {e}");
                }
            }
        })
    }

    pub fn stop_group_commit(&self) {
        self.stop_group_commit.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn begin_commit_round_trips_through_files() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(dir.path(), 1024 * 1024, true, false).await.unwrap();
        wal.begin(1).await.unwrap();
        wal.update(1, 1, Pointer::data(10, 0), b"a".to_vec(), b"b".to_vec())
            .await
            .unwrap();
        wal.commit(1).await.unwrap();

        let files = list_wal_files(wal.dir()).unwrap();
        assert_eq!(files.len(), 1);
        let records = read_records(&files[0], false).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[2].body, RecordBody::Commit));
    }

    #[tokio::test]
    async fn rolls_over_to_new_file_past_max_size() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(dir.path(), 64, true, false).await.unwrap();
        for i in 0..20 {
            wal.begin(i).await.unwrap();
            wal.commit(i).await.unwrap();
        }
        let files = list_wal_files(wal.dir()).unwrap();
        assert!(files.len() > 1);
    }

    #[tokio::test]
    async fn resumes_next_lsn_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let wal = WalManager::open(dir.path(), 1024 * 1024, true, false).await.unwrap();
            wal.begin(1).await.unwrap();
            wal.commit(1).await.unwrap();
        }
        let wal2 = WalManager::open(dir.path(), 1024 * 1024, true, false).await.unwrap();
        let lsn = wal2.begin(2).await.unwrap();
        assert!(lsn > 2);
    }

    #[tokio::test]
    async fn disabled_wal_is_a_no_op() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(dir.path(), 1024 * 1024, false, false).await.unwrap();
        wal.begin(1).await.unwrap();
        wal.commit(1).await.unwrap();
        let files = list_wal_files(wal.dir()).unwrap();
        assert!(files.iter().all(|f| read_records(f, false).unwrap().is_empty()));
    }
}
