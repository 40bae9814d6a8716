//! Bounds the number of simultaneously open OS handles and serializes
//! access to each file (spec §4.1).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::{Mutex, Semaphore};

use crate::error::{StorageError, StorageResult};

struct Entry {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

/// One global counting semaphore bounds total open handles; one mutex per
/// file path prevents two callers from racing to create the same handle.
pub struct FileHandlePool {
    max_file_handles: usize,
    semaphore: Arc<Semaphore>,
    handles: DashMap<i32, Entry>,
    creation_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl FileHandlePool {
    pub fn new(max_file_handles: usize) -> Self {
        Self {
            max_file_handles,
            semaphore: Arc::new(Semaphore::new(max_file_handles)),
            handles: DashMap::new(),
            creation_locks: DashMap::new(),
        }
    }

    /// Returns a live handle for `collection_id`, opening (and creating,
    /// if missing) the file at `path` if not already pooled. A corrupted
    /// cached handle is evicted and replaced transparently.
    pub async fn get(
        &self,
        collection_id: i32,
        path: impl AsRef<Path>,
    ) -> StorageResult<Arc<Mutex<File>>> {
        let path = path.as_ref().to_path_buf();

        if let Some(entry) = self.handles.get(&collection_id) {
            if entry.path == path {
                return Ok(Arc::clone(&entry.file));
            }
            // Path binding changed for this id (rare): fall through and
            // replace the cached handle below.
        }

        let lock = self
            .creation_locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check: another task may have created it while we waited.
        if let Some(entry) = self.handles.get(&collection_id) {
            if entry.path == path {
                return Ok(Arc::clone(&entry.file));
            }
        }

        let permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            StorageError::HandlePoolExhausted {
                max: self.max_file_handles,
            }
        })?;
        // The permit is deliberately leaked into the pooled lifetime of the
        // handle: it is reclaimed when `release` drops the entry.
        std::mem::forget(permit);

        debug!("opening file handle: collection_id={collection_id} path={path:?}");
        let path_for_open = path.clone();
        let file = tokio::task::spawn_blocking(move || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path_for_open)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;

        let entry = Entry {
            path,
            file: Arc::new(Mutex::new(file)),
        };
        let handle = Arc::clone(&entry.file);
        self.handles.insert(collection_id, entry);
        Ok(handle)
    }

    /// Flushes and closes every handle bound to `collection_id`.
    pub async fn release(&self, collection_id: i32) -> StorageResult<()> {
        if let Some((_, entry)) = self.handles.remove(&collection_id) {
            let mut guard = entry.file.lock().await;
            guard.flush()?;
            self.semaphore.add_permits(1);
        }
        Ok(())
    }

    /// Fsyncs every currently pooled handle.
    pub async fn flush_all(&self) -> StorageResult<()> {
        let files: Vec<Arc<Mutex<File>>> =
            self.handles.iter().map(|e| Arc::clone(&e.file)).collect();
        for file in files {
            let guard = file.lock().await;
            if let Err(e) = guard.sync_all() {
                warn!("flush_all: fsync failed: {e}");
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub fn pooled_count(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for FileHandlePool {
    fn drop(&mut self) {
        // Permits forgotten in `get` are intentionally not restored here:
        // the semaphore is dropped along with the pool.
    }
}
