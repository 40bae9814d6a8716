//! One file per index, named deterministically by index id, plus a
//! shared sidecar file of per-index headers (spec §4.6, §6).
//!
//! Index files and heap files share one [`FileHandlePool`], so index ids
//! are mapped into a disjoint handle-pool key range
//! (`i32::MIN + index_id`) to avoid colliding with collection ids, which
//! the catalog assigns starting from zero.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::btree::node::{node_wire_size, IndexHeader, Node, INDEX_HEADER_SIZE};
use crate::codec::FixedSize;
use crate::error::{StorageError, StorageResult};
use crate::heap::handle_pool::FileHandlePool;
use crate::pointer::Pointer;

fn handle_id_for_index(index_id: i32) -> i32 {
    i32::MIN + index_id
}

struct MutableState {
    free_list: Vec<i64>,
    next_position: i64,
    header: IndexHeader,
}

pub struct IndexStorageManager<K: FixedSize, V: FixedSize> {
    index_id: i32,
    degree: usize,
    key_size: usize,
    value_size: usize,
    node_size: usize,
    nodes_path: PathBuf,
    headers_path: PathBuf,
    handle_pool: Arc<FileHandlePool>,
    state: AsyncMutex<MutableState>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: FixedSize, V: FixedSize> IndexStorageManager<K, V> {
    pub async fn open(
        index_id: i32,
        degree: usize,
        base_path: impl AsRef<Path>,
        handle_pool: Arc<FileHandlePool>,
    ) -> StorageResult<Self> {
        let base_path = base_path.as_ref();
        let nodes_path = base_path.join(format!("index_{index_id}.dat"));
        let headers_path = base_path.join("index_headers.db");

        let key_size = K::WIDTH;
        let value_size = V::WIDTH;
        let node_size = node_wire_size(degree, key_size, value_size);

        let header = Self::read_header_from(&headers_path, index_id, degree, key_size, value_size)
            .await?;

        let nodes_len = tokio::fs::metadata(&nodes_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let next_position = nodes_len as i64;

        Ok(Self {
            index_id,
            degree,
            key_size,
            value_size,
            node_size,
            nodes_path,
            headers_path,
            handle_pool,
            state: AsyncMutex::new(MutableState {
                free_list: Vec::new(),
                next_position,
                header,
            }),
            _marker: PhantomData,
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    async fn read_header_from(
        headers_path: &Path,
        index_id: i32,
        degree: usize,
        key_size: usize,
        value_size: usize,
    ) -> StorageResult<IndexHeader> {
        let offset = index_id as u64 * INDEX_HEADER_SIZE as u64;
        let file_len = tokio::fs::metadata(headers_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if offset + INDEX_HEADER_SIZE as u64 > file_len {
            return Ok(IndexHeader::new(degree as u32, key_size as u32, value_size as u32));
        }
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .open(headers_path)
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = [0u8; INDEX_HEADER_SIZE];
        file.read_exact(&mut buf).await?;
        IndexHeader::from_bytes(&buf)
    }

    pub async fn header(&self) -> IndexHeader {
        self.state.lock().await.header
    }

    pub async fn set_root_pointer(&self, root: Pointer) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.header.root_pointer = root;
        self.persist_header(&state.header).await
    }

    pub async fn next_auto_key(&self) -> StorageResult<i64> {
        let mut state = self.state.lock().await;
        state.header.last_auto_key += 1;
        let key = state.header.last_auto_key;
        self.persist_header(&state.header).await?;
        Ok(key)
    }

    async fn persist_header(&self, header: &IndexHeader) -> StorageResult<()> {
        let offset = self.index_id as u64 * INDEX_HEADER_SIZE as u64;
        tokio::fs::create_dir_all(
            self.headers_path
                .parent()
                .unwrap_or_else(|| Path::new(".")),
        )
        .await
        .ok();
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.headers_path)
            .await?;
        let len = file.metadata().await?.len();
        if len < offset {
            file.set_len(offset).await?;
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(&header.to_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn file(&self) -> StorageResult<Arc<tokio::sync::Mutex<std::fs::File>>> {
        self.handle_pool
            .get(handle_id_for_index(self.index_id), &self.nodes_path)
            .await
    }

    pub async fn read_node(&self, pointer: &Pointer) -> StorageResult<Node<K, V>> {
        let handle = self.file().await?;
        let mut file = handle.lock().await;
        use std::io::{Read, Seek};
        file.seek(std::io::SeekFrom::Start(pointer.position as u64))?;
        let mut buf = vec![0u8; self.node_size];
        file.read_exact(&mut buf)?;
        Node::from_bytes(&buf, self.degree, self.key_size, self.value_size)
    }

    /// Reuses a free-listed position if any; otherwise appends at the
    /// file's current high-water mark.
    pub async fn write_new_node(&self, node: &Node<K, V>) -> StorageResult<Pointer> {
        let position = {
            let mut state = self.state.lock().await;
            if let Some(pos) = state.free_list.pop() {
                pos
            } else {
                let pos = state.next_position;
                state.next_position += self.node_size as i64;
                pos
            }
        };
        self.write_at(position, node).await?;
        Ok(Pointer::node(position, 0))
    }

    pub async fn update_node(&self, pointer: &Pointer, node: &Node<K, V>) -> StorageResult<()> {
        self.write_at(pointer.position, node).await
    }

    pub async fn free_node(&self, pointer: &Pointer) {
        let mut state = self.state.lock().await;
        state.free_list.push(pointer.position);
    }

    async fn write_at(&self, position: i64, node: &Node<K, V>) -> StorageResult<()> {
        let bytes = node.to_bytes(self.degree, self.key_size, self.value_size);
        let handle = self.file().await?;
        let mut file = handle.lock().await;
        use std::io::{Seek, Write as _};
        file.seek(std::io::SeekFrom::Start(position as u64))?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    }

    pub async fn flush(&self) -> StorageResult<()> {
        let handle = self.file().await?;
        let file = handle.lock().await;
        file.sync_all()?;
        Ok(())
    }
}
