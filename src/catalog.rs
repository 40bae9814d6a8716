//! Collection catalog persisted as `db_header.json` (spec §6). Rewritten
//! on every schema change (create/drop collection).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StorageResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub collection_id: i32,
    pub name: String,
    pub schema_version: i32,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CatalogFile {
    collections: Vec<CollectionEntry>,
    next_collection_id: i32,
}

pub struct Catalog {
    path: PathBuf,
    state: RwLock<CatalogFile>,
    next_id: AtomicI32,
}

impl Catalog {
    pub async fn open(base_path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = base_path.as_ref().join("db_header.json");
        let file = if path.exists() {
            let text = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&text)?
        } else {
            CatalogFile::default()
        };
        let next_id = file.next_collection_id;
        Ok(Self {
            path,
            state: RwLock::new(file),
            next_id: AtomicI32::new(next_id),
        })
    }

    async fn persist(&self, file: &CatalogFile) -> StorageResult<()> {
        let text = serde_json::to_string_pretty(file)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, text).await?;
        Ok(())
    }

    pub async fn list(&self) -> Vec<CollectionEntry> {
        self.state.read().await.collections.clone()
    }

    pub async fn find(&self, name: &str) -> Option<CollectionEntry> {
        self.state
            .read()
            .await
            .collections
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub async fn create(&self, name: &str, schema_version: i32) -> StorageResult<CollectionEntry> {
        let mut file = self.state.write().await;
        if file.collections.iter().any(|c| c.name == name) {
            return Err(crate::error::StorageError::CollectionAlreadyExists(
                name.to_string(),
            ));
        }
        let collection_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = CollectionEntry {
            collection_id,
            name: name.to_string(),
            schema_version,
            created_at: now_seconds(),
        };
        file.collections.push(entry.clone());
        file.next_collection_id = self.next_id.load(Ordering::SeqCst);
        self.persist(&file).await?;
        Ok(entry)
    }

    pub async fn drop_collection(&self, name: &str) -> StorageResult<()> {
        let mut file = self.state.write().await;
        let before = file.collections.len();
        file.collections.retain(|c| c.name != name);
        if file.collections.len() == before {
            return Err(crate::error::StorageError::CollectionNotFound(
                name.to_string(),
            ));
        }
        self.persist(&file).await
    }
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
