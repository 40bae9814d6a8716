//! Error kinds per spec §7. Each kind carries enough context to reconstruct
//! the failure; only the WAL group-commit path retries automatically, so
//! every other variant here is meant to be surfaced straight to the caller.

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("offset {offset} out of bounds in page {page_number} (used_space={used_space})")]
    OutOfBounds {
        page_number: i32,
        offset: i32,
        used_space: i32,
    },

    #[error("lock acquisition timed out on resource {resource} for txn {txn_id}")]
    LockTimeout { resource: String, txn_id: i64 },

    #[error("transaction {txn_id} chosen as deadlock victim")]
    DeadlockVictim { txn_id: i64 },

    #[error("schema version mismatch: record has {found}, reader expects {expected}")]
    SchemaVersionMismatch { found: i32, expected: i32 },

    #[error("data_size would grow on update: current={current}, requested={requested}")]
    RecordTooLarge { current: i32, requested: i32 },

    #[error("capacity exceeded while merging nodes: combined key_count {combined} > degree {degree}")]
    MergeCapacityExceeded { combined: usize, degree: usize },

    #[error("torn WAL tail in {file}: stopped at byte offset {offset}")]
    TornWalTail { file: String, offset: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),

    #[error("index not found: {0}")]
    IndexNotFound(i32),

    #[error("corrupt wire format: {0}")]
    CorruptWireFormat(String),

    #[error("file handle pool exhausted (max_file_handles={max})")]
    HandlePoolExhausted { max: usize },
}

impl StorageError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        StorageError::InvalidArgument(msg.into())
    }
}
