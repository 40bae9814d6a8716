//! WAL record format and wire framing (spec §3, §4.7, §6).
//!
//! `length (i32) | type (u8) | lsn (i64) | txn_id (i64) | prev_lsn (i64) |
//! timestamp_ticks (i64) | …payload`. `length` covers everything after
//! itself. Update's payload: `collection_id (i32) | pointer (13) |
//! undo_next_lsn (i64) | before_len (i32) | before[] | after_len (i32) |
//! after[]`.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{StorageError, StorageResult};
use crate::pointer::{Pointer, POINTER_WIRE_SIZE};

const TYPE_BEGIN: u8 = 0;
const TYPE_COMMIT: u8 = 1;
const TYPE_ABORT: u8 = 2;
const TYPE_UPDATE: u8 = 3;
const TYPE_CHECKPOINT_START: u8 = 4;
const TYPE_CHECKPOINT_END: u8 = 5;
const TYPE_CLR: u8 = 6;

const BASE_FIELDS_SIZE: usize = 1 + 8 + 8 + 8 + 8; // type + lsn + txn_id + prev_lsn + timestamp

#[derive(Debug, Clone)]
pub struct UpdatePayload {
    pub collection_id: i32,
    pub pointer: Pointer,
    pub undo_next_lsn: i64,
    pub before_image: Vec<u8>,
    pub after_image: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CheckpointPayload {
    /// `(txn_id, last_lsn)` for every transaction active when the
    /// checkpoint was taken.
    pub active_transactions: Vec<(i64, i64)>,
}

#[derive(Debug, Clone)]
pub struct ClrPayload {
    pub collection_id: i32,
    pub pointer: Pointer,
    /// The LSN of the Update record this CLR compensates for.
    pub undo_next_lsn: i64,
    /// The before-image reapplied to undo the original update.
    pub compensating_image: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum RecordBody {
    Begin,
    Commit,
    Abort,
    Update(UpdatePayload),
    CheckpointStart(CheckpointPayload),
    CheckpointEnd,
    Clr(ClrPayload),
}

impl RecordBody {
    fn type_tag(&self) -> u8 {
        match self {
            RecordBody::Begin => TYPE_BEGIN,
            RecordBody::Commit => TYPE_COMMIT,
            RecordBody::Abort => TYPE_ABORT,
            RecordBody::Update(_) => TYPE_UPDATE,
            RecordBody::CheckpointStart(_) => TYPE_CHECKPOINT_START,
            RecordBody::CheckpointEnd => TYPE_CHECKPOINT_END,
            RecordBody::Clr(_) => TYPE_CLR,
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, RecordBody::Commit)
    }
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: i64,
    pub txn_id: i64,
    pub prev_lsn: i64,
    pub timestamp: i64,
    pub body: RecordBody,
}

impl LogRecord {
    pub fn new(lsn: i64, txn_id: i64, prev_lsn: i64, timestamp: i64, body: RecordBody) -> Self {
        Self {
            lsn,
            txn_id,
            prev_lsn,
            timestamp,
            body,
        }
    }

    /// Serializes `length | type | lsn | txn_id | prev_lsn | timestamp |
    /// payload` as a single self-delimiting frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match &self.body {
            RecordBody::Begin | RecordBody::Commit | RecordBody::Abort | RecordBody::CheckpointEnd => {}
            RecordBody::Update(u) => {
                write_i32(&mut payload, u.collection_id);
                payload.extend_from_slice(&u.pointer.to_bytes());
                write_i64(&mut payload, u.undo_next_lsn);
                write_i32(&mut payload, u.before_image.len() as i32);
                payload.extend_from_slice(&u.before_image);
                write_i32(&mut payload, u.after_image.len() as i32);
                payload.extend_from_slice(&u.after_image);
            }
            RecordBody::CheckpointStart(c) => {
                write_i32(&mut payload, c.active_transactions.len() as i32);
                for (txn_id, last_lsn) in &c.active_transactions {
                    write_i64(&mut payload, *txn_id);
                    write_i64(&mut payload, *last_lsn);
                }
            }
            RecordBody::Clr(c) => {
                write_i32(&mut payload, c.collection_id);
                payload.extend_from_slice(&c.pointer.to_bytes());
                write_i64(&mut payload, c.undo_next_lsn);
                write_i32(&mut payload, c.compensating_image.len() as i32);
                payload.extend_from_slice(&c.compensating_image);
            }
        }

        let body_len = BASE_FIELDS_SIZE + payload.len();
        let mut buf = Vec::with_capacity(4 + body_len);
        write_i32(&mut buf, body_len as i32);
        buf.push(self.body.type_tag());
        write_i64(&mut buf, self.lsn);
        write_i64(&mut buf, self.txn_id);
        write_i64(&mut buf, self.prev_lsn);
        write_i64(&mut buf, self.timestamp);
        buf.extend_from_slice(&payload);
        buf
    }

    /// Decodes one frame's body (everything after the `length` prefix,
    /// which the caller has already consumed to know how much to read).
    pub fn from_body_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < BASE_FIELDS_SIZE {
            return Err(StorageError::CorruptWireFormat(
                "WAL record shorter than base fields".into(),
            ));
        }
        let type_tag = bytes[0];
        let lsn = LittleEndian::read_i64(&bytes[1..9]);
        let txn_id = LittleEndian::read_i64(&bytes[9..17]);
        let prev_lsn = LittleEndian::read_i64(&bytes[17..25]);
        let timestamp = LittleEndian::read_i64(&bytes[25..33]);
        let payload = &bytes[BASE_FIELDS_SIZE..];

        let body = match type_tag {
            TYPE_BEGIN => RecordBody::Begin,
            TYPE_COMMIT => RecordBody::Commit,
            TYPE_ABORT => RecordBody::Abort,
            TYPE_CHECKPOINT_END => RecordBody::CheckpointEnd,
            TYPE_UPDATE => {
                let mut offset = 0;
                let collection_id = read_i32(payload, &mut offset)?;
                let pointer = Pointer::from_bytes(slice(payload, offset, POINTER_WIRE_SIZE)?)?;
                offset += POINTER_WIRE_SIZE;
                let undo_next_lsn = read_i64(payload, &mut offset)?;
                let before_len = read_i32(payload, &mut offset)? as usize;
                let before_image = slice(payload, offset, before_len)?.to_vec();
                offset += before_len;
                let after_len = read_i32(payload, &mut offset)? as usize;
                let after_image = slice(payload, offset, after_len)?.to_vec();
                RecordBody::Update(UpdatePayload {
                    collection_id,
                    pointer,
                    undo_next_lsn,
                    before_image,
                    after_image,
                })
            }
            TYPE_CHECKPOINT_START => {
                let mut offset = 0;
                let count = read_i32(payload, &mut offset)? as usize;
                let mut active_transactions = Vec::with_capacity(count);
                for _ in 0..count {
                    let txn_id = read_i64(payload, &mut offset)?;
                    let last_lsn = read_i64(payload, &mut offset)?;
                    active_transactions.push((txn_id, last_lsn));
                }
                RecordBody::CheckpointStart(CheckpointPayload { active_transactions })
            }
            TYPE_CLR => {
                let mut offset = 0;
                let collection_id = read_i32(payload, &mut offset)?;
                let pointer = Pointer::from_bytes(slice(payload, offset, POINTER_WIRE_SIZE)?)?;
                offset += POINTER_WIRE_SIZE;
                let undo_next_lsn = read_i64(payload, &mut offset)?;
                let image_len = read_i32(payload, &mut offset)? as usize;
                let compensating_image = slice(payload, offset, image_len)?.to_vec();
                RecordBody::Clr(ClrPayload {
                    collection_id,
                    pointer,
                    undo_next_lsn,
                    compensating_image,
                })
            }
            other => {
                return Err(StorageError::CorruptWireFormat(format!(
                    "unknown WAL record type tag {other}"
                )))
            }
        };

        Ok(LogRecord {
            lsn,
            txn_id,
            prev_lsn,
            timestamp,
            body,
        })
    }
}

fn write_i32(buf: &mut Vec<u8>, v: i32) {
    let mut tmp = [0u8; 4];
    LittleEndian::write_i32(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn write_i64(buf: &mut Vec<u8>, v: i64) {
    let mut tmp = [0u8; 8];
    LittleEndian::write_i64(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn slice(bytes: &[u8], offset: usize, len: usize) -> StorageResult<&[u8]> {
    bytes
        .get(offset..offset + len)
        .ok_or_else(|| StorageError::CorruptWireFormat("WAL payload truncated".into()))
}

fn read_i32(bytes: &[u8], offset: &mut usize) -> StorageResult<i32> {
    let v = LittleEndian::read_i32(slice(bytes, *offset, 4)?);
    *offset += 4;
    Ok(v)
}

fn read_i64(bytes: &[u8], offset: &mut usize) -> StorageResult<i64> {
    let v = LittleEndian::read_i64(slice(bytes, *offset, 8)?);
    *offset += 8;
    Ok(v)
}
