//! On-disk B+ tree node layout (spec §3).
//!
//! The spec gives leaves and internal nodes different tail lengths
//! (`d·V + next_leaf` vs `(d+1)·children`); to give the storage manager a
//! single fixed slot size per index it stores both kinds in a node-sized
//! record wide enough for the larger of the two, zero-padding the
//! shorter one. `header(6)` here is the flags byte plus a 4-byte
//! `key_count` plus one reserved/padding byte.

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::FixedSize;
use crate::error::{StorageError, StorageResult};
use crate::pointer::{Pointer, POINTER_WIRE_SIZE};

pub const NODE_HEADER_SIZE: usize = 6;

const FLAG_INTERNAL: u8 = 0b001;
const FLAG_LEAF: u8 = 0b010;
const FLAG_ROOT: u8 = 0b100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Internal,
    Leaf,
}

/// Returns the fixed per-node slot size for an index with the given
/// degree and key/value widths.
pub fn node_wire_size(degree: usize, key_size: usize, value_size: usize) -> usize {
    let keys = degree * key_size;
    let leaf_tail = degree * value_size + 1 + POINTER_WIRE_SIZE; // values + next_leaf presence flag + pointer
    let internal_tail = (degree + 1) * POINTER_WIRE_SIZE;
    NODE_HEADER_SIZE + keys + leaf_tail.max(internal_tail)
}

#[derive(Debug, Clone)]
pub struct Node<K: FixedSize, V: FixedSize> {
    pub kind: NodeKind,
    pub is_root: bool,
    pub keys: Vec<K>,
    /// Leaf only; `values.len() == keys.len()`.
    pub values: Vec<V>,
    /// Internal only; `children.len() == keys.len() + 1`.
    pub children: Vec<Pointer>,
    /// Leaf only.
    pub next_leaf: Option<Pointer>,
}

impl<K: FixedSize, V: FixedSize> Node<K, V> {
    pub fn new_leaf() -> Self {
        Self {
            kind: NodeKind::Leaf,
            is_root: false,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            next_leaf: None,
        }
    }

    pub fn new_internal() -> Self {
        Self {
            kind: NodeKind::Internal,
            is_root: false,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            next_leaf: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_full(&self, degree: usize) -> bool {
        self.keys.len() >= degree
    }

    /// `⌈(d+1)/2⌉`.
    pub fn minimum(degree: usize) -> usize {
        (degree + 1).div_ceil(2)
    }

    pub fn is_under_minimum(&self, degree: usize) -> bool {
        self.keys.len() < Self::minimum(degree)
    }

    pub fn to_bytes(&self, degree: usize, key_size: usize, value_size: usize) -> Vec<u8> {
        let size = node_wire_size(degree, key_size, value_size);
        let mut buf = vec![0u8; size];

        let mut flags = match self.kind {
            NodeKind::Internal => FLAG_INTERNAL,
            NodeKind::Leaf => FLAG_LEAF,
        };
        if self.is_root {
            flags |= FLAG_ROOT;
        }
        buf[0] = flags;
        LittleEndian::write_i32(&mut buf[1..5], self.keys.len() as i32);
        // buf[5] is reserved padding.

        let mut offset = NODE_HEADER_SIZE;
        for key in &self.keys {
            key.encode_fixed(&mut buf[offset..offset + key_size]);
            offset += key_size;
        }
        offset = NODE_HEADER_SIZE + degree * key_size;

        match self.kind {
            NodeKind::Leaf => {
                for value in &self.values {
                    value.encode_fixed(&mut buf[offset..offset + value_size]);
                    offset += value_size;
                }
                offset = NODE_HEADER_SIZE + degree * key_size + degree * value_size;
                match &self.next_leaf {
                    Some(ptr) => {
                        buf[offset] = 1;
                        buf[offset + 1..offset + 1 + POINTER_WIRE_SIZE]
                            .copy_from_slice(&ptr.to_bytes());
                    }
                    None => {
                        buf[offset] = 0;
                    }
                }
            }
            NodeKind::Internal => {
                for child in &self.children {
                    buf[offset..offset + POINTER_WIRE_SIZE].copy_from_slice(&child.to_bytes());
                    offset += POINTER_WIRE_SIZE;
                }
            }
        }
        buf
    }

    pub fn from_bytes(
        bytes: &[u8],
        degree: usize,
        key_size: usize,
        value_size: usize,
    ) -> StorageResult<Self> {
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(StorageError::CorruptWireFormat("node header truncated".into()));
        }
        let flags = bytes[0];
        let key_count = LittleEndian::read_i32(&bytes[1..5]) as usize;
        if key_count > degree {
            return Err(StorageError::CorruptWireFormat(format!(
                "key_count {key_count} exceeds degree {degree}"
            )));
        }
        let is_root = flags & FLAG_ROOT != 0;
        let is_internal = flags & FLAG_INTERNAL != 0;

        let mut offset = NODE_HEADER_SIZE;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            keys.push(K::decode_fixed(&bytes[offset..offset + key_size]));
            offset += key_size;
        }
        offset = NODE_HEADER_SIZE + degree * key_size;

        if is_internal {
            let mut children = Vec::with_capacity(key_count + 1);
            for _ in 0..key_count + 1 {
                children.push(Pointer::from_bytes(&bytes[offset..offset + POINTER_WIRE_SIZE])?);
                offset += POINTER_WIRE_SIZE;
            }
            Ok(Self {
                kind: NodeKind::Internal,
                is_root,
                keys,
                values: Vec::new(),
                children,
                next_leaf: None,
            })
        } else {
            let mut values = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                values.push(V::decode_fixed(&bytes[offset..offset + value_size]));
                offset += value_size;
            }
            offset = NODE_HEADER_SIZE + degree * key_size + degree * value_size;
            let next_leaf = if bytes[offset] == 1 {
                Some(Pointer::from_bytes(
                    &bytes[offset + 1..offset + 1 + POINTER_WIRE_SIZE],
                )?)
            } else {
                None
            };
            Ok(Self {
                kind: NodeKind::Leaf,
                is_root,
                keys,
                values,
                children: Vec::new(),
                next_leaf,
            })
        }
    }
}

/// Per-index 33-byte header: `root_pointer(13) | degree(4) | key_size(4)
/// | value_size(4) | last_auto_key(8)`.
#[derive(Debug, Clone, Copy)]
pub struct IndexHeader {
    pub root_pointer: Pointer,
    pub degree: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub last_auto_key: i64,
}

pub const INDEX_HEADER_SIZE: usize = POINTER_WIRE_SIZE + 4 + 4 + 4 + 8;

impl IndexHeader {
    pub fn new(degree: u32, key_size: u32, value_size: u32) -> Self {
        Self {
            root_pointer: Pointer::EMPTY,
            degree,
            key_size,
            value_size,
            last_auto_key: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut buf = [0u8; INDEX_HEADER_SIZE];
        buf[0..13].copy_from_slice(&self.root_pointer.to_bytes());
        LittleEndian::write_u32(&mut buf[13..17], self.degree);
        LittleEndian::write_u32(&mut buf[17..21], self.key_size);
        LittleEndian::write_u32(&mut buf[21..25], self.value_size);
        LittleEndian::write_i64(&mut buf[25..33], self.last_auto_key);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < INDEX_HEADER_SIZE {
            return Err(StorageError::CorruptWireFormat(
                "index header truncated".into(),
            ));
        }
        Ok(Self {
            root_pointer: Pointer::from_bytes(&bytes[0..13])?,
            degree: LittleEndian::read_u32(&bytes[13..17]),
            key_size: LittleEndian::read_u32(&bytes[17..21]),
            value_size: LittleEndian::read_u32(&bytes[21..25]),
            last_auto_key: LittleEndian::read_i64(&bytes[25..33]),
        })
    }
}
