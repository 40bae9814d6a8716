//! The 13-byte on-disk address of a record or tree node (spec §3, §6).

use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;

use crate::error::{StorageError, StorageResult};

pub const POINTER_WIRE_SIZE: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    Empty,
    Data,
    Node,
}

impl PointerKind {
    fn tag(self) -> u8 {
        match self {
            PointerKind::Empty => 0x00,
            PointerKind::Data => 0x01,
            PointerKind::Node => 0x02,
        }
    }

    fn from_tag(tag: u8) -> StorageResult<Self> {
        match tag {
            0x00 => Ok(PointerKind::Empty),
            0x01 => Ok(PointerKind::Data),
            0x02 => Ok(PointerKind::Node),
            other => Err(StorageError::CorruptWireFormat(format!(
                "invalid pointer type byte: {other:#04x}"
            ))),
        }
    }
}

/// `{ type: u8, position: i64, chunk: i32 }`, ordered lexicographically by
/// `(chunk, position)`. A "temporary" pointer used by the buffered node
/// session has `position == -1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pointer {
    pub kind: PointerKind,
    pub position: i64,
    pub chunk: i32,
}

impl Pointer {
    pub const EMPTY: Pointer = Pointer {
        kind: PointerKind::Empty,
        position: 0,
        chunk: 0,
    };

    pub fn data(position: i64, chunk: i32) -> Self {
        Self {
            kind: PointerKind::Data,
            position,
            chunk,
        }
    }

    pub fn node(position: i64, chunk: i32) -> Self {
        Self {
            kind: PointerKind::Node,
            position,
            chunk,
        }
    }

    /// A node pointer not yet flushed to disk; assigned by the buffered
    /// node session so the tree algorithm has something to reference.
    pub fn temporary_node() -> Self {
        Self {
            kind: PointerKind::Node,
            position: -1,
            chunk: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, PointerKind::Empty)
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self.kind, PointerKind::Node) && self.position == -1
    }

    pub fn to_bytes(&self) -> [u8; POINTER_WIRE_SIZE] {
        let mut buf = [0u8; POINTER_WIRE_SIZE];
        buf[0] = self.kind.tag();
        LittleEndian::write_i64(&mut buf[1..9], self.position);
        LittleEndian::write_i32(&mut buf[9..13], self.chunk);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < POINTER_WIRE_SIZE {
            return Err(StorageError::CorruptWireFormat(
                "pointer requires 13 bytes".into(),
            ));
        }
        let kind = PointerKind::from_tag(bytes[0])?;
        let position = LittleEndian::read_i64(&bytes[1..9]);
        let chunk = LittleEndian::read_i32(&bytes[9..13]);
        Ok(Self {
            kind,
            position,
            chunk,
        })
    }
}

impl PartialOrd for Pointer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pointer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.chunk, self.position).cmp(&(other.chunk, other.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cases = [
            Pointer::EMPTY,
            Pointer::data(123, 0),
            Pointer::node(-1, 0),
            Pointer::data(i64::MAX, i32::MAX),
        ];
        for p in cases {
            let bytes = p.to_bytes();
            assert_eq!(bytes.len(), POINTER_WIRE_SIZE);
            let back = Pointer::from_bytes(&bytes).unwrap();
            assert_eq!(p, back);
        }
    }

    #[test]
    fn ordering_is_chunk_then_position() {
        let a = Pointer::data(5, 0);
        let b = Pointer::data(1, 1);
        assert!(a < b);
    }

    #[test]
    fn rejects_invalid_type_byte() {
        let mut bytes = Pointer::data(1, 1).to_bytes();
        bytes[0] = 0x7f;
        assert!(Pointer::from_bytes(&bytes).is_err());
    }
}
