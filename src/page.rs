//! Fixed-size pages holding an append-only run of versioned [`DBObject`]
//! slots (spec §3, §4.2).
//!
//! On the wire, a slot is exactly `flags(1) | scheme_id(4) |
//! collection_id(4) | version(4) | data_size(4) | data[data_size]` — the
//! literal layout pinned by §6, with no extra hidden field. `data_size`
//! never grows on update, per the data model invariant; a shrink instead
//! carves the freed tail off as its own slot, flagged as a *filler*
//! (bit 1 of `flags`, a second internal use of the same one-byte field
//! the format already reserves) rather than a live record. This keeps
//! every later slot's byte offset stable across an update without ever
//! compacting the page or smuggling a length prefix into the payload.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{StorageError, StorageResult};

pub const PAGE_HEADER_SIZE: usize = 8;
pub const OBJECT_META_SIZE: usize = 17;
/// Trailing bytes reserved at the end of every page for its CRC32, whether
/// or not `storage.enable_checksums` is on, so the object region's layout
/// never shifts when the option is toggled.
pub const PAGE_TRAILER_SIZE: usize = 4;

const ALIVE_FLAG: u8 = 0b0000_0001;
const FILLER_FLAG: u8 = 0b0000_0010;

/// A record slot inside a page: 17-byte meta prefix followed by
/// `data.len()` live bytes (`data_size` in the wire format).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DBObject {
    pub alive: bool,
    /// Marks a slot carved off by [`Page::update_at`] to cover the bytes
    /// a shrink freed. Never alive; never returned by `read_at`/`scan`.
    pub is_filler: bool,
    pub scheme_id: i32,
    pub collection_id: i32,
    pub version: i32,
    pub data: Vec<u8>,
}

impl DBObject {
    pub fn new(scheme_id: i32, collection_id: i32, version: i32, data: Vec<u8>) -> Self {
        Self {
            alive: true,
            is_filler: false,
            scheme_id,
            collection_id,
            version,
            data,
        }
    }

    /// A dead slot of exactly `size` payload bytes, used to fill the gap a
    /// shrinking update leaves so later slots keep their offsets.
    fn filler(size: usize) -> Self {
        Self {
            alive: false,
            is_filler: true,
            scheme_id: 0,
            collection_id: 0,
            version: 0,
            data: vec![0u8; size],
        }
    }

    pub fn wire_len(&self) -> usize {
        OBJECT_META_SIZE + self.data.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        let mut flags = if self.alive { ALIVE_FLAG } else { 0 };
        if self.is_filler {
            flags |= FILLER_FLAG;
        }
        buf.push(flags);
        let mut meta = [0u8; 16];
        LittleEndian::write_i32(&mut meta[0..4], self.scheme_id);
        LittleEndian::write_i32(&mut meta[4..8], self.collection_id);
        LittleEndian::write_i32(&mut meta[8..12], self.version);
        LittleEndian::write_i32(&mut meta[12..16], self.data.len() as i32);
        buf.extend_from_slice(&meta);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parses one object starting at `bytes[0]`. Returns the object and the
    /// number of bytes it occupies on the wire.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<(Self, usize)> {
        if bytes.len() < OBJECT_META_SIZE {
            return Err(StorageError::CorruptWireFormat(
                "DBObject meta prefix truncated".into(),
            ));
        }
        let flags = bytes[0];
        let scheme_id = LittleEndian::read_i32(&bytes[1..5]);
        let collection_id = LittleEndian::read_i32(&bytes[5..9]);
        let version = LittleEndian::read_i32(&bytes[9..13]);
        let data_size = LittleEndian::read_i32(&bytes[13..17]);
        if data_size < 0 {
            return Err(StorageError::CorruptWireFormat(format!(
                "invalid data_size: {data_size}"
            )));
        }
        let data_size = data_size as usize;
        let end = OBJECT_META_SIZE + data_size;
        if bytes.len() < end {
            return Err(StorageError::CorruptWireFormat(
                "DBObject payload truncated".into(),
            ));
        }
        let data = bytes[OBJECT_META_SIZE..end].to_vec();
        Ok((
            Self {
                alive: flags & ALIVE_FLAG != 0,
                is_filler: flags & FILLER_FLAG != 0,
                scheme_id,
                collection_id,
                version,
                data,
            },
            end,
        ))
    }
}

/// A fixed-size page: an 8-byte header (`page_number`, `used_space`)
/// followed by an append-only region of [`DBObject`]s.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_number: i32,
    page_size: usize,
    buf: Vec<u8>,
    pub dirty: bool,
}

impl Page {
    /// A freshly zeroed page (what `load_page` returns for an
    /// unflushed-but-allocated position read past end-of-file).
    pub fn zeroed(page_number: i32, page_size: usize) -> Self {
        let mut page = Self {
            page_number,
            page_size,
            buf: vec![0u8; page_size],
            dirty: false,
        };
        page.write_header();
        page
    }

    pub fn from_bytes(bytes: Vec<u8>) -> StorageResult<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(StorageError::CorruptWireFormat(
                "page shorter than header".into(),
            ));
        }
        let page_number = LittleEndian::read_i32(&bytes[0..4]);
        let page_size = bytes.len();
        Ok(Self {
            page_number,
            page_size,
            buf: bytes,
            dirty: false,
        })
    }

    fn write_header(&mut self) {
        LittleEndian::write_i32(&mut self.buf[0..4], self.page_number);
        let used = self.used_space() as i32;
        LittleEndian::write_i32(&mut self.buf[4..8], used);
    }

    pub fn used_space(&self) -> usize {
        LittleEndian::read_i32(&self.buf[4..8]).max(PAGE_HEADER_SIZE as i32) as usize
    }

    fn set_used_space(&mut self, used: usize) {
        LittleEndian::write_i32(&mut self.buf[4..8], used as i32);
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn free_space(&self) -> usize {
        self.page_size - PAGE_TRAILER_SIZE - self.used_space()
    }

    pub fn to_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// CRC32 over the header and object region, excluding the trailer
    /// itself.
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.buf[..self.page_size - PAGE_TRAILER_SIZE])
    }

    /// Stamps the trailer with this page's current checksum. Called by the
    /// page manager before a page is written to disk when
    /// `storage.enable_checksums` is on.
    pub fn write_checksum(&mut self) {
        let crc = self.compute_checksum();
        let end = self.page_size;
        LittleEndian::write_u32(&mut self.buf[end - PAGE_TRAILER_SIZE..end], crc);
    }

    /// Whether the trailer matches the page's current contents.
    pub fn verify_checksum(&self) -> bool {
        let end = self.page_size;
        let stored = LittleEndian::read_u32(&self.buf[end - PAGE_TRAILER_SIZE..end]);
        stored == self.compute_checksum()
    }

    /// Appends `object` if it fits; returns the byte offset (from page
    /// start) it was written at.
    pub fn append(&mut self, object: &DBObject) -> Option<usize> {
        let len = object.wire_len();
        if len > self.free_space() {
            return None;
        }
        let offset = self.used_space();
        let bytes = object.to_bytes();
        self.buf[offset..offset + len].copy_from_slice(&bytes);
        self.set_used_space(offset + len);
        self.dirty = true;
        Some(offset)
    }

    /// Reads the object at `offset`; `None` if the offset is invalid or the
    /// object there is not alive.
    pub fn read_at(&self, offset: usize) -> StorageResult<Option<DBObject>> {
        if offset < PAGE_HEADER_SIZE || offset >= self.used_space() {
            return Ok(None);
        }
        match DBObject::from_bytes(&self.buf[offset..]) {
            Ok((obj, _)) => Ok(if obj.alive { Some(obj) } else { None }),
            Err(_) => Ok(None),
        }
    }

    /// Rewrites the object at `offset` in place. Fails if the new payload
    /// is larger than the slot's current `data_size`, or if it shrinks the
    /// slot by fewer bytes than a filler object needs to occupy the gap
    /// (it must shrink by 0, or by at least [`OBJECT_META_SIZE`] bytes).
    pub fn update_at(&mut self, offset: usize, new_data: &[u8]) -> StorageResult<()> {
        if offset < PAGE_HEADER_SIZE || offset >= self.used_space() {
            return Err(StorageError::OutOfBounds {
                page_number: self.page_number,
                offset: offset as i32,
                used_space: self.used_space() as i32,
            });
        }
        let (obj, old_len) = DBObject::from_bytes(&self.buf[offset..])?;
        if new_data.len() > obj.data.len() {
            return Err(StorageError::RecordTooLarge {
                current: obj.data.len() as i32,
                requested: new_data.len() as i32,
            });
        }
        let freed = obj.data.len() - new_data.len();
        if freed > 0 && freed < OBJECT_META_SIZE {
            return Err(StorageError::RecordTooLarge {
                current: obj.data.len() as i32,
                requested: new_data.len() as i32,
            });
        }

        let mut rewritten = DBObject {
            alive: obj.alive,
            is_filler: false,
            scheme_id: obj.scheme_id,
            collection_id: obj.collection_id,
            version: obj.version,
            data: new_data.to_vec(),
        }
        .to_bytes();
        if freed > 0 {
            rewritten.extend_from_slice(&DBObject::filler(freed - OBJECT_META_SIZE).to_bytes());
        }
        debug_assert_eq!(rewritten.len(), old_len);
        self.buf[offset..offset + old_len].copy_from_slice(&rewritten);
        self.dirty = true;
        Ok(())
    }

    /// Returns the exact on-disk bytes of the slot at `offset`, meta and
    /// alive flag included. If a shrinking update previously carved a
    /// filler out of this slot's tail, the filler's bytes are included too
    /// so the result always spans this slot's full, offset-stable extent —
    /// replaying it via [`Page::overwrite_slot`] reproduces the slot
    /// exactly, filler and all. Used by WAL redo/undo, which reapplies
    /// whole slots rather than just the logical payload so it can also
    /// replay deletes and inserts, not only in-place shrinks.
    pub fn raw_slot(&self, offset: usize) -> StorageResult<Option<Vec<u8>>> {
        if offset < PAGE_HEADER_SIZE || offset >= self.used_space() {
            return Ok(None);
        }
        let (_, len) = DBObject::from_bytes(&self.buf[offset..])?;
        let mut end = offset + len;
        if end < self.used_space() {
            if let Ok((filler, filler_len)) = DBObject::from_bytes(&self.buf[end..]) {
                if filler.is_filler {
                    end += filler_len;
                }
            }
        }
        Ok(Some(self.buf[offset..end].to_vec()))
    }

    /// Returns a copy of `raw` (a slot captured by [`Page::raw_slot`]) with
    /// its alive flag forced to `alive`. Lets callers build the WAL
    /// before-image for an insert's undo (no prior slot exists, so undo is
    /// "this slot never became visible") without a fixed-size heap needing
    /// a way to represent "absent" bytes.
    pub fn raw_slot_with_alive(raw: &[u8], alive: bool) -> Vec<u8> {
        let mut raw = raw.to_vec();
        if let Some(byte) = raw.first_mut() {
            *byte = if alive { ALIVE_FLAG } else { 0 };
        }
        raw
    }

    /// Overwrites the slot at `offset` with `raw`, which must be the exact
    /// wire encoding of a previously valid slot at that position (as
    /// returned by [`Page::raw_slot`]). Bypasses the capacity/shrink-only
    /// guard `update_at` enforces, since recovery replays byte-for-byte
    /// states the page already held, not caller-supplied payloads.
    ///
    /// `offset` may sit exactly at the current `used_space` boundary, in
    /// which case this also extends it — redoing an insert against a page
    /// that was never flushed before a crash has to recreate the slot, not
    /// just overwrite an already-allocated one.
    pub fn overwrite_slot(&mut self, offset: usize, raw: &[u8]) -> StorageResult<()> {
        if offset < PAGE_HEADER_SIZE
            || offset > self.used_space()
            || offset + raw.len() > self.page_size - PAGE_TRAILER_SIZE
        {
            return Err(StorageError::OutOfBounds {
                page_number: self.page_number,
                offset: offset as i32,
                used_space: self.used_space() as i32,
            });
        }
        self.buf[offset..offset + raw.len()].copy_from_slice(raw);
        let new_used = self.used_space().max(offset + raw.len());
        self.set_used_space(new_used);
        self.dirty = true;
        Ok(())
    }

    /// Clears the alive bit without moving bytes.
    pub fn mark_deleted(&mut self, offset: usize) -> StorageResult<()> {
        if offset < PAGE_HEADER_SIZE || offset >= self.used_space() {
            return Err(StorageError::OutOfBounds {
                page_number: self.page_number,
                offset: offset as i32,
                used_space: self.used_space() as i32,
            });
        }
        self.buf[offset] &= !ALIVE_FLAG;
        self.dirty = true;
        Ok(())
    }

    /// Iterates every object (alive or not) with its byte offset.
    pub fn iter_objects(&self) -> PageObjectIter<'_> {
        PageObjectIter {
            page: self,
            offset: PAGE_HEADER_SIZE,
        }
    }
}

pub struct PageObjectIter<'a> {
    page: &'a Page,
    offset: usize,
}

impl<'a> Iterator for PageObjectIter<'a> {
    type Item = (usize, DBObject);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.page.used_space() {
            return None;
        }
        match DBObject::from_bytes(&self.page.buf[self.offset..]) {
            Ok((obj, len)) => {
                let offset = self.offset;
                self.offset += len;
                Some((offset, obj))
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_select_byte_identical() {
        let mut page = Page::zeroed(3, 256);
        let obj = DBObject::new(1, 7, 0, b"hello".to_vec());
        let offset = page.append(&obj).unwrap();
        let read = page.read_at(offset).unwrap().unwrap();
        assert_eq!(read.data, b"hello");
        assert_eq!(read.collection_id, 7);
    }

    #[test]
    fn update_shrinks_in_place_and_round_trips_exactly() {
        let mut page = Page::zeroed(0, 256);
        let obj = DBObject::new(1, 1, 0, vec![b'x'; 40]);
        let offset = page.append(&obj).unwrap();
        page.update_at(offset, b"hi").unwrap();
        let read = page.read_at(offset).unwrap().unwrap();
        assert_eq!(read.data, b"hi");
    }

    #[test]
    fn update_accepts_equal_length_rewrite() {
        let mut page = Page::zeroed(0, 256);
        let obj = DBObject::new(1, 1, 0, b"hello".to_vec());
        let offset = page.append(&obj).unwrap();
        page.update_at(offset, b"world").unwrap();
        let read = page.read_at(offset).unwrap().unwrap();
        assert_eq!(read.data, b"world");
    }

    #[test]
    fn update_rejects_growth_beyond_data_size() {
        let mut page = Page::zeroed(0, 256);
        let obj = DBObject::new(1, 1, 0, b"hi".to_vec());
        let offset = page.append(&obj).unwrap();
        assert!(page.update_at(offset, b"hello").is_err());
    }

    #[test]
    fn update_rejects_a_shrink_too_small_to_hold_a_filler() {
        let mut page = Page::zeroed(0, 256);
        let obj = DBObject::new(1, 1, 0, b"hello".to_vec());
        let offset = page.append(&obj).unwrap();
        // Freeing 3 bytes leaves no room for a filler's own 17-byte meta.
        assert!(page.update_at(offset, b"hi").is_err());
    }

    #[test]
    fn mark_deleted_hides_from_read() {
        let mut page = Page::zeroed(0, 256);
        let obj = DBObject::new(1, 1, 0, b"x".to_vec());
        let offset = page.append(&obj).unwrap();
        page.mark_deleted(offset).unwrap();
        assert!(page.read_at(offset).unwrap().is_none());
    }

    #[test]
    fn next_object_offset_unaffected_by_earlier_shrink() {
        let mut page = Page::zeroed(0, 256);
        let a = page
            .append(&DBObject::new(1, 1, 0, vec![b'a'; 30]))
            .unwrap();
        let b = page.append(&DBObject::new(1, 1, 0, b"b".to_vec())).unwrap();
        page.update_at(a, b"aaaaa").unwrap();
        // `b`'s slot must still be readable at its original offset.
        let read_b = page.read_at(b).unwrap().unwrap();
        assert_eq!(read_b.data, b"b");
    }

    #[test]
    fn shrink_leaves_a_filler_slot_invisible_to_iteration() {
        let mut page = Page::zeroed(0, 256);
        let offset = page
            .append(&DBObject::new(1, 1, 0, vec![b'a'; 30]))
            .unwrap();
        page.update_at(offset, b"aaaaa").unwrap();
        let objects: Vec<_> = page.iter_objects().collect();
        assert_eq!(objects.len(), 2);
        assert!(objects[0].1.alive);
        assert!(!objects[1].1.alive);
        assert!(objects[1].1.is_filler);
    }

    #[test]
    fn raw_slot_round_trips_through_overwrite() {
        let mut page = Page::zeroed(0, 256);
        let obj = DBObject::new(1, 1, 0, b"hello".to_vec());
        let offset = page.append(&obj).unwrap();
        let before = page.raw_slot(offset).unwrap().unwrap();
        page.update_at(offset, b"world").unwrap();
        assert_ne!(page.raw_slot(offset).unwrap().unwrap(), before);
        page.overwrite_slot(offset, &before).unwrap();
        let read = page.read_at(offset).unwrap().unwrap();
        assert_eq!(read.data, b"hello");
    }

    #[test]
    fn raw_slot_spans_a_filler_left_by_a_shrink() {
        let mut page = Page::zeroed(0, 256);
        let offset = page
            .append(&DBObject::new(1, 1, 0, vec![b'a'; 30]))
            .unwrap();
        let next = page
            .append(&DBObject::new(1, 1, 0, b"tail".to_vec()))
            .unwrap();
        let before = page.raw_slot(offset).unwrap().unwrap();
        page.update_at(offset, b"aaaaa").unwrap();
        let after = page.raw_slot(offset).unwrap().unwrap();
        assert_eq!(after.len(), before.len());
        page.overwrite_slot(offset, &before).unwrap();
        let read = page.read_at(offset).unwrap().unwrap();
        assert_eq!(read.data, vec![b'a'; 30]);
        let read_next = page.read_at(next).unwrap().unwrap();
        assert_eq!(read_next.data, b"tail");
    }

    #[test]
    fn overwrite_slot_can_replay_a_delete() {
        let mut page = Page::zeroed(0, 256);
        let obj = DBObject::new(1, 1, 0, b"x".to_vec());
        let offset = page.append(&obj).unwrap();
        let alive = page.raw_slot(offset).unwrap().unwrap();
        page.mark_deleted(offset).unwrap();
        let deleted = page.raw_slot(offset).unwrap().unwrap();
        assert_ne!(alive, deleted);
        page.overwrite_slot(offset, &alive).unwrap();
        assert!(page.read_at(offset).unwrap().is_some());
        page.overwrite_slot(offset, &deleted).unwrap();
        assert!(page.read_at(offset).unwrap().is_none());
    }

    #[test]
    fn iter_objects_sees_dead_and_alive() {
        let mut page = Page::zeroed(0, 256);
        let a = page.append(&DBObject::new(1, 1, 0, b"a".to_vec())).unwrap();
        page.append(&DBObject::new(1, 1, 0, b"b".to_vec())).unwrap();
        page.mark_deleted(a).unwrap();
        let all: Vec<_> = page.iter_objects().collect();
        assert_eq!(all.len(), 2);
        assert!(!all[0].1.alive);
        assert!(all[1].1.alive);
    }
}
