//! Index entry formats.
//!
//! An [`IndexFormat`] defines the byte layout of entries inside an index
//! block. Two built-ins exist:
//!
//! - [`MainQueueFormat`]: full per-item metadata, optionally with the
//!   serialized key/value embedded for small items
//! - [`AdmissionQueueFormat`]: bare 8-byte key hashes (ghost entries)
//!
//! Formats never expose raw offsets into blocks to other components; the
//! memory index walks blocks with `entry_size` and hands out decoded
//! [`EntryInfo`] values.

use bytes::{Buf, BufMut};

/// Segment id marker for entries whose payload is embedded in the entry
/// itself.
pub const EMBEDDED_SID: u16 = u16::MAX;

/// Decoded view of a main-queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Segment holding the item, or `None` for embedded entries.
    pub sid: Option<u16>,
    /// Byte offset of the item within its segment.
    pub offset: u32,
    /// Serialized key/value size (varint lengths + key + value).
    pub kv_size: u32,
    /// Saturating per-entry hit counter.
    pub hit_count: u8,
    /// Absolute expiration in epoch milliseconds; 0 means never.
    pub expire: u64,
    /// Serialized key/value payload for embedded entries.
    pub embedded: Option<Vec<u8>>,
}

/// Byte layout of one index entry kind.
pub trait IndexFormat: Send + Sync {
    /// Total size of the entry starting at `data[0]`.
    fn entry_size(&self, data: &[u8]) -> usize;

    /// Size the entry for an item with the given serialized k/v size would
    /// occupy, were it embedded or not.
    fn entry_size_for(&self, kv_size: u32, embedded: bool) -> usize;

    /// Key hash stored in the entry.
    fn hash_of(&self, entry: &[u8]) -> u64;

    /// Expiration timestamp; 0 when the format has none.
    fn expire_of(&self, _entry: &[u8]) -> u64 {
        0
    }

    /// Whether entries carry expiration timestamps.
    fn expiration_supported(&self) -> bool {
        false
    }

    /// Epoch-rollover hook: when true, the caller rescans the whole block
    /// before inserting. Both built-in formats store absolute expirations
    /// and never request it.
    fn begin_scan(&self) -> bool {
        false
    }

    /// Decode the full entry. Formats without payload metadata (AQ) return
    /// `None`.
    fn decode(&self, _entry: &[u8]) -> Option<EntryInfo> {
        None
    }

    /// Record a hit on the entry.
    fn hit(&self, _entry: &mut [u8]) {}

    /// Rewrite the entry's storage location in place.
    fn set_location(&self, _entry: &mut [u8], _sid: u16, _offset: u32) {}
}

/// Full main-queue entry:
///
/// ```text
/// [ hash: u64 | kv_size: u32 | sid: u16 | offset: u32 | hits: u8 | expire: u64 ]
/// ```
///
/// 27 bytes fixed, little-endian. When `sid == EMBEDDED_SID` the serialized
/// key/value (`kv_size` bytes) follows the fixed part and `offset` is
/// unused.
#[derive(Debug, Clone, Default)]
pub struct MainQueueFormat;

/// Fixed portion of a main-queue entry.
pub const MQ_ENTRY_SIZE: usize = 8 + 4 + 2 + 4 + 1 + 8;

impl MainQueueFormat {
    /// Encode an entry pointing into a segment.
    pub fn encode(out: &mut Vec<u8>, hash: u64, sid: u16, offset: u32, kv_size: u32, expire: u64) {
        debug_assert_ne!(sid, EMBEDDED_SID);
        Self::encode_raw(out, hash, sid, offset, kv_size, expire);
    }

    /// Encode an entry with the item payload embedded.
    pub fn encode_embedded(out: &mut Vec<u8>, hash: u64, payload: &[u8], expire: u64) {
        Self::encode_raw(out, hash, EMBEDDED_SID, 0, payload.len() as u32, expire);
        out.extend_from_slice(payload);
    }

    fn encode_raw(out: &mut Vec<u8>, hash: u64, sid: u16, offset: u32, kv_size: u32, expire: u64) {
        out.put_u64_le(hash);
        out.put_u32_le(kv_size);
        out.put_u16_le(sid);
        out.put_u32_le(offset);
        out.put_u8(0);
        out.put_u64_le(expire);
    }

    fn sid_raw(entry: &[u8]) -> u16 {
        (&entry[12..14]).get_u16_le()
    }

    fn kv_size_raw(entry: &[u8]) -> u32 {
        (&entry[8..12]).get_u32_le()
    }
}

impl IndexFormat for MainQueueFormat {
    fn entry_size(&self, data: &[u8]) -> usize {
        if Self::sid_raw(data) == EMBEDDED_SID {
            MQ_ENTRY_SIZE + Self::kv_size_raw(data) as usize
        } else {
            MQ_ENTRY_SIZE
        }
    }

    fn entry_size_for(&self, kv_size: u32, embedded: bool) -> usize {
        if embedded {
            MQ_ENTRY_SIZE + kv_size as usize
        } else {
            MQ_ENTRY_SIZE
        }
    }

    fn hash_of(&self, entry: &[u8]) -> u64 {
        (&entry[0..8]).get_u64_le()
    }

    fn expire_of(&self, entry: &[u8]) -> u64 {
        (&entry[19..27]).get_u64_le()
    }

    fn expiration_supported(&self) -> bool {
        true
    }

    fn decode(&self, entry: &[u8]) -> Option<EntryInfo> {
        let sid = Self::sid_raw(entry);
        let kv_size = Self::kv_size_raw(entry);
        let embedded = if sid == EMBEDDED_SID {
            Some(entry[MQ_ENTRY_SIZE..MQ_ENTRY_SIZE + kv_size as usize].to_vec())
        } else {
            None
        };
        Some(EntryInfo {
            sid: if sid == EMBEDDED_SID { None } else { Some(sid) },
            offset: (&entry[14..18]).get_u32_le(),
            kv_size,
            hit_count: entry[18],
            expire: self.expire_of(entry),
            embedded,
        })
    }

    fn hit(&self, entry: &mut [u8]) {
        entry[18] = entry[18].saturating_add(1);
    }

    fn set_location(&self, entry: &mut [u8], sid: u16, offset: u32) {
        entry[12..14].copy_from_slice(&sid.to_le_bytes());
        entry[14..18].copy_from_slice(&offset.to_le_bytes());
    }
}

/// Admission-queue entry: the bare 8-byte key hash.
#[derive(Debug, Clone, Default)]
pub struct AdmissionQueueFormat;

/// Size of an admission-queue entry.
pub const AQ_ENTRY_SIZE: usize = 8;

impl AdmissionQueueFormat {
    /// Encode an admission-queue entry.
    pub fn encode(out: &mut Vec<u8>, hash: u64) {
        out.put_u64_le(hash);
    }
}

impl IndexFormat for AdmissionQueueFormat {
    fn entry_size(&self, _data: &[u8]) -> usize {
        AQ_ENTRY_SIZE
    }

    fn entry_size_for(&self, _kv_size: u32, _embedded: bool) -> usize {
        AQ_ENTRY_SIZE
    }

    fn hash_of(&self, entry: &[u8]) -> u64 {
        (&entry[0..8]).get_u64_le()
    }
}
