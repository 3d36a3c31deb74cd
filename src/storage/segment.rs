//! Append-only storage segments.
//!
//! A [`Segment`] owns one fixed-size append region. Items are written
//! sequentially and never mutated; dead items are reclaimed by recycling
//! the whole segment. Lifecycle:
//!
//! ```text
//! Open --append--> Open | Sealed --scavenge--> Recycled --> (id reusable)
//! ```
//!
//! Item layout within a segment:
//!
//! ```text
//! [ expire: u64 | key_len: uvarint | value_len: uvarint | key | value ]
//! ```
//!
//! For file-backed caches a sealed segment's bytes move to its data file
//! and the RAM buffer is dropped; the in-memory [`Segment`] keeps serving
//! statistics and state.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use parking_lot::RwLock;

use crate::util::{read_uvarint, uvarint_len, write_uvarint};

/// Segment lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentState {
    /// Accepting appends and reads.
    Open = 0,
    /// Immutable; reads only.
    Sealed = 1,
    /// Contents dead; id pending reuse.
    Recycled = 2,
}

impl SegmentState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => SegmentState::Open,
            1 => SegmentState::Sealed,
            2 => SegmentState::Recycled,
            _ => panic!("invalid segment state {}", v),
        }
    }
}

/// Point-in-time statistics snapshot of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: u16,
    pub total_items: u32,
    pub total_active_items: u32,
    pub used_bytes: u32,
    pub max_expire_at: u64,
    pub creation_time: u64,
    pub state: SegmentState,
}

/// Where a segment's bytes currently live.
pub enum SegmentBuf {
    /// RAM-resident append buffer.
    Ram(Vec<u8>),
    /// Bytes moved to the segment's data file (file backend, sealed).
    File,
}

/// One append-only storage segment.
pub struct Segment {
    id: u16,
    capacity: usize,
    creation_time: AtomicU64,
    state: AtomicU8,
    total_items: AtomicU32,
    active_items: AtomicU32,
    used_bytes: AtomicU32,
    max_expire_at: AtomicU64,
    data: RwLock<SegmentBuf>,
}

impl Segment {
    /// Allocate an open RAM segment.
    pub fn new(id: u16, capacity: usize, now: u64) -> Self {
        Self {
            id,
            capacity,
            creation_time: AtomicU64::new(now),
            state: AtomicU8::new(SegmentState::Open as u8),
            total_items: AtomicU32::new(0),
            active_items: AtomicU32::new(0),
            used_bytes: AtomicU32::new(0),
            max_expire_at: AtomicU64::new(0),
            data: RwLock::new(SegmentBuf::Ram(Vec::with_capacity(capacity))),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> SegmentState {
        SegmentState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_sealed(&self) -> bool {
        self.state() == SegmentState::Sealed
    }

    pub fn info(&self) -> SegmentInfo {
        SegmentInfo {
            id: self.id,
            total_items: self.total_items.load(Ordering::Relaxed),
            total_active_items: self.active_items.load(Ordering::Relaxed),
            used_bytes: self.used_bytes.load(Ordering::Relaxed),
            max_expire_at: self.max_expire_at.load(Ordering::Relaxed),
            creation_time: self.creation_time.load(Ordering::Relaxed),
            state: self.state(),
        }
    }

    /// Mark one item dead. Called when its index entry is removed.
    pub fn item_removed(&self) {
        // fetch_update so concurrent removals never underflow.
        let _ = self
            .active_items
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Append one encoded item. Returns the item's byte offset, or `None`
    /// when the segment is not open or lacks room (the caller seals it).
    pub fn append(&self, item: &[u8], expire: u64) -> Option<u32> {
        let mut data = self.data.write();
        if self.state() != SegmentState::Open {
            return None;
        }
        let SegmentBuf::Ram(buf) = &mut *data else {
            return None;
        };
        if buf.len() + item.len() > self.capacity {
            return None;
        }
        let offset = buf.len() as u32;
        buf.extend_from_slice(item);
        self.total_items.fetch_add(1, Ordering::Relaxed);
        self.active_items.fetch_add(1, Ordering::Relaxed);
        self.used_bytes.fetch_add(item.len() as u32, Ordering::Relaxed);
        self.max_expire_at.fetch_max(expire, Ordering::Relaxed);
        Some(offset)
    }

    /// Append raw zero padding (block-aligned writer). Not counted as an
    /// item; scanners skip it by its zero key-length marker.
    pub fn pad(&self, n: usize) -> bool {
        let mut data = self.data.write();
        if self.state() != SegmentState::Open {
            return false;
        }
        let SegmentBuf::Ram(buf) = &mut *data else {
            return false;
        };
        if buf.len() + n > self.capacity {
            return false;
        }
        buf.resize(buf.len() + n, 0);
        self.used_bytes.fetch_add(n as u32, Ordering::Relaxed);
        true
    }

    /// Current append position.
    pub fn write_offset(&self) -> u32 {
        match &*self.data.read() {
            SegmentBuf::Ram(buf) => buf.len() as u32,
            SegmentBuf::File => self.used_bytes.load(Ordering::Relaxed),
        }
    }

    /// Copy `len` bytes at `offset` into `out` from a RAM-resident buffer.
    /// Returns `None` for file-resident segments (the file reader handles
    /// those) or out-of-range requests.
    pub fn read_ram(&self, offset: u32, len: usize, out: &mut Vec<u8>) -> Option<()> {
        let data = self.data.read();
        let SegmentBuf::Ram(buf) = &*data else {
            return None;
        };
        let start = offset as usize;
        if start + len > buf.len() {
            return None;
        }
        out.clear();
        out.extend_from_slice(&buf[start..start + len]);
        Some(())
    }

    /// Whether the bytes currently live in RAM.
    pub fn is_ram_resident(&self) -> bool {
        matches!(&*self.data.read(), SegmentBuf::Ram(_))
    }

    /// Seal the segment: no further appends.
    pub fn seal(&self) -> bool {
        self.state
            .compare_exchange(
                SegmentState::Open as u8,
                SegmentState::Sealed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Take the RAM buffer out, leaving the segment file-resident. Used by
    /// the file backend when persisting a sealed segment.
    pub fn take_ram_buf(&self) -> Option<Vec<u8>> {
        let mut data = self.data.write();
        match &mut *data {
            SegmentBuf::Ram(buf) => {
                let taken = std::mem::take(buf);
                *data = SegmentBuf::File;
                Some(taken)
            }
            SegmentBuf::File => None,
        }
    }

    /// Install a RAM buffer (snapshot load).
    pub fn restore_ram_buf(&self, buf: Vec<u8>) {
        *self.data.write() = SegmentBuf::Ram(buf);
    }

    /// Mark file-resident without a buffer (snapshot load, file backend).
    pub fn mark_file_resident(&self) {
        *self.data.write() = SegmentBuf::File;
    }

    /// Transition to `Recycled` and drop any buffer.
    pub fn recycle(&self) {
        self.state
            .store(SegmentState::Recycled as u8, Ordering::Release);
        *self.data.write() = SegmentBuf::Ram(Vec::new());
    }

    /// Restore statistics from a snapshot.
    pub fn restore_info(&self, info: &SegmentInfo) {
        self.total_items.store(info.total_items, Ordering::Relaxed);
        self.active_items
            .store(info.total_active_items, Ordering::Relaxed);
        self.used_bytes.store(info.used_bytes, Ordering::Relaxed);
        self.max_expire_at
            .store(info.max_expire_at, Ordering::Relaxed);
        self.creation_time
            .store(info.creation_time, Ordering::Relaxed);
        self.state.store(info.state as u8, Ordering::Release);
    }
}

/// Encode one item into `out`, returning its total encoded length.
pub fn encode_item(out: &mut Vec<u8>, key: &[u8], value: &[u8], expire: u64) -> usize {
    let start = out.len();
    out.extend_from_slice(&expire.to_le_bytes());
    write_uvarint(out, key.len() as u64);
    write_uvarint(out, value.len() as u64);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out.len() - start
}

/// Total encoded size of an item.
pub fn encoded_item_size(key_len: usize, value_len: usize) -> usize {
    8 + crate::util::kv_size(key_len, value_len)
}

/// Decoded header of one stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    pub expire: u64,
    pub key_len: usize,
    pub value_len: usize,
    /// Bytes before the key (expire + both varints).
    pub header_len: usize,
}

impl ItemHeader {
    pub fn total_len(&self) -> usize {
        self.header_len + self.key_len + self.value_len
    }
}

/// Parse an item header from the front of `data`. A zero key length marks
/// writer padding, reported as `Ok(None)`; truncated input is `Err(())`.
pub fn decode_item_header(data: &[u8]) -> Result<Option<ItemHeader>, ()> {
    if data.len() < 9 {
        return Err(());
    }
    let expire = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let (key_len, k_n) = read_uvarint(&data[8..]).ok_or(())?;
    if key_len == 0 {
        return Ok(None);
    }
    let (value_len, v_n) = read_uvarint(&data[8 + k_n..]).ok_or(())?;
    Ok(Some(ItemHeader {
        expire,
        key_len: key_len as usize,
        value_len: value_len as usize,
        header_len: 8 + k_n + v_n,
    }))
}

/// Serialized key/value size of an item (as recorded in index entries):
/// everything after the expire prefix.
pub fn item_kv_size(key_len: usize, value_len: usize) -> u32 {
    (uvarint_len(key_len as u64) + uvarint_len(value_len as u64) + key_len + value_len) as u32
}

/// Iterator over the items of a RAM-resident segment.
pub struct RamSegmentScanner {
    buf: Vec<u8>,
    pos: usize,
    remaining_items: u32,
    block_size: Option<usize>,
}

/// One scanned item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanItem {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub expire: u64,
    /// Byte offset of the item within its segment.
    pub offset: u32,
}

impl RamSegmentScanner {
    /// Snapshot a segment's buffer for scanning. `block_size` enables
    /// padding skip for block-aligned writers.
    pub fn new(segment: &Segment, block_size: Option<usize>) -> Option<Self> {
        let data = segment.data.read();
        let SegmentBuf::Ram(buf) = &*data else {
            return None;
        };
        Some(Self {
            buf: buf.clone(),
            pos: 0,
            remaining_items: segment.info().total_items,
            block_size,
        })
    }

    /// Next item, or `None` at the end of the segment.
    pub fn next_item(&mut self) -> Option<ScanItem> {
        while self.remaining_items > 0 && self.pos < self.buf.len() {
            match decode_item_header(&self.buf[self.pos..]) {
                Ok(Some(header)) => {
                    let total = header.total_len();
                    if self.pos + total > self.buf.len() {
                        return None;
                    }
                    let key_start = self.pos + header.header_len;
                    let value_start = key_start + header.key_len;
                    let item = ScanItem {
                        key: self.buf[key_start..value_start].to_vec(),
                        value: self.buf[value_start..value_start + header.value_len].to_vec(),
                        expire: header.expire,
                        offset: self.pos as u32,
                    };
                    self.pos += total;
                    self.remaining_items -= 1;
                    return Some(item);
                }
                Ok(None) => {
                    // Writer padding: jump to the next block boundary.
                    let block = self.block_size?;
                    self.pos = (self.pos / block + 1) * block;
                }
                Err(()) => return None,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_codec_round_trip() {
        let mut buf = Vec::new();
        let len = encode_item(&mut buf, b"key", b"value-bytes", 42);
        assert_eq!(len, buf.len());
        assert_eq!(len, encoded_item_size(3, 11));

        let header = decode_item_header(&buf).unwrap().unwrap();
        assert_eq!(header.expire, 42);
        assert_eq!(header.key_len, 3);
        assert_eq!(header.value_len, 11);
        assert_eq!(&buf[header.header_len..header.header_len + 3], b"key");
    }

    #[test]
    fn test_decode_padding_and_truncation() {
        // Zero key length = padding marker.
        let mut padding = vec![0u8; 16];
        assert_eq!(decode_item_header(&padding), Ok(None));
        padding[8] = 1; // key_len 1, truncated value varint is still fine here
        assert!(matches!(decode_item_header(&padding), Ok(Some(_))));
        assert!(decode_item_header(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_append_and_read() {
        let segment = Segment::new(1, 1024, 100);
        let mut item = Vec::new();
        encode_item(&mut item, b"k1", b"v1", 0);
        let off1 = segment.append(&item, 0).unwrap();
        assert_eq!(off1, 0);

        let mut item2 = Vec::new();
        encode_item(&mut item2, b"k2", b"v2", 500);
        let off2 = segment.append(&item2, 500).unwrap();
        assert_eq!(off2 as usize, item.len());

        let info = segment.info();
        assert_eq!(info.total_items, 2);
        assert_eq!(info.total_active_items, 2);
        assert_eq!(info.max_expire_at, 500);
        assert_eq!(info.used_bytes as usize, item.len() + item2.len());

        let mut out = Vec::new();
        segment.read_ram(off2, item2.len(), &mut out).unwrap();
        assert_eq!(out, item2);
    }

    #[test]
    fn test_append_full_segment() {
        let segment = Segment::new(1, 64, 0);
        let mut item = Vec::new();
        encode_item(&mut item, b"key", &[0u8; 40], 0);
        assert!(segment.append(&item, 0).is_some());
        assert!(segment.append(&item, 0).is_none());
    }

    #[test]
    fn test_seal_stops_appends() {
        let segment = Segment::new(1, 1024, 0);
        let mut item = Vec::new();
        encode_item(&mut item, b"k", b"v", 0);
        assert!(segment.append(&item, 0).is_some());
        assert!(segment.seal());
        assert!(!segment.seal());
        assert_eq!(segment.state(), SegmentState::Sealed);
        assert!(segment.append(&item, 0).is_none());
    }

    #[test]
    fn test_item_removed_floor() {
        let segment = Segment::new(1, 1024, 0);
        let mut item = Vec::new();
        encode_item(&mut item, b"k", b"v", 0);
        segment.append(&item, 0);
        segment.item_removed();
        assert_eq!(segment.info().total_active_items, 0);
        // Extra removals never underflow.
        segment.item_removed();
        assert_eq!(segment.info().total_active_items, 0);
    }

    #[test]
    fn test_recycle_resets_buffer() {
        let segment = Segment::new(1, 1024, 0);
        let mut item = Vec::new();
        encode_item(&mut item, b"k", b"v", 0);
        segment.append(&item, 0);
        segment.seal();
        segment.recycle();
        assert_eq!(segment.state(), SegmentState::Recycled);
        assert!(segment.append(&item, 0).is_none());
    }

    #[test]
    fn test_ram_scanner() {
        let segment = Segment::new(1, 4096, 0);
        for i in 0..10u32 {
            let mut item = Vec::new();
            encode_item(
                &mut item,
                format!("key-{i}").as_bytes(),
                format!("value-{i}").as_bytes(),
                u64::from(i),
            );
            segment.append(&item, u64::from(i)).unwrap();
        }
        let mut scanner = RamSegmentScanner::new(&segment, None).unwrap();
        let mut seen = 0;
        while let Some(item) = scanner.next_item() {
            assert_eq!(item.key, format!("key-{seen}").as_bytes());
            assert_eq!(item.value, format!("value-{seen}").as_bytes());
            assert_eq!(item.expire, seen as u64);
            seen += 1;
        }
        assert_eq!(seen, 10);
    }

    #[test]
    fn test_ram_scanner_skips_padding() {
        let segment = Segment::new(1, 4096, 0);
        let mut item = Vec::new();
        encode_item(&mut item, b"first", b"1111", 0);
        segment.append(&item, 0).unwrap();
        // Pad to a 128-byte boundary like the block writer would.
        let pad = 128 - segment.write_offset() as usize % 128;
        assert!(segment.pad(pad));
        let mut item2 = Vec::new();
        encode_item(&mut item2, b"second", b"2222", 0);
        assert_eq!(segment.append(&item2, 0), Some(128));

        let mut scanner = RamSegmentScanner::new(&segment, Some(128)).unwrap();
        assert_eq!(scanner.next_item().unwrap().key, b"first");
        let second = scanner.next_item().unwrap();
        assert_eq!(second.key, b"second");
        assert_eq!(second.offset, 128);
        assert!(scanner.next_item().is_none());
    }
}
