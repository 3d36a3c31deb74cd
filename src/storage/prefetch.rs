//! Streaming read-ahead for file segment scans.
//!
//! [`PrefetchBuffer`] pulls a segment file through a fixed-size window so
//! the scavenger's sequential pass issues large reads instead of one read
//! per item. The window grows on demand when a single item exceeds it.
//! A trailing region smaller than the minimal encodable item terminates
//! the scan as a clean end-of-file.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use crate::storage::segment::{decode_item_header, ScanItem};

/// Smallest possible encoded item: 8-byte expire, two 1-byte varints, and
/// at least one key byte.
const MIN_ITEM_LEN: usize = 11;

/// Lower bound on the window so item headers always fit.
const MIN_WINDOW: usize = 64;

/// Windowed sequential reader over a byte range of a file.
pub struct PrefetchBuffer {
    file: File,
    /// First file offset of the readable range; scan offsets are reported
    /// relative to it.
    range_start: u64,
    /// File offset one past the readable range.
    range_end: u64,
    /// File offset corresponding to `buf[0]`.
    window_start: u64,
    buf: Vec<u8>,
    /// Valid bytes in `buf`.
    data_len: usize,
    /// Cursor within `buf`.
    pos: usize,
}

impl PrefetchBuffer {
    /// Create a buffer over `[range_start, range_end)` of `file` with the
    /// given window size.
    pub fn new(
        file: File,
        range_start: u64,
        range_end: u64,
        buffer_size: usize,
    ) -> io::Result<Self> {
        let mut this = Self {
            file,
            range_start,
            range_end,
            window_start: range_start,
            buf: vec![0; buffer_size.max(MIN_WINDOW)],
            data_len: 0,
            pos: 0,
        };
        this.refill()?;
        Ok(this)
    }

    /// Cursor position relative to the start of the range.
    pub fn offset(&self) -> u64 {
        self.window_start + self.pos as u64 - self.range_start
    }

    fn abs_offset(&self) -> u64 {
        self.window_start + self.pos as u64
    }

    fn remaining_in_window(&self) -> usize {
        self.data_len - self.pos
    }

    fn remaining_in_range(&self) -> u64 {
        self.range_end - self.abs_offset()
    }

    /// Slide the window so the cursor is at `buf[0]` and the window is as
    /// full as the range allows.
    fn refill(&mut self) -> io::Result<()> {
        let keep = self.remaining_in_window();
        self.buf.copy_within(self.pos..self.data_len, 0);
        self.window_start += self.pos as u64;
        self.pos = 0;
        self.data_len = keep;

        let read_at = self.window_start + self.data_len as u64;
        let want = (self.buf.len() - self.data_len).min((self.range_end - read_at) as usize);
        if want > 0 {
            self.file
                .read_exact_at(&mut self.buf[self.data_len..self.data_len + want], read_at)?;
            self.data_len += want;
        }
        Ok(())
    }

    /// Make at least `n` bytes available at the cursor, growing the window
    /// if one item needs more than it holds. False when the range has
    /// fewer than `n` bytes left.
    fn ensure(&mut self, n: usize) -> io::Result<bool> {
        if n as u64 > self.remaining_in_range() {
            return Ok(false);
        }
        if n > self.buf.len() {
            self.buf.resize(n.next_power_of_two(), 0);
        }
        if self.remaining_in_window() < n {
            self.refill()?;
        }
        Ok(self.remaining_in_window() >= n)
    }

    /// Advance the cursor to the next multiple of `block` relative to the
    /// range start (padding skip for block-aligned writers).
    pub fn skip_to_block_boundary(&mut self, block: usize) -> io::Result<bool> {
        let rel = self.offset();
        let next = (rel / block as u64 + 1) * block as u64;
        if self.range_start + next >= self.range_end {
            return Ok(false);
        }
        let skip = (next - rel) as usize;
        if !self.ensure(skip)? {
            return Ok(false);
        }
        self.pos += skip;
        Ok(true)
    }

    /// Decode the item at the cursor and advance past it.
    ///
    /// Returns `Ok(None)` at end of range, when fewer than a minimal item's
    /// bytes remain (the defined trailing-record rule), or when the bytes
    /// at the cursor are writer padding and no block size is given.
    pub fn next_item(&mut self, block_size: Option<usize>) -> io::Result<Option<ScanItem>> {
        loop {
            if !self.ensure(MIN_ITEM_LEN)? {
                if self.remaining_in_range() > 0 {
                    tracing::warn!("segment scan stopped at short trailing record");
                }
                return Ok(None);
            }
            let header = match decode_item_header(&self.buf[self.pos..self.data_len]) {
                Ok(Some(header)) => header,
                Ok(None) => {
                    // Padding: only meaningful under a block-aligned writer.
                    let Some(block) = block_size else {
                        return Ok(None);
                    };
                    if !self.skip_to_block_boundary(block)? {
                        return Ok(None);
                    }
                    continue;
                }
                Err(()) => {
                    // Header truncated by the window edge; pull more bytes
                    // and retry, or accept the short tail at range end.
                    if (self.remaining_in_window() as u64) < self.remaining_in_range() {
                        let want = (self.remaining_in_window() + MIN_WINDOW)
                            .min(self.remaining_in_range() as usize);
                        self.ensure(want)?;
                        continue;
                    }
                    tracing::warn!("segment scan stopped at undecodable trailing record");
                    return Ok(None);
                }
            };
            let total = header.total_len();
            if !self.ensure(total)? {
                tracing::warn!("segment scan stopped at truncated final item");
                return Ok(None);
            }
            let item_offset = self.offset() as u32;
            let key_start = self.pos + header.header_len;
            let value_start = key_start + header.key_len;
            let item = ScanItem {
                key: self.buf[key_start..value_start].to_vec(),
                value: self.buf[value_start..value_start + header.value_len].to_vec(),
                expire: header.expire,
                offset: item_offset,
            };
            self.pos += total;
            return Ok(Some(item));
        }
    }
}
