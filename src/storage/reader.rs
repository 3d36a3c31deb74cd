//! Pluggable point readers.
//!
//! A [`DataReader`] resolves one positioned item read against the segment
//! bank. The memory reader serves RAM-resident buffers only; the file
//! reader falls back to a positioned read of the segment's data file once
//! the bytes have been sealed to disk.

use crate::storage::file::FileBackend;
use crate::storage::SegmentPool;

/// Resolves positioned reads of item bytes.
pub trait DataReader: Send + Sync {
    /// Read `len` bytes at `(sid, offset)` into `out` (offset is relative
    /// to the segment's item region). False on a miss or I/O failure; I/O
    /// failures are logged here and surface to the caller as a miss.
    fn read(
        &self,
        pool: &SegmentPool,
        backend: Option<&FileBackend>,
        sid: u16,
        offset: u32,
        len: usize,
        out: &mut Vec<u8>,
    ) -> bool;
}

/// Reader for RAM-resident caches.
#[derive(Debug, Clone, Default)]
pub struct BaseMemoryDataReader;

impl DataReader for BaseMemoryDataReader {
    fn read(
        &self,
        pool: &SegmentPool,
        _backend: Option<&FileBackend>,
        sid: u16,
        offset: u32,
        len: usize,
        out: &mut Vec<u8>,
    ) -> bool {
        let Some(seg) = pool.get(sid) else {
            return false;
        };
        seg.read_ram(offset, len, out).is_some()
    }
}

/// Reader for file-backed caches: open segments are still served from
/// their RAM buffers, sealed ones by a single positioned file read.
#[derive(Debug, Clone, Default)]
pub struct BaseFileDataReader;

impl DataReader for BaseFileDataReader {
    fn read(
        &self,
        pool: &SegmentPool,
        backend: Option<&FileBackend>,
        sid: u16,
        offset: u32,
        len: usize,
        out: &mut Vec<u8>,
    ) -> bool {
        let Some(seg) = pool.get(sid) else {
            return false;
        };
        if seg.read_ram(offset, len, out).is_some() {
            return true;
        }
        let Some(backend) = backend else {
            return false;
        };
        match backend.read(sid, offset, len, out) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(sid, offset, error = %e, "segment read failed");
                false
            }
        }
    }
}
