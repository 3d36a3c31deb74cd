//! File backend: one data file per sealed segment.
//!
//! A sealed segment is persisted as `seg-<id>.data` under the data
//! directory:
//!
//! ```text
//! [ magic: u32 | version: u16 | id: u16 | total_items: u32
//!   | active_items: u32 | used_bytes: u32 | max_expire_at: u64
//!   | creation_time: u64 | items... ]
//! ```
//!
//! Item offsets stored in the index are relative to the item region, so
//! point reads add [`SEG_FILE_HEADER_LEN`]. Releasing a segment deletes its
//! file. With sparse-file support enabled the scavenger can punch holes
//! over dead ranges instead of waiting for the whole segment to recycle.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CacheError, CacheResult};
use crate::storage::prefetch::PrefetchBuffer;
use crate::storage::segment::{Segment, SegmentInfo};
use crate::util::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};

const SEG_FILE_MAGIC: u32 = 0x5443_5347; // "TCSG"
const SEG_FILE_VERSION: u16 = 1;

/// Fixed header length of a segment data file.
pub const SEG_FILE_HEADER_LEN: u64 = 4 + 2 + 2 + 4 + 4 + 4 + 8 + 8;

/// Per-cache file storage for sealed segments.
pub struct FileBackend {
    data_dir: PathBuf,
    sparse: bool,
    files: Mutex<HashMap<u16, Arc<File>>>,
}

impl FileBackend {
    /// Open (creating if needed) the data directory.
    pub fn new(data_dir: impl Into<PathBuf>, sparse: bool) -> CacheResult<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|e| {
            CacheError::Config(format!(
                "cannot create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            data_dir,
            sparse,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the data file for a segment id.
    pub fn segment_path(&self, sid: u16) -> PathBuf {
        self.data_dir.join(format!("seg-{sid:05}.data"))
    }

    fn open(&self, sid: u16) -> io::Result<Arc<File>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(&sid) {
            return Ok(file.clone());
        }
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.segment_path(sid))?,
        );
        files.insert(sid, file.clone());
        Ok(file)
    }

    /// Persist a sealed segment's bytes, dropping its RAM buffer.
    pub fn persist_sealed(&self, segment: &Segment) -> io::Result<()> {
        let Some(buf) = segment.take_ram_buf() else {
            return Ok(()); // already file-resident
        };
        let info = segment.info();
        let path = self.segment_path(info.id);
        let mut file = File::create(&path)?;
        write_header(&mut file, &info)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        self.files.lock().insert(info.id, Arc::new(file));
        Ok(())
    }

    /// Positioned read of `len` item bytes at `offset` (item-region
    /// relative) from segment `sid`.
    pub fn read(&self, sid: u16, offset: u32, len: usize, out: &mut Vec<u8>) -> io::Result<()> {
        let file = self.open(sid)?;
        out.clear();
        out.resize(len, 0);
        file.read_exact_at(out, SEG_FILE_HEADER_LEN + u64::from(offset))
    }

    /// Sequential scanner over a segment file's item region.
    pub fn scanner(&self, sid: u16, prefetch_size: usize) -> io::Result<PrefetchBuffer> {
        let path = self.segment_path(sid);
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len < SEG_FILE_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "segment file shorter than header",
            ));
        }
        PrefetchBuffer::new(file, SEG_FILE_HEADER_LEN, len, prefetch_size)
    }

    /// Read back the header of a segment file (startup recovery).
    pub fn read_header(&self, sid: u16) -> io::Result<SegmentInfo> {
        let file = self.open(sid)?;
        let mut buf = vec![0u8; SEG_FILE_HEADER_LEN as usize];
        file.read_exact_at(&mut buf, 0)?;
        parse_header(&buf)
    }

    /// Punch a hole over a dead item range when sparse files are enabled.
    /// Best effort: unsupported filesystems degrade to a no-op.
    pub fn punch_hole(&self, sid: u16, offset: u32, len: usize) {
        if !self.sparse || len == 0 {
            return;
        }
        let Ok(file) = self.open(sid) else { return };
        let start = (SEG_FILE_HEADER_LEN + u64::from(offset)) as libc::off_t;
        // SAFETY: fallocate only touches the file referred to by the fd; a
        // failure leaves the data intact.
        let rc = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                start,
                len as libc::off_t,
            )
        };
        if rc != 0 {
            tracing::debug!(sid, "hole punch unsupported; skipping");
        }
    }

    /// Close and delete a recycled segment's file.
    pub fn release(&self, sid: u16) {
        self.files.lock().remove(&sid);
        if let Err(e) = fs::remove_file(self.segment_path(sid)) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::error!(sid, error = %e, "failed to delete segment file");
            }
        }
    }

    /// Segment ids with data files on disk (startup recovery).
    pub fn existing_segment_ids(&self) -> io::Result<Vec<u16>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("seg-") {
                if let Some(num) = rest.strip_suffix(".data") {
                    if let Ok(id) = num.parse::<u16>() {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

fn write_header(w: &mut impl Write, info: &SegmentInfo) -> io::Result<()> {
    put_u32(w, SEG_FILE_MAGIC)?;
    put_u16(w, SEG_FILE_VERSION)?;
    put_u16(w, info.id)?;
    put_u32(w, info.total_items)?;
    put_u32(w, info.total_active_items)?;
    put_u32(w, info.used_bytes)?;
    put_u64(w, info.max_expire_at)?;
    put_u64(w, info.creation_time)
}

fn parse_header(buf: &[u8]) -> io::Result<SegmentInfo> {
    let mut r = buf;
    if get_u32(&mut r)? != SEG_FILE_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad segment file magic",
        ));
    }
    if get_u16(&mut r)? != SEG_FILE_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported segment file version",
        ));
    }
    Ok(SegmentInfo {
        id: get_u16(&mut r)?,
        total_items: get_u32(&mut r)?,
        total_active_items: get_u32(&mut r)?,
        used_bytes: get_u32(&mut r)?,
        max_expire_at: get_u64(&mut r)?,
        creation_time: get_u64(&mut r)?,
        state: crate::storage::segment::SegmentState::Sealed,
    })
}
