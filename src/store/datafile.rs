//! Append-only data files of the cask store.
//!
//! # On-disk layout
//!
//! ```text
//! [MAGIC "CASK"][VERSION u32][FILE_ID u32][HEADER_CRC32]
//! [LEN u32][PAYLOAD][CRC32]
//! [LEN u32][PAYLOAD][CRC32]
//! ...
//! PAYLOAD := [stamp u64][key: u32 len + bytes][value: u32 len + bytes]
//! ```
//!
//! All integers are little-endian. The record CRC covers `LEN || PAYLOAD`.
//! The `stamp` is a store-wide write counter: when the same key appears in
//! several files, the record with the highest stamp is the live one. Merge
//! copies frames verbatim, so stamps survive compaction.
//!
//! A file is only ever appended to by the writer that created it. Reads use
//! positional I/O and never move the append cursor.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crc32fast::Hasher as Crc32;
use tracing::{debug, trace, warn};

use super::StoreError;
use crate::encoding::{self, Decode, Encode};

pub(crate) const DATA_SUFFIX: &str = ".cask.data";

const MAGIC: [u8; 4] = *b"CASK";
const VERSION: u32 = 1;
const U32_SIZE: usize = std::mem::size_of::<u32>();

/// `magic + version + file_id + crc`.
pub(crate) const HEADER_LEN: u64 = 16;

/// Smallest possible record frame: len, stamp, two empty byte strings, crc.
const MIN_FRAME_LEN: usize = U32_SIZE + 8 + U32_SIZE + U32_SIZE + U32_SIZE;

/// File name for data file `id`.
pub(crate) fn file_name(id: u32) -> String {
    format!("{id:06}{DATA_SUFFIX}")
}

/// Parses `id` from a name produced by [`file_name`].
pub(crate) fn parse_file_id(name: &str) -> Option<u32> {
    name.strip_suffix(DATA_SUFFIX)?.parse::<u32>().ok()
}

fn checksum(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

// ------------------------------------------------------------------------------------------------
// Frames
// ------------------------------------------------------------------------------------------------

/// A decoded record.
#[derive(Debug)]
pub(crate) struct Entry {
    pub stamp: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Builds a complete `[len][payload][crc]` frame.
pub(crate) fn encode_frame(stamp: u64, key: &[u8], value: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::with_capacity(8 + 2 * U32_SIZE + key.len() + value.len());
    stamp.encode_to(&mut payload)?;
    key.encode_to(&mut payload)?;
    value.encode_to(&mut payload)?;

    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::Corrupt(format!("record of {} bytes", payload.len())))?;
    let len_bytes = len.to_le_bytes();
    let crc = checksum(&[&len_bytes, &payload]);

    let mut frame = Vec::with_capacity(payload.len() + 2 * U32_SIZE);
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Verifies and decodes one frame that spans all of `frame`.
pub(crate) fn decode_frame(frame: &[u8]) -> Result<Entry, StoreError> {
    let (len, _) = u32::decode_from(frame)?;
    let end = U32_SIZE + len as usize;
    if frame.len() != end + U32_SIZE {
        return Err(StoreError::Corrupt(format!(
            "frame length {} does not match header length {len}",
            frame.len()
        )));
    }
    let payload = &frame[U32_SIZE..end];
    let (stored, _) = u32::decode_from(&frame[end..])?;
    if stored != checksum(&[&frame[..U32_SIZE], payload]) {
        return Err(StoreError::Corrupt("record checksum mismatch".into()));
    }

    let (stamp, n1) = u64::decode_from(payload)?;
    let (key, n2) = Vec::<u8>::decode_from(&payload[n1..])?;
    let (value, n3) = Vec::<u8>::decode_from(&payload[n1 + n2..])?;
    if n1 + n2 + n3 != payload.len() {
        return Err(StoreError::Corrupt("trailing bytes in record payload".into()));
    }
    Ok(Entry { stamp, key, value })
}

fn encode_header(file_id: u32) -> Result<Vec<u8>, StoreError> {
    let mut buf = encoding::encode_to_vec(&MAGIC)?;
    VERSION.encode_to(&mut buf)?;
    file_id.encode_to(&mut buf)?;
    let crc = checksum(&[&buf]);
    crc.encode_to(&mut buf)?;
    Ok(buf)
}

fn check_header(buf: &[u8], expected_id: u32) -> Result<(), StoreError> {
    if (buf.len() as u64) < HEADER_LEN {
        return Err(StoreError::Corrupt("truncated data file header".into()));
    }
    let body = &buf[..12];
    let (stored, _) = u32::decode_from(&buf[12..])?;
    if stored != checksum(&[body]) {
        return Err(StoreError::Corrupt("header checksum mismatch".into()));
    }
    let (magic, _) = <[u8; 4]>::decode_from(body)?;
    if magic != MAGIC {
        return Err(StoreError::Corrupt("bad magic".into()));
    }
    let (version, _) = u32::decode_from(&body[4..])?;
    if version != VERSION {
        return Err(StoreError::Corrupt(format!("unsupported version {version}")));
    }
    let (file_id, _) = u32::decode_from(&body[8..])?;
    if file_id != expected_id {
        return Err(StoreError::Corrupt(format!(
            "header names file {file_id}, file name says {expected_id}"
        )));
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// DataFile
// ------------------------------------------------------------------------------------------------

/// Position of one intact record found by [`DataFile::scan`].
#[derive(Debug)]
pub(crate) struct Scanned {
    pub stamp: u64,
    pub key: Vec<u8>,
    pub offset: u64,
    pub len: u32,
}

/// One data file. Shared through `Arc`; the file is unlinked when the last
/// reference to a [retired](DataFile::retire) file goes away.
#[derive(Debug)]
pub(crate) struct DataFile {
    id: u32,
    path: PathBuf,
    file: File,
    len: AtomicU64,
    retired: AtomicBool,
}

impl DataFile {
    /// Creates a brand-new file with a fresh header.
    pub fn create(dir: &Path, id: u32) -> Result<Self, StoreError> {
        let path = dir.join(file_name(id));
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .append(true)
            .open(&path)?;
        file.write_all(&encode_header(id)?)?;
        file.sync_all()?;

        debug!(path = %path.display(), "created data file");
        Ok(Self {
            id,
            path,
            file,
            len: AtomicU64::new(HEADER_LEN),
            retired: AtomicBool::new(false),
        })
    }

    /// Opens an existing file for reading and validates its header.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_file_id)
            .ok_or_else(|| StoreError::Corrupt(format!("bad data file name {}", path.display())))?;
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len();

        let mut header = [0u8; HEADER_LEN as usize];
        if len < HEADER_LEN {
            return Err(StoreError::Corrupt(format!(
                "{} is shorter than its header",
                path.display()
            )));
        }
        file.read_exact_at(&mut header, 0)?;
        check_header(&header, id)?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
            len: AtomicU64::new(len),
            retired: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> String {
        file_name(self.id)
    }

    /// Current length in bytes, header included.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Appends a pre-built frame and returns its offset.
    ///
    /// Callers serialize appends to the same file.
    pub fn append_frame(&self, frame: &[u8]) -> Result<u64, StoreError> {
        let offset = self.len();
        if let Err(e) = (&self.file).write_all(frame) {
            // Resynchronise with whatever actually reached the file.
            if let Ok(meta) = self.file.metadata() {
                self.len.store(meta.len(), Ordering::Release);
            }
            return Err(e.into());
        }
        self.len
            .store(offset + frame.len() as u64, Ordering::Release);
        trace!(file = self.id, offset, len = frame.len(), "appended frame");
        Ok(offset)
    }

    /// Reads the raw frame at `offset`, verifying its checksum.
    pub fn read_frame(&self, offset: u64, len: u32) -> Result<Vec<u8>, StoreError> {
        let mut frame = vec![0u8; len as usize];
        self.file.read_exact_at(&mut frame, offset)?;
        decode_frame(&frame)?;
        Ok(frame)
    }

    /// Reads and decodes the record at `offset`.
    pub fn read_entry(&self, offset: u64, len: u32) -> Result<Entry, StoreError> {
        let mut frame = vec![0u8; len as usize];
        self.file.read_exact_at(&mut frame, offset)?;
        decode_frame(&frame)
    }

    /// Walks every intact record. A torn or corrupt tail ends the walk with
    /// a warning rather than an error.
    pub fn scan(&self) -> Result<Vec<Scanned>, StoreError> {
        let buf = fs::read(&self.path)?;
        let mut out = Vec::new();
        let mut pos = HEADER_LEN as usize;

        while pos < buf.len() {
            let rest = &buf[pos..];
            if rest.len() < MIN_FRAME_LEN {
                warn!(file = %self.path.display(), pos, "torn record at end of data file");
                break;
            }
            let (len, _) = u32::decode_from(rest)?;
            let frame_len = 2 * U32_SIZE + len as usize;
            if rest.len() < frame_len {
                warn!(file = %self.path.display(), pos, "truncated record at end of data file");
                break;
            }
            let entry = match decode_frame(&rest[..frame_len]) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(file = %self.path.display(), pos, error = %e, "stopping scan at corrupt record");
                    break;
                }
            };
            out.push(Scanned {
                stamp: entry.stamp,
                key: entry.key,
                offset: pos as u64,
                len: frame_len as u32,
            });
            pos += frame_len;
        }
        Ok(out)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Marks the file for deletion once the last reference is dropped.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        if self.retired.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "removed merged data file"),
                Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove merged data file"),
            }
        }
    }
}
