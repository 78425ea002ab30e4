//! Append-only changelog backing the in-memory services.
//!
//! ```text
//! "NSMDLOG1"
//! kind u8 | len u32 (LE) | crc32 u32 (LE) | payload[len]
//! kind u8 | len u32 (LE) | crc32 u32 (LE) | payload[len]
//! ...
//! ```
//!
//! The checksum covers the kind, the length and the payload.
//!
//! | kind | payload |
//! |------|---------|
//! | 1 | one entity record produced by [`BinaryCodec`](crate::BinaryCodec) |
//! | 2 | id of an erased entity, `u64` LE |
//!
//! Replay keeps every complete record in file order. A final record cut short
//! by a crash, or whose checksum does not match, is dropped and the file is
//! truncated back to the last good record before new records are appended.
//! A checksum mismatch before the final record is reported as corruption.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{Buffer, BufferReader};
use crate::NsError;

/// File magic of a changelog.
pub const MAGIC: &[u8; 8] = b"NSMDLOG1";

const KIND_UPDATE: u8 = 1;
const KIND_DELETE: u8 = 2;
const HEADER_LEN: usize = 9;

/// One replayed changelog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Encoded entity.
    Update(Vec<u8>),
    /// Erased entity id.
    Delete(u64),
}

/// An open changelog file.
#[derive(Debug)]
pub struct Changelog {
    path: PathBuf,
    file: Mutex<File>,
}

impl Changelog {
    /// Open (or create) the changelog at `path` and return it together with
    /// every complete record it holds.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<LogRecord>), NsError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| io_error("open changelog", &path, e))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| io_error("read changelog", &path, e))?;

        let records = if data.is_empty() {
            file.write_all(MAGIC)
                .map_err(|e| io_error("write changelog", &path, e))?;
            Vec::new()
        } else {
            let (records, good_len) = parse(&data)?;
            if good_len < data.len() {
                warn!(
                    path = %path.display(),
                    dropped = data.len() - good_len,
                    "changelog ends with a torn record, truncating"
                );
                file.set_len(good_len as u64)
                    .map_err(|e| io_error("truncate changelog", &path, e))?;
            }
            records
        };

        debug!(path = %path.display(), records = records.len(), "changelog opened");
        Ok((
            Self {
                path,
                file: Mutex::new(file),
            },
            records,
        ))
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an update record.
    pub fn append_update(&self, record: &[u8]) -> Result<(), NsError> {
        self.append(KIND_UPDATE, record)
    }

    /// Append a delete record.
    pub fn append_delete(&self, id: u64) -> Result<(), NsError> {
        self.append(KIND_DELETE, &id.to_le_bytes())
    }

    /// Flush written records to stable storage.
    pub fn sync(&self) -> Result<(), NsError> {
        self.file
            .lock()
            .sync_data()
            .map_err(|e| io_error("sync changelog", &self.path, e))
    }

    fn append(&self, kind: u8, payload: &[u8]) -> Result<(), NsError> {
        let len = u32::try_from(payload.len()).map_err(|_| NsError::InvalidArgument {
            operation: "append changelog",
            reason: format!("record of {} bytes is too large", payload.len()),
        })?;
        let mut buffer = Buffer::with_capacity(HEADER_LEN + payload.len());
        buffer.put_u8(kind);
        buffer.put_u32(len);
        buffer.put_u32(checksum(kind, len, payload));
        buffer.put_bytes(payload);
        // One write per record.
        self.file
            .lock()
            .write_all(&buffer.into_vec())
            .map_err(|e| io_error("append changelog", &self.path, e))
    }
}

/// Parse a whole changelog image. Returns the complete records and the byte
/// length they span (magic included).
fn parse(data: &[u8]) -> Result<(Vec<LogRecord>, usize), NsError> {
    if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
        return Err(NsError::corrupted("changelog magic mismatch"));
    }
    let mut reader = BufferReader::new(&data[MAGIC.len()..]);
    let mut records = Vec::new();
    let mut good_len = MAGIC.len();

    while reader.remaining() >= HEADER_LEN {
        let kind = reader.grab_u8()?;
        let raw_len = reader.grab_u32()?;
        let crc = reader.grab_u32()?;
        let len = raw_len as usize;
        if reader.remaining() < len {
            break;
        }
        let payload = reader.grab_bytes(len)?;
        if checksum(kind, raw_len, payload) != crc {
            if reader.remaining() == 0 {
                break;
            }
            return Err(NsError::corrupted(format!(
                "changelog record at offset {good_len} fails its checksum"
            )));
        }
        let record = match kind {
            KIND_UPDATE => LogRecord::Update(payload.to_vec()),
            KIND_DELETE => {
                let id = BufferReader::new(payload).grab_u64()?;
                LogRecord::Delete(id)
            }
            other => {
                return Err(NsError::corrupted(format!(
                    "unknown changelog record kind {other} at offset {good_len}"
                )));
            }
        };
        records.push(record);
        good_len = MAGIC.len() + reader.offset();
    }
    Ok((records, good_len))
}

fn checksum(kind: u8, len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn io_error(operation: &'static str, path: &Path, error: std::io::Error) -> NsError {
    NsError::Io {
        operation,
        details: format!("{}: {error}", path.display()),
    }
}
