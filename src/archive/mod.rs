//! # Folder Container Format
//!
//! A folder archive is a single zstd stream. Its uncompressed content is an entry table
//! followed by the contents of every regular file, back to back, in table order:
//!
//! ```text
//! magic    8 bytes   "FSPCARv1"
//! count    u32 LE
//! entries  count x { path_len u16 LE, path (UTF-8), size u64 LE, mode u32 LE, flags u8 }
//! payload  file contents, concatenated
//! ```
//!
//! `flags` bit 0 marks a directory, bit 1 marks `mode` as meaningful. Compressing the table
//! and all payloads in one pass lets the codec exploit redundancy across files.

use crate::common::{ArchiveEntry, CompressionLevel};
use crate::compress::{StreamEncoder, StreamSettings, StreamStats};
use crate::error::{Result, SpacerError};
use crate::progress::ProgressTracker;
use crate::sanitize;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::path::Path;

pub const MAGIC_BYTES: &[u8; 8] = b"FSPCARv1";

const FLAG_DIR: u8 = 0b01;
const FLAG_MODE: u8 = 0b10;
/// Fixed part of a table record after the path bytes.
const RECORD_TAIL: usize = 8 + 4 + 1;

/// True when `prefix` starts with the container magic.
pub fn is_container(prefix: &[u8]) -> bool {
    prefix.starts_with(MAGIC_BYTES)
}

/// Length of the encoded table for `entries`.
fn table_len(entries: &[ArchiveEntry]) -> u64 {
    let records: usize = entries
        .iter()
        .map(|e| 2 + e.path.len() + RECORD_TAIL)
        .sum();
    (MAGIC_BYTES.len() + 4 + records) as u64
}

/// Fills in `offset` for every entry: payloads start right after the table.
pub fn assign_offsets(entries: &mut [ArchiveEntry]) {
    let mut offset = table_len(entries);
    for entry in entries.iter_mut() {
        entry.offset = offset;
        if !entry.is_dir {
            offset += entry.size;
        }
    }
}

/// Serializes the entry table.
///
/// # Errors
/// `InvalidArchive` when there are more than `u32::MAX` entries or a path is longer than
/// `u16::MAX` bytes.
pub fn encode_table(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    let count = u32::try_from(entries.len())
        .map_err(|_| SpacerError::InvalidArchive(format!("too many entries ({})", entries.len())))?;
    let mut out = Vec::with_capacity(table_len(entries) as usize);
    out.extend_from_slice(MAGIC_BYTES);
    out.write_u32::<LittleEndian>(count)?;
    for entry in entries {
        let path_len = u16::try_from(entry.path.len()).map_err(|_| {
            SpacerError::InvalidArchive(format!("path too long: '{}'", entry.path))
        })?;
        out.write_u16::<LittleEndian>(path_len)?;
        out.extend_from_slice(entry.path.as_bytes());
        out.write_u64::<LittleEndian>(if entry.is_dir { 0 } else { entry.size })?;
        out.write_u32::<LittleEndian>(entry.mode.unwrap_or(0))?;
        let mut flags = 0u8;
        if entry.is_dir {
            flags |= FLAG_DIR;
        }
        if entry.mode.is_some() {
            flags |= FLAG_MODE;
        }
        out.write_u8(flags)?;
    }
    Ok(out)
}

fn table_error(err: io::Error) -> SpacerError {
    match SpacerError::from(err) {
        SpacerError::Io { source, .. } if source.kind() == io::ErrorKind::UnexpectedEof => {
            SpacerError::InvalidArchive("entry table ends early".into())
        }
        other => other,
    }
}

/// Parses and validates the entry table at the head of an uncompressed container stream.
///
/// Checks the magic, rejects paths that are empty, not normalized or would escape the
/// output root, and rejects duplicates. Payload offsets are filled in.
pub fn read_table<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<ArchiveEntry>> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).map_err(table_error)?;
    if !is_container(&magic) {
        return Err(SpacerError::InvalidArchive("missing container magic".into()));
    }
    let count = reader.read_u32::<LittleEndian>().map_err(table_error)?;

    // The count is untrusted; let the vector grow as records actually parse.
    let mut entries = Vec::with_capacity((count as usize).min(4096));
    let mut seen = HashSet::new();
    for _ in 0..count {
        let path_len = reader.read_u16::<LittleEndian>().map_err(table_error)?;
        let mut raw = vec![0u8; path_len as usize];
        reader.read_exact(&mut raw).map_err(table_error)?;
        let path = String::from_utf8(raw)
            .map_err(|_| SpacerError::InvalidArchive("entry path is not UTF-8".into()))?;
        let size = reader.read_u64::<LittleEndian>().map_err(table_error)?;
        let mode = reader.read_u32::<LittleEndian>().map_err(table_error)?;
        let flags = reader.read_u8().map_err(table_error)?;

        let normalized = sanitize::normalize_entry_string(&path)?;
        if normalized.is_empty() || normalized != path {
            return Err(SpacerError::InvalidArchive(format!(
                "entry path '{path}' is not a normalized relative path"
            )));
        }
        if !seen.insert(path.clone()) {
            return Err(SpacerError::InvalidArchive(format!("duplicate entry '{path}'")));
        }
        let is_dir = flags & FLAG_DIR != 0;
        if is_dir && size != 0 {
            return Err(SpacerError::InvalidArchive(format!(
                "directory '{path}' has a payload"
            )));
        }
        entries.push(ArchiveEntry {
            path,
            size,
            is_dir,
            mode: (flags & FLAG_MODE != 0).then_some(mode),
            offset: 0,
        });
    }
    assign_offsets(&mut entries);
    Ok(entries)
}

/// Writes a folder container into one compression stream.
///
/// The table is written on construction; payloads must then be supplied for every
/// regular-file entry, in table order, each exactly as long as the table says.
pub struct ArchiveWriter<W: Write> {
    stream: StreamEncoder<W>,
    entries: Vec<ArchiveEntry>,
    /// Index of the next entry whose payload is expected.
    cursor: usize,
}

impl<W: Write> ArchiveWriter<W> {
    /// Starts the container stream on `sink` and writes the table for `entries`.
    pub fn new(
        sink: W,
        mut entries: Vec<ArchiveEntry>,
        level: CompressionLevel,
        settings: &StreamSettings,
    ) -> Result<Self> {
        assign_offsets(&mut entries);
        let table = encode_table(&entries)?;
        let mut stream = StreamEncoder::new(sink, level, settings)?;
        stream.write_chunk(&table)?;
        let mut writer = Self {
            stream,
            entries,
            cursor: 0,
        };
        writer.skip_directories();
        Ok(writer)
    }

    fn skip_directories(&mut self) {
        while self.cursor < self.entries.len() && self.entries[self.cursor].is_dir {
            self.cursor += 1;
        }
    }

    /// The entry whose payload is expected next.
    pub fn next_file(&self) -> Option<&ArchiveEntry> {
        self.entries.get(self.cursor)
    }

    fn expect_next(&self, path: &str) -> Result<&ArchiveEntry> {
        match self.next_file() {
            Some(entry) if entry.path == path => Ok(entry),
            Some(entry) => Err(SpacerError::InvalidArchive(format!(
                "payload for '{path}' supplied while '{}' was expected",
                entry.path
            ))),
            None => Err(SpacerError::InvalidArchive(format!(
                "payload for '{path}' supplied after the last entry"
            ))),
        }
    }

    fn size_changed(path: &str, expected: u64, actual: u64) -> SpacerError {
        SpacerError::io(
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file changed size while archiving: expected {expected} bytes, read {actual}"),
            ),
            path,
        )
    }

    /// Writes a payload already held in memory.
    pub fn write_file_bytes(&mut self, path: &str, bytes: &[u8], tracker: &ProgressTracker) -> Result<()> {
        let expected = self.expect_next(path)?.size;
        if bytes.len() as u64 != expected {
            return Err(Self::size_changed(path, expected, bytes.len() as u64));
        }
        self.stream.write_chunk(bytes)?;
        tracker.advance(expected);
        tracker.record_file();
        self.cursor += 1;
        self.skip_directories();
        Ok(())
    }

    /// Streams a payload from `source` through `buf`.
    ///
    /// The source must yield exactly the size recorded in the table; a file that grew or
    /// shrank since it was listed is an I/O error.
    pub fn write_file_from<R: Read>(
        &mut self,
        path: &str,
        source: R,
        buf: &mut [u8],
        tracker: &ProgressTracker,
        origin: &Path,
    ) -> Result<()> {
        let expected = self.expect_next(path)?.size;
        // One byte past the expected size detects growth.
        let mut limited = source.take(expected + 1);
        let copied = self.stream.copy_from(&mut limited, buf, tracker, origin)?;
        if copied != expected {
            return Err(Self::size_changed(path, expected, copied));
        }
        tracker.record_file();
        self.cursor += 1;
        self.skip_directories();
        Ok(())
    }

    /// Ends the stream. Fails if any payload is still missing.
    pub fn finish(self) -> Result<(StreamStats, String, W)> {
        if let Some(entry) = self.next_file() {
            return Err(SpacerError::InvalidArchive(format!(
                "payload for '{}' was never written",
                entry.path
            )));
        }
        self.stream.finish()
    }
}
