//! # Container Unpacking
//!
//! Restores a directory tree from the uncompressed bytes of a folder container. Every
//! entry name goes through [`sanitize::resolve`] before anything touches the disk.

use crate::archive;
use crate::common::ArchiveEntry;
use crate::compress::read_chunk;
use crate::error::{IoContext, Result, SpacerError};
use crate::fsx;
use crate::progress::ProgressTracker;
use crate::sanitize;

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Unpacks the container read from `container` into `root`.
///
/// `root` is normally a staging directory; the caller renames it into place once this
/// returns. Directory modes are applied last so a read-only directory does not block its
/// own children. Returns the number of entries restored.
///
/// # Arguments
/// * `container` - Uncompressed container stream, positioned at the magic.
/// * `root` - Existing directory to restore into.
/// * `chunk_size` - Copy buffer size.
/// * `tracker` - Receives payload bytes as they are written; checked between chunks.
pub fn unpack_container<R: Read>(
    container: &mut R,
    root: &Path,
    chunk_size: usize,
    tracker: &ProgressTracker,
) -> Result<u64> {
    let entries = archive::read_table(container)?;
    tracing::debug!("container holds {} entries", entries.len());

    let mut buf = vec![0u8; chunk_size];
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

    for entry in &entries {
        tracker.check_cancelled()?;
        let target = sanitize::resolve(root, &entry.path)?;
        if entry.is_dir {
            fs::create_dir_all(&target).at(&target)?;
            if let Some(mode) = entry.mode {
                dir_modes.push((target, mode));
            }
            continue;
        }
        restore_file(container, entry, &target, &mut buf, tracker)?;
        tracker.record_file();
    }

    let mut trailing = [0u8; 1];
    if read_chunk(container, &mut trailing)? != 0 {
        return Err(SpacerError::InvalidArchive(
            "unexpected bytes after the last payload".into(),
        ));
    }

    for (path, mode) in dir_modes.iter().rev() {
        fsx::set_unix_permissions(path, *mode).at(path)?;
    }
    Ok(entries.len() as u64)
}

fn restore_file<R: Read>(
    container: &mut R,
    entry: &ArchiveEntry,
    target: &Path,
    buf: &mut [u8],
    tracker: &ProgressTracker,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let file = File::create(target).at(target)?;
    let mut out = BufWriter::new(file);

    let mut remaining = entry.size;
    while remaining > 0 {
        tracker.check_cancelled()?;
        let want = remaining.min(buf.len() as u64) as usize;
        let n = read_chunk(container, &mut buf[..want])?;
        if n == 0 {
            return Err(SpacerError::InvalidArchive(format!(
                "payload of '{}' ends {} bytes early",
                entry.path, remaining
            )));
        }
        out.write_all(&buf[..n]).at(target)?;
        remaining -= n as u64;
        tracker.advance(n as u64);
    }
    out.flush().at(target)?;
    drop(out);

    if let Some(mode) = entry.mode {
        fsx::set_unix_permissions(target, mode).at(target)?;
    }
    Ok(())
}
