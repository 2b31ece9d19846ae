//! Common utilities and types module.
// Shared structs, result records and constants.

use crate::error::{Result, SpacerError};
use serde::Serialize;
use std::time::Duration;

pub const MIN_LEVEL: i32 = 1;
pub const MAX_LEVEL: i32 = 22;
pub const DEFAULT_LEVEL: i32 = 3;

/// A validated Zstandard compression level.
///
/// The level is handed to the codec exactly as given; values outside `1..=22`
/// are rejected instead of clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompressionLevel(i32);

impl CompressionLevel {
    pub fn new(level: i32) -> Result<Self> {
        if (MIN_LEVEL..=MAX_LEVEL).contains(&level) {
            Ok(Self(level))
        } else {
            Err(SpacerError::InvalidLevel { level })
        }
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(DEFAULT_LEVEL)
    }
}

/// Metadata for a single file or directory entry within a folder archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// POSIX-style relative path, never absolute, never containing `..`.
    pub path: String,
    /// Payload length in bytes (0 for directories).
    pub size: u64,
    pub is_dir: bool,
    /// Unix permission bits, when the source platform had them.
    pub mode: Option<u32>,
    /// Offset of the payload inside the uncompressed container stream.
    pub offset: u64,
}

/// Statistics for a finished compression operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionStats {
    pub original_size: u64,
    pub compressed_size: u64,
    /// `original / compressed`, or 0 when nothing was written.
    pub compression_ratio: f64,
    pub elapsed: Duration,
    /// Lowercase SHA-256 hex of the uncompressed stream.
    pub digest: String,
    pub files_processed: u64,
}

impl CompressionStats {
    pub fn new(
        original_size: u64,
        compressed_size: u64,
        elapsed: Duration,
        digest: String,
        files_processed: u64,
    ) -> Self {
        let compression_ratio = if compressed_size == 0 {
            0.0
        } else {
            original_size as f64 / compressed_size as f64
        };
        Self {
            original_size,
            compressed_size,
            compression_ratio,
            elapsed,
            digest,
            files_processed,
        }
    }

    /// Throughput in MiB/s over the uncompressed bytes.
    pub fn speed_mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.original_size as f64 / (1024.0 * 1024.0) / secs
        } else {
            0.0
        }
    }
}

/// Outcome of the integrity check performed while decompressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Verification {
    /// The digest matched the sidecar.
    Verified,
    /// Verification was requested but no usable sidecar was found.
    MissingSidecar,
    /// Verification was not requested.
    Skipped,
}

/// Result of a decompress operation.
#[derive(Debug, Clone, Serialize)]
pub struct DecompressionReport {
    pub compressed_size: u64,
    pub decompressed_size: u64,
    /// True when the stream held a folder container and a directory tree was restored.
    pub is_folder: bool,
    pub entries_restored: u64,
    pub verification: Verification,
    pub elapsed: Duration,
}
