//! # ZIP Extraction
//!
//! Reads legacy ZIP archives, optionally protected with traditional PKWARE encryption,
//! and salvages what it can from archives whose central directory is damaged.
//!
//! ## Key Features:
//! - **Strict parsing**: the central directory is located through the end record (and
//!   its ZIP64 counterparts) and validated against the file before it is trusted.
//! - **Recovery scan**: when the directory is unusable, entries are rebuilt from local
//!   file headers with best-effort payload delimiting.
//! - **Methods**: stored, deflate and Zstandard payloads; ZipCrypto decryption.
//!
//! The archive is memory-mapped; nothing in this module writes ZIP files.

pub mod crypto;
pub mod extractor;
pub mod parser;
pub mod recovery;
pub mod structures;

#[cfg(test)]
pub(crate) mod testutil;

pub use extractor::{
    extract_entries, ExtractSettings, ExtractSummary, ExtractedEntry, FailedEntry, ParseMode,
};
pub use structures::{CompressionMethod, EntrySource, ZipEntry};

use crate::config::ZipMode;
use crate::error::{Result, SpacerError};
use std::path::Path;

/// Produces the entry list for `data` according to `mode`.
///
/// `Auto` falls back to the recovery scan when the central directory does not validate.
/// The operation fails with `StructuralCorruption` only when neither path finds an entry
/// (`Strict`: when the directory is invalid).
pub fn load_entries(data: &[u8], mode: ZipMode, path: &Path) -> Result<(Vec<ZipEntry>, ParseMode)> {
    let corruption = |reason: String| SpacerError::StructuralCorruption {
        path: path.to_path_buf(),
        reason,
    };

    let reason = match mode {
        ZipMode::Recovery => "recovery scan requested".to_string(),
        ZipMode::Strict => {
            let entries = parser::read_central_directory(data).map_err(corruption)?;
            return Ok((entries, ParseMode::CentralDirectory));
        }
        ZipMode::Auto => match parser::read_central_directory(data) {
            Ok(entries) => return Ok((entries, ParseMode::CentralDirectory)),
            Err(reason) => {
                tracing::warn!(
                    "central directory of {} is unusable ({}); scanning local headers",
                    path.display(),
                    reason
                );
                reason
            }
        },
    };

    let entries = recovery::scan_local_headers(data);
    if entries.is_empty() {
        return Err(corruption(format!("{reason}; no local file headers found")));
    }
    tracing::info!("recovered {} entries from local headers", entries.len());
    Ok((entries, ParseMode::Recovery { reason }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutil::{wipe_central_directory, ZipBuilder};

    #[test]
    fn auto_mode_falls_back_to_recovery() {
        let mut zip = ZipBuilder::new().stored("a", b"1").finish();
        let (_, mode) = load_entries(&zip, ZipMode::Auto, Path::new("t.zip")).unwrap();
        assert_eq!(mode, ParseMode::CentralDirectory);

        wipe_central_directory(&mut zip);
        let (entries, mode) = load_entries(&zip, ZipMode::Auto, Path::new("t.zip")).unwrap();
        assert!(mode.is_recovery());
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn strict_mode_refuses_a_damaged_directory() {
        let mut zip = ZipBuilder::new().stored("a", b"1").finish();
        wipe_central_directory(&mut zip);
        assert!(matches!(
            load_entries(&zip, ZipMode::Strict, Path::new("t.zip")),
            Err(SpacerError::StructuralCorruption { .. })
        ));
    }

    #[test]
    fn recovery_mode_skips_a_valid_directory() {
        let zip = ZipBuilder::new().stored("a", b"1").stored("b", b"2").finish();
        let (entries, mode) = load_entries(&zip, ZipMode::Recovery, Path::new("t.zip")).unwrap();
        assert!(mode.is_recovery());
        assert!(entries.iter().all(|e| e.source == EntrySource::Recovered));
    }

    #[test]
    fn unrecoverable_input_is_structural_corruption() {
        let err = load_entries(b"definitely not a zip file", ZipMode::Auto, Path::new("x")).unwrap_err();
        assert!(matches!(err, SpacerError::StructuralCorruption { .. }));
    }
}
