//! Incremental SHA-256 digests and the `.sha256` sidecar files that persist them.
//!
//! The digest is only used to detect corruption. It always covers the uncompressed
//! byte stream, so compressing and later decompressing the same data yields the same
//! digest.

use crate::error::{IoContext, Result, SpacerError};
use crate::fsx;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const SIDECAR_SUFFIX: &str = ".sha256";

/// Running SHA-256 state. `finalize` may be called once.
#[derive(Debug, Clone)]
pub struct HashAccumulator {
    state: Option<Sha256>,
}

impl Default for HashAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl HashAccumulator {
    pub fn new() -> Self {
        Self {
            state: Some(Sha256::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) -> Result<()> {
        match self.state.as_mut() {
            Some(state) => {
                state.update(bytes);
                Ok(())
            }
            None => Err(SpacerError::HashFinalized),
        }
    }

    /// Consumes the running state and returns the lowercase hex digest.
    pub fn finalize(&mut self) -> Result<String> {
        let state = self.state.take().ok_or(SpacerError::HashFinalized)?;
        Ok(hex::encode(state.finalize()))
    }

    pub fn is_finalized(&self) -> bool {
        self.state.is_none()
    }
}

/// `<archive>.sha256`: the suffix is appended to the full file name.
pub fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Writes `"<digest>  <source name>\n"` next to `archive`, atomically.
pub fn write_sidecar(archive: &Path, digest: &str, source_name: &str) -> Result<PathBuf> {
    let path = sidecar_path(archive);
    let content = format!("{digest}  {source_name}\n");
    fsx::write_atomic(&path, content.as_bytes(), true)?;
    Ok(path)
}

/// Deletes the sidecar of `archive`. Returns whether one existed.
pub fn remove_sidecar(archive: &Path) -> Result<bool> {
    let path = sidecar_path(archive);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).at(path),
    }
}

/// Reads the digest stored next to `archive`.
///
/// Returns `Ok(None)` when there is no sidecar or its first token is not a SHA-256 hex
/// digest; the latter is logged.
pub fn read_sidecar(archive: &Path) -> Result<Option<String>> {
    let path = sidecar_path(archive);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).at(path),
    };
    match text.split_whitespace().next() {
        Some(token) if is_sha256_hex(token) => Ok(Some(token.to_ascii_lowercase())),
        _ => {
            tracing::warn!("ignoring malformed digest file {}", path.display());
            Ok(None)
        }
    }
}

/// Compares a recomputed digest with the expected one.
pub fn verify(expected: &str, actual: &str) -> Result<()> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(SpacerError::Integrity {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

fn is_sha256_hex(token: &str) -> bool {
    token.len() == 64 && token.bytes().all(|b| b.is_ascii_hexdigit())
}
