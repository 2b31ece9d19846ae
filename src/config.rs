//! # Options and configuration file
//!
//! [`Options`] is the immutable snapshot every operation receives. It can be built in
//! code, or loaded once from a JSON file (by default `~/.filespacer/config.json`).
//! Unknown keys in the file are ignored and missing keys take their defaults.

use crate::common::DEFAULT_LEVEL;
use crate::error::{IoContext, Result, SpacerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024; // 16 MiB
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// How the ZIP extractor treats the central directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZipMode {
    /// Use the central directory when it validates, otherwise scan local headers.
    #[default]
    Auto,
    /// Use the central directory only; an invalid directory fails the operation.
    Strict,
    /// Ignore the central directory and rebuild entries from local headers.
    Recovery,
}

/// Holds all configuration options for an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Default Zstandard level (1-22) when the caller does not pass one.
    pub compression_level: i32,
    /// Bytes read per pipeline step; bounds peak memory.
    pub chunk_size: usize,
    /// Verify sidecar digests and ZIP CRCs.
    pub verify_integrity: bool,
    /// Size of the worker pool and of the codec's own thread pool.
    pub parallel_threads: usize,
    /// Glob patterns applied by folder compression and ZIP extraction.
    pub exclude_patterns: Vec<String>,
    /// Replace existing destinations instead of failing with `AlreadyExists`.
    pub overwrite: bool,
    /// Write `<archive>.sha256` after compressing.
    pub write_sidecar: bool,
    pub zip_mode: ZipMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_LEVEL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify_integrity: true,
            parallel_threads: num_cpus::get(),
            exclude_patterns: Vec::new(),
            overwrite: false,
            write_sidecar: true,
            zip_mode: ZipMode::Auto,
        }
    }
}

impl Options {
    /// Checks value ranges. The compression level is checked by the operations that
    /// use it, so an out-of-range default only fails when it is actually needed.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(SpacerError::InvalidOptions(format!(
                "chunk_size {} is outside {}..={}",
                self.chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        if self.parallel_threads == 0 {
            return Err(SpacerError::InvalidOptions(
                "parallel_threads must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parses options from JSON text.
    pub fn from_json(text: &str, origin: &Path) -> Result<Self> {
        serde_json::from_str(text).map_err(|source| SpacerError::Config {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Loads options from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).at(path)?;
        Self::from_json(&text, path)
    }

    /// Loads the per-user configuration, falling back to defaults when the file is absent
    /// or unreadable. Problems with the implicit file are logged rather than returned.
    pub fn load_default() -> Self {
        let Some(path) = default_config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(options) => options,
            Err(e) => {
                tracing::warn!("using built-in defaults: {e}");
                Self::default()
            }
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|source| SpacerError::Config {
            path: PathBuf::new(),
            source,
        })
    }
}

/// `~/.filespacer/config.json`, when a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"))?;
    Some(PathBuf::from(home).join(".filespacer").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults_and_unknown_fields_are_ignored() {
        let opts = Options::from_json(
            r#"{"compression_level": 9, "gui_theme": "dark", "zip_mode": "recovery"}"#,
            Path::new("inline"),
        )
        .unwrap();
        assert_eq!(opts.compression_level, 9);
        assert_eq!(opts.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(opts.verify_integrity);
        assert_eq!(opts.zip_mode, ZipMode::Recovery);
        assert!(opts.parallel_threads >= 1);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = Options::from_json("{not json", Path::new("bad.json")).unwrap_err();
        assert!(matches!(err, SpacerError::Config { .. }));
    }

    #[test]
    fn chunk_size_is_bounded() {
        let mut opts = Options::default();
        assert!(opts.validate().is_ok());
        opts.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(matches!(opts.validate(), Err(SpacerError::InvalidOptions(_))));
        opts.chunk_size = MAX_CHUNK_SIZE;
        assert!(opts.validate().is_ok());
        opts.parallel_threads = 0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn pretty_json_round_trips() {
        let opts = Options {
            exclude_patterns: vec!["*.tmp".into()],
            ..Options::default()
        };
        let text = opts.to_json_pretty().unwrap();
        assert_eq!(Options::from_json(&text, Path::new("x")).unwrap(), opts);
    }
}
