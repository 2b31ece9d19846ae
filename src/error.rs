use std::path::PathBuf;

/// The primary error type for all operations in the `filespacer` crate.
///
/// Whole-operation failures abort the running operation after staged output has been
/// removed. Per-entry failures of a ZIP extraction are collected in the
/// [`ExtractSummary`](crate::zip::ExtractSummary) instead of being returned.
#[derive(Debug, thiserror::Error)]
pub enum SpacerError {
    /// The source file or directory does not exist.
    #[error("'{path}' does not exist")]
    NotFound { path: PathBuf },

    /// The compression level is outside the supported `1..=22` range.
    #[error("invalid compression level {level}: expected a value between 1 and 22")]
    InvalidLevel { level: i32 },

    /// The destination exists and overwriting was not requested.
    #[error("'{path}' already exists (use overwrite to replace it)")]
    AlreadyExists { path: PathBuf },

    /// Nothing is left to archive after exclusions were applied.
    #[error("nothing to compress in '{path}' after applying exclusions")]
    EmptySource { path: PathBuf },

    /// The compressed stream is not a valid zstd stream.
    #[error("malformed compressed stream at byte {offset}: {reason}")]
    Decode { offset: u64, reason: String },

    /// The compressed stream ended in the middle of a frame.
    #[error("compressed stream truncated at byte {offset}")]
    TruncatedStream { offset: u64 },

    /// The recomputed digest does not match the sidecar digest.
    #[error("integrity check failed: expected sha256 {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// An entry path would resolve outside of the output root.
    #[error("entry '{entry}' escapes the output directory")]
    PathTraversal { entry: String },

    /// Missing or wrong password for an encrypted ZIP entry.
    #[error("wrong or missing password for '{entry}'")]
    Authentication { entry: String },

    /// The operation observed its cancellation flag.
    #[error("operation cancelled")]
    Cancelled,

    /// The ZIP file has no usable central directory and no recoverable local headers.
    #[error("'{path}' is not a recoverable ZIP archive: {reason}")]
    StructuralCorruption { path: PathBuf, reason: String },

    /// The folder container's entry table is malformed.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// The ZIP entry uses a compression method or encryption scheme that cannot be read.
    #[error("'{entry}' uses unsupported {what}")]
    UnsupportedMethod { entry: String, what: String },

    /// The ZIP entry payload failed to decode or did not match its checksum.
    #[error("'{entry}' is corrupt: {reason}")]
    EntryCorrupt { entry: String, reason: String },

    /// `update` or `finalize` was called on a digest that was already finalized.
    #[error("hash accumulator already finalized")]
    HashFinalized,

    /// An option value is out of range.
    #[error("invalid option: {0}")]
    InvalidOptions(String),

    /// The configuration file could not be parsed.
    #[error("cannot load configuration '{path}': {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened (empty when unknown).
    #[error("I/O error on path '{}': {source}", .path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, SpacerError>;

impl SpacerError {
    /// Wraps an I/O error together with the path it happened on.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SpacerError::Io {
            source,
            path: path.into(),
        }
    }

    /// Wraps an I/O error, first recovering a `SpacerError` that a reader adapter tunnelled
    /// through the `io::Error` (see [`DecodeReader`](crate::compress::DecodeReader)).
    pub fn from_io(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let carries_ours = err
            .get_ref()
            .is_some_and(|inner| inner.is::<SpacerError>());
        if !carries_ours {
            return SpacerError::io(err, path);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<SpacerError>()) {
            Some(Ok(ours)) => *ours,
            Some(Err(other)) => SpacerError::io(std::io::Error::new(kind, other), path),
            None => SpacerError::io(std::io::Error::from(kind), path),
        }
    }
}

// Generic IO error conversion that doesn't require a path
impl From<std::io::Error> for SpacerError {
    fn from(err: std::io::Error) -> Self {
        SpacerError::from_io(err, PathBuf::new())
    }
}

/// Attaches a path to a bare `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| SpacerError::from_io(e, path))
    }
}
