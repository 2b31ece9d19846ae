//! # filespacer Core Library
//!
//! Streaming Zstandard compression of files and folders with SHA-256 integrity sidecars,
//! and a ZIP extractor that handles ZipCrypto passwords and damaged central directories.
//!
//! The `filespacer` command-line application is a thin layer over the [`ops`] module,
//! which is also the entry point for programmatic use.
//!
//! ## Key Modules
//!
//! - [`ops`]: The user-facing operations (compress, decompress, extract, list).
//! - [`compress`]: Chunked zstd streams with bounded memory.
//! - [`archive`]: The folder container format; [`extract`] restores it to disk.
//! - [`zip`]: Central-directory parsing, the recovery scan and ZipCrypto.
//! - [`workers`]: The worker pool and the ordered prefetch pipeline.
//! - [`pattern`], [`sanitize`], [`hash`]: exclusion globs, path safety and digests.
//!
//! ## Examples
//!
//! ```no_run
//! use filespacer::{ops, Hooks, Options};
//! use std::path::Path;
//!
//! let options = Options::default();
//! let stats = ops::compress_file(
//!     Path::new("report.csv"),
//!     Path::new("report.csv.zst"),
//!     9,
//!     &options,
//!     &Hooks::new(),
//! )?;
//! println!("ratio {:.2}", stats.compression_ratio);
//! # Ok::<(), filespacer::SpacerError>(())
//! ```

pub mod archive;
pub mod cli;
pub mod cli_runner;
pub mod common;
pub mod compress;
pub mod config;
pub mod error;
pub mod extract;
pub mod hash;
pub mod ops;
pub mod pattern;
pub mod progress;
pub mod sanitize;
pub mod workers;
pub mod zip;

// Cross-platform filesystem wrapper
pub mod fsx;

pub use common::{CompressionLevel, CompressionStats, DecompressionReport, Verification};
pub use config::{Options, ZipMode};
pub use error::{Result, SpacerError};
pub use progress::{CancelFlag, Hooks};
pub use zip::ExtractSummary;
