//! # Operations
//!
//! The user-facing entry points. Each call takes an [`Options`] snapshot and [`Hooks`],
//! stages its output next to the destination, and renames it into place only on success.
//! The digest sidecar is written after the archive is in place.
//!
//! ## Key Features:
//! - **compress_file / compress_folder**: a single zstd stream, hashed while it is written.
//! - **decompress**: restores a file or, for a folder container, a directory tree, after
//!   checking the digest against the sidecar.
//! - **extract_zip**: strict or recovering ZIP extraction with per-entry failures.
//! - **list_archive / list_zip**: inspection without writing anything.

use crate::archive::{self, ArchiveWriter};
use crate::common::{
    ArchiveEntry, CompressionLevel, CompressionStats, DecompressionReport, Verification,
};
use crate::compress::{self, StreamSettings};
use crate::config::Options;
use crate::error::{IoContext, Result, SpacerError};
use crate::extract;
use crate::fsx;
use crate::hash;
use crate::pattern::ExcludeRules;
use crate::progress::{Hooks, ProgressTracker};
use crate::workers::{self, Payload};
use crate::zip::{self, ExtractSettings, ExtractSummary, ParseMode, ZipEntry};

use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info, warn};

fn require_existing(path: &Path) -> Result<fs::Metadata> {
    fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SpacerError::NotFound {
            path: path.to_path_buf(),
        },
        _ => SpacerError::io(e, path),
    })
}

fn wrong_kind(path: &Path, message: &str) -> SpacerError {
    SpacerError::io(io::Error::new(io::ErrorKind::InvalidInput, message.to_string()), path)
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Exclusion rules from the options plus the per-call patterns.
fn exclusion_rules<S: AsRef<str>>(options: &Options, extra: &[S]) -> Result<ExcludeRules> {
    let patterns: Vec<&str> = options
        .exclude_patterns
        .iter()
        .map(String::as_str)
        .chain(extra.iter().map(AsRef::as_ref))
        .collect();
    ExcludeRules::new(&patterns)
}

fn finish_archive(
    staged: tempfile::NamedTempFile,
    dst: &Path,
    digest: &str,
    source: &Path,
    options: &Options,
) -> Result<()> {
    staged.as_file().sync_all().at(staged.path())?;
    fsx::commit_file(staged, dst, options.overwrite)?;
    if options.write_sidecar {
        let sidecar = hash::write_sidecar(dst, digest, &source_name(source))?;
        debug!("wrote digest to {}", sidecar.display());
    } else if hash::remove_sidecar(dst)? {
        debug!("removed digest left over from the replaced archive");
    }
    Ok(())
}

/// Compresses one file into a zstd stream at `dst`.
///
/// # Arguments
/// * `src` - Regular file to compress.
/// * `dst` - Archive path; must not exist unless `options.overwrite` is set.
/// * `level` - Zstandard level, `1..=22`.
/// * `options` - Chunk size, threads, overwrite and sidecar settings.
/// * `hooks` - Progress callback and cancellation flag.
pub fn compress_file(
    src: &Path,
    dst: &Path,
    level: i32,
    options: &Options,
    hooks: &Hooks,
) -> Result<CompressionStats> {
    options.validate()?;
    let level = CompressionLevel::new(level)?;
    let metadata = require_existing(src)?;
    if !metadata.is_file() {
        return Err(wrong_kind(src, "not a regular file"));
    }
    fsx::check_destination(dst, options.overwrite)?;

    info!(
        "compressing {} -> {} (level {})",
        src.display(),
        dst.display(),
        level.get()
    );
    let tracker = ProgressTracker::new(hooks);
    tracker.set_total(metadata.len());
    let settings = StreamSettings::from_options(options);

    let staged = fsx::stage_file(dst)?;
    let source = File::open(src).at(src)?;
    let (stats, digest) =
        compress::compress_stream(source, staged.as_file(), level, &settings, &tracker, src)?;
    finish_archive(staged, dst, &digest, src, options)?;
    tracker.record_file();

    let result = CompressionStats::new(stats.bytes_in, stats.bytes_out, tracker.elapsed(), digest, 1);
    info!(
        "compressed {} bytes to {} bytes (ratio {:.2})",
        result.original_size, result.compressed_size, result.compression_ratio
    );
    Ok(result)
}

/// Compresses the tree under `src_dir` into a single folder container at `dst`.
///
/// Entries are archived in sorted pre-order; an unchanged tree always produces the same
/// entry table. Patterns in `exclude_patterns` are applied together with
/// `options.exclude_patterns`.
///
/// # Arguments
/// * `src_dir` - Directory to archive; its own name is not stored.
/// * `dst` - Archive path.
/// * `level` - Zstandard level, `1..=22`.
/// * `exclude_patterns` - Additional glob patterns to leave out.
/// * `options` - Chunk size, threads, overwrite and sidecar settings.
/// * `hooks` - Progress callback and cancellation flag.
pub fn compress_folder<S: AsRef<str>>(
    src_dir: &Path,
    dst: &Path,
    level: i32,
    exclude_patterns: &[S],
    options: &Options,
    hooks: &Hooks,
) -> Result<CompressionStats> {
    options.validate()?;
    let level = CompressionLevel::new(level)?;
    if !require_existing(src_dir)?.is_dir() {
        return Err(wrong_kind(src_dir, "not a directory"));
    }
    fsx::check_destination(dst, options.overwrite)?;
    let rules = exclusion_rules(options, exclude_patterns)?;

    let entries = workers::collect_entries(src_dir, &rules)?;
    if entries.is_empty() {
        return Err(SpacerError::EmptySource {
            path: src_dir.to_path_buf(),
        });
    }
    info!(
        "archiving {} entries from {} -> {} (level {})",
        entries.len(),
        src_dir.display(),
        dst.display(),
        level.get()
    );

    let tracker = ProgressTracker::new(hooks);
    tracker.set_total(workers::total_size(&entries));
    let settings = StreamSettings::from_options(options);
    let pool = workers::build_pool(options.parallel_threads)?;

    let staged = fsx::stage_file(dst)?;
    let table: Vec<ArchiveEntry> = entries.iter().map(|s| s.entry.clone()).collect();
    let mut writer = ArchiveWriter::new(staged.as_file(), table, level, &settings)?;
    let mut buf = vec![0u8; options.chunk_size];

    workers::run_prefetch_pipeline(
        &pool,
        &entries,
        options.chunk_size,
        &hooks.cancel,
        |source, payload| {
            let path = source.entry.path.as_str();
            match payload {
                Payload::Directory => Ok(()),
                Payload::Loaded(bytes) => writer.write_file_bytes(path, &bytes, &tracker),
                Payload::Deferred => {
                    debug!("streaming large file {}", source.absolute.display());
                    let file = File::open(&source.absolute).at(&source.absolute)?;
                    writer.write_file_from(path, file, &mut buf, &tracker, &source.absolute)
                }
            }
        },
    )?;

    let (stats, digest, _) = writer.finish()?;
    finish_archive(staged, dst, &digest, src_dir, options)?;

    let result = CompressionStats::new(
        stats.bytes_in,
        stats.bytes_out,
        tracker.elapsed(),
        digest,
        tracker.processed_files(),
    );
    info!(
        "archived {} files, {} bytes to {} bytes (ratio {:.2})",
        result.files_processed, result.original_size, result.compressed_size, result.compression_ratio
    );
    Ok(result)
}

/// Decompresses `src` to `dst`.
///
/// A stream holding a folder container restores a directory tree at `dst`; anything else
/// restores a single file. With `verify`, the digest of the decompressed stream must
/// match the sidecar; a missing sidecar is only a warning.
///
/// # Arguments
/// * `src` - A zstd stream written by [`compress_file`] or [`compress_folder`].
/// * `dst` - Output file or directory.
/// * `verify` - Check the sidecar digest.
/// * `options` - Chunk size and overwrite.
/// * `hooks` - Progress callback and cancellation flag.
pub fn decompress(
    src: &Path,
    dst: &Path,
    verify: bool,
    options: &Options,
    hooks: &Hooks,
) -> Result<DecompressionReport> {
    options.validate()?;
    let metadata = require_existing(src)?;
    if !metadata.is_file() {
        return Err(wrong_kind(src, "not a regular file"));
    }
    fsx::check_destination(dst, options.overwrite)?;

    let expected = if verify {
        let expected = hash::read_sidecar(src)?;
        if expected.is_none() {
            warn!(
                "no digest found at {}; integrity cannot be verified",
                hash::sidecar_path(src).display()
            );
        }
        expected
    } else {
        None
    };

    info!("decompressing {} -> {}", src.display(), dst.display());
    let tracker = ProgressTracker::new(hooks);
    tracker.set_total(metadata.len());
    let settings = StreamSettings::from_options(options);

    let mut staged = fsx::stage_file(dst)?;
    let source = File::open(src).at(src)?;
    let (stats, digest) =
        compress::decompress_stream(source, staged.as_file(), &settings, &tracker, staged.path())?;

    let verification = match (&expected, verify) {
        (Some(expected), _) => {
            hash::verify(expected, &digest)?;
            Verification::Verified
        }
        (None, true) => Verification::MissingSidecar,
        (None, false) => Verification::Skipped,
    };

    let mut prefix = [0u8; archive::MAGIC_BYTES.len()];
    let file = staged.as_file_mut();
    file.seek(SeekFrom::Start(0)).at(src)?;
    let n = compress::read_chunk(file, &mut prefix).at(src)?;

    let (is_folder, entries_restored) = if archive::is_container(&prefix[..n]) {
        file.seek(SeekFrom::Start(0)).at(src)?;
        let staging_dir = fsx::stage_dir(dst)?;
        let unpack_tracker = ProgressTracker::new(&Hooks::new().with_cancel(hooks.cancel.clone()));
        let mut reader = BufReader::new(&*file);
        let restored =
            extract::unpack_container(&mut reader, staging_dir.path(), options.chunk_size, &unpack_tracker)?;
        fsx::commit_dir(staging_dir, dst, options.overwrite)?;
        (true, restored)
    } else {
        staged.as_file().sync_all().at(dst)?;
        fsx::commit_file(staged, dst, options.overwrite)?;
        (false, 1)
    };

    info!(
        "restored {} bytes ({} entries, {:?})",
        stats.bytes_out, entries_restored, verification
    );
    Ok(DecompressionReport {
        compressed_size: stats.bytes_in,
        decompressed_size: stats.bytes_out,
        is_folder,
        entries_restored,
        verification,
        elapsed: tracker.elapsed(),
    })
}

fn map_archive(src: &Path) -> Result<Mmap> {
    let metadata = require_existing(src)?;
    if !metadata.is_file() {
        return Err(wrong_kind(src, "not a regular file"));
    }
    if metadata.len() == 0 {
        return Err(SpacerError::StructuralCorruption {
            path: src.to_path_buf(),
            reason: "file is empty".into(),
        });
    }
    let file = File::open(src).at(src)?;
    // SAFETY: the map is read-only and dropped before the operation returns.
    unsafe { Mmap::map(&file) }.at(src)
}

/// Extracts the ZIP archive `src` into `out_dir`.
///
/// Only structural problems fail the call: an archive with neither a usable central
/// directory nor any recoverable local header, cancellation, or an unusable output
/// location. Entry-level problems are reported in the returned summary.
///
/// # Arguments
/// * `src` - ZIP file.
/// * `out_dir` - Output root; created when missing.
/// * `password` - ZipCrypto password for encrypted entries.
/// * `exclude_patterns` - Glob patterns of entries to skip.
/// * `options` - Parse mode, verification, overwrite, threads.
/// * `hooks` - Progress callback and cancellation flag.
pub fn extract_zip<S: AsRef<str>>(
    src: &Path,
    out_dir: &Path,
    password: Option<&str>,
    exclude_patterns: &[S],
    options: &Options,
    hooks: &Hooks,
) -> Result<ExtractSummary> {
    options.validate()?;
    let rules = exclusion_rules(options, exclude_patterns)?;
    let data = map_archive(src)?;

    let (entries, mode) = zip::load_entries(&data, options.zip_mode, src)?;
    info!(
        "extracting {} entries from {} -> {} ({})",
        entries.len(),
        src.display(),
        out_dir.display(),
        if mode.is_recovery() { "recovery scan" } else { "central directory" }
    );

    let pool = workers::build_pool(options.parallel_threads)?;
    let tracker = ProgressTracker::new(hooks);
    let settings = ExtractSettings {
        password: password.map(str::as_bytes),
        verify: options.verify_integrity,
        overwrite: options.overwrite,
        chunk_size: options.chunk_size,
    };
    let mut summary =
        zip::extract_entries(&data, &entries, mode, out_dir, &rules, &settings, &pool, &tracker)?;
    if let ParseMode::Recovery { reason } = &summary.mode {
        summary
            .warnings
            .insert(0, format!("central directory not used: {reason}"));
    }

    info!(
        "extracted {} entries ({} bytes), {} skipped, {} failed",
        summary.extracted.len(),
        summary.bytes_written(),
        summary.skipped.len(),
        summary.failed.len()
    );
    Ok(summary)
}

/// What [`list_archive`] found.
#[derive(Debug, Clone)]
pub struct ArchiveListing {
    pub compressed_size: u64,
    /// Digest from the sidecar, if one is present and well-formed.
    pub sidecar_digest: Option<String>,
    pub is_folder: bool,
    /// Container entries; empty for a single-file stream.
    pub entries: Vec<ArchiveEntry>,
}

/// Describes a compressed file without decompressing more than its entry table.
pub fn list_archive(src: &Path) -> Result<ArchiveListing> {
    let metadata = require_existing(src)?;
    let mut reader = compress::open_decoder(File::open(src).at(src)?)?;
    let mut prefix = [0u8; archive::MAGIC_BYTES.len()];
    let n = reader.read_chunk(&mut prefix)?;

    let entries = if archive::is_container(&prefix[..n]) {
        let mut head = io::Cursor::new(prefix).chain(&mut reader);
        archive::read_table(&mut head)?
    } else {
        Vec::new()
    };
    Ok(ArchiveListing {
        compressed_size: metadata.len(),
        sidecar_digest: hash::read_sidecar(src)?,
        is_folder: archive::is_container(&prefix[..n]),
        entries,
    })
}

/// What [`list_zip`] found.
#[derive(Debug, Clone)]
pub struct ZipListing {
    pub mode: ParseMode,
    pub entries: Vec<ZipEntry>,
}

/// Lists the entries of a ZIP archive using the parse path `options.zip_mode` selects.
pub fn list_zip(src: &Path, options: &Options) -> Result<ZipListing> {
    let data = map_archive(src)?;
    let (entries, mode) = zip::load_entries(&data, options.zip_mode, src)?;
    Ok(ZipListing { mode, entries })
}

/// True when `path` starts like a ZIP archive.
pub fn looks_like_zip(path: &Path) -> Result<bool> {
    let mut file = File::open(path).at(path)?;
    let mut magic = [0u8; 4];
    let n = compress::read_chunk(&mut file, &mut magic).at(path)?;
    Ok(n == 4 && (&magic == b"PK\x03\x04" || &magic == b"PK\x05\x06"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CancelFlag;
    use tempfile::tempdir;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn options() -> Options {
        Options {
            parallel_threads: 2,
            chunk_size: 8 * 1024,
            ..Options::default()
        }
    }

    #[test]
    fn file_round_trip_with_sidecar() -> TestResult {
        let dir = tempdir()?;
        let src = dir.path().join("data.txt");
        let data = b"lorem ipsum dolor sit amet ".repeat(2000);
        fs::write(&src, &data)?;

        let archive = dir.path().join("data.txt.zst");
        let stats = compress_file(&src, &archive, 5, &options(), &Hooks::new())?;
        assert_eq!(stats.original_size, data.len() as u64);
        assert!(stats.compressed_size < stats.original_size);
        assert_eq!(hash::read_sidecar(&archive)?, Some(stats.digest.clone()));

        let out = dir.path().join("restored.txt");
        let report = decompress(&archive, &out, true, &options(), &Hooks::new())?;
        assert_eq!(report.verification, Verification::Verified);
        assert!(!report.is_folder);
        assert_eq!(fs::read(&out)?, data);
        Ok(())
    }

    #[test]
    fn corrupted_sidecar_digest_fails_and_leaves_nothing() -> TestResult {
        let dir = tempdir()?;
        let src = dir.path().join("a.bin");
        fs::write(&src, b"payload")?;
        let archive = dir.path().join("a.zst");
        compress_file(&src, &archive, 3, &options(), &Hooks::new())?;
        fs::write(hash::sidecar_path(&archive), format!("{}  a.bin\n", "0".repeat(64)))?;

        let out = dir.path().join("out.bin");
        let err = decompress(&archive, &out, true, &options(), &Hooks::new()).unwrap_err();
        assert!(matches!(err, SpacerError::Integrity { .. }));
        assert!(!out.exists());
        assert_eq!(fs::read_dir(dir.path())?.count(), 3);
        Ok(())
    }

    #[test]
    fn folder_round_trip_and_listing() -> TestResult {
        let dir = tempdir()?;
        let src = dir.path().join("tree");
        fs::create_dir_all(src.join("sub/empty"))?;
        fs::write(src.join("sub/a.txt"), b"alpha")?;
        fs::write(src.join("b.tmp"), b"scratch")?;
        fs::write(src.join("big.bin"), vec![3u8; 50_000])?;

        let archive = dir.path().join("tree.fsp");
        let stats = compress_folder(&src, &archive, 3, &["*.tmp"], &options(), &Hooks::new())?;
        assert_eq!(stats.files_processed, 2);

        let listing = list_archive(&archive)?;
        assert!(listing.is_folder);
        let names: Vec<_> = listing.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, ["big.bin", "sub", "sub/a.txt", "sub/empty"]);

        let out = dir.path().join("restored");
        let report = decompress(&archive, &out, true, &options(), &Hooks::new())?;
        assert!(report.is_folder);
        assert_eq!(report.entries_restored, 4);
        assert_eq!(fs::read(out.join("sub/a.txt"))?, b"alpha");
        assert!(out.join("sub/empty").is_dir());
        assert!(!out.join("b.tmp").exists());
        Ok(())
    }

    #[test]
    fn everything_excluded_is_empty_source() -> TestResult {
        let dir = tempdir()?;
        let src = dir.path().join("tree");
        fs::create_dir(&src)?;
        fs::write(src.join("x.tmp"), b"x")?;
        let err = compress_folder(&src, &dir.path().join("o"), 3, &["*.tmp"], &options(), &Hooks::new())
            .unwrap_err();
        assert!(matches!(err, SpacerError::EmptySource { .. }));
        Ok(())
    }

    #[test]
    fn refuses_existing_destination_and_bad_levels() -> TestResult {
        let dir = tempdir()?;
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"1")?;
        fs::write(&dst, b"keep")?;
        assert!(matches!(
            compress_file(&src, &dst, 3, &options(), &Hooks::new()),
            Err(SpacerError::AlreadyExists { .. })
        ));
        assert_eq!(fs::read(&dst)?, b"keep");
        for level in [0, 23] {
            assert!(matches!(
                compress_file(&src, &dir.path().join("c"), level, &options(), &Hooks::new()),
                Err(SpacerError::InvalidLevel { .. })
            ));
        }
        assert!(matches!(
            compress_file(&dir.path().join("missing"), &dir.path().join("c"), 3, &options(), &Hooks::new()),
            Err(SpacerError::NotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn cancelled_compression_leaves_no_destination() -> TestResult {
        let dir = tempdir()?;
        let src = dir.path().join("a");
        fs::write(&src, vec![1u8; 100_000])?;
        let cancel = CancelFlag::new();
        cancel.cancel();
        let hooks = Hooks::new().with_cancel(cancel);
        let dst = dir.path().join("a.zst");
        assert!(matches!(
            compress_file(&src, &dst, 3, &options(), &hooks),
            Err(SpacerError::Cancelled)
        ));
        assert!(!dst.exists());
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn empty_file_round_trips() -> TestResult {
        let dir = tempdir()?;
        let src = dir.path().join("empty");
        fs::write(&src, b"")?;
        let archive = dir.path().join("empty.zst");
        let stats = compress_file(&src, &archive, 1, &options(), &Hooks::new())?;
        assert_eq!(stats.original_size, 0);
        assert!(stats.compressed_size > 0);
        let out = dir.path().join("out");
        decompress(&archive, &out, true, &options(), &Hooks::new())?;
        assert_eq!(fs::read(&out)?.len(), 0);
        Ok(())
    }
}
