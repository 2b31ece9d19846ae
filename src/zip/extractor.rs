//! Per-entry decoding and the extraction commit.
//!
//! ## Key Features:
//! - **Parallel decode**: entries are decrypted and decompressed on the worker pool, each
//!   into its own file inside one staging directory next to the output directory.
//! - **All-or-nothing cancellation**: a cancelled run drops the staging directory before
//!   anything reaches the output directory.
//! - **Partial success**: a bad password, unsupported method, corrupt payload or unsafe
//!   name fails only that entry; it is recorded and the rest are extracted.
//!
//! Decoded files are moved into place in archive order once every entry has finished.

use super::crypto::{self, DecryptingReader, ENCRYPTION_HEADER_SIZE};
use super::structures::*;
use crate::compress::read_chunk;
use crate::error::{IoContext, Result, SpacerError};
use crate::fsx;
use crate::pattern::ExcludeRules;
use crate::progress::ProgressTracker;
use crate::sanitize;

use flate2::read::DeflateDecoder;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Which parse path produced the entry list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseMode {
    CentralDirectory,
    /// Local-header scan, with the reason the central directory was not used.
    Recovery { reason: String },
}

impl ParseMode {
    pub fn is_recovery(&self) -> bool {
        matches!(self, ParseMode::Recovery { .. })
    }
}

#[derive(Debug)]
pub struct ExtractedEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub struct FailedEntry {
    pub name: String,
    pub header_offset: u64,
    pub error: SpacerError,
}

/// Outcome of one ZIP extraction.
#[derive(Debug)]
pub struct ExtractSummary {
    pub mode: ParseMode,
    /// Extracted entries, in archive order.
    pub extracted: Vec<ExtractedEntry>,
    /// Names excluded by pattern.
    pub skipped: Vec<String>,
    pub failed: Vec<FailedEntry>,
    /// Problems that concern the archive rather than one entry.
    pub warnings: Vec<String>,
}

impl ExtractSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn bytes_written(&self) -> u64 {
        self.extracted.iter().map(|e| e.size).sum()
    }
}

/// Per-run extraction settings.
#[derive(Debug, Clone)]
pub struct ExtractSettings<'a> {
    pub password: Option<&'a [u8]>,
    pub verify: bool,
    pub overwrite: bool,
    pub chunk_size: usize,
}

struct Planned<'e> {
    index: usize,
    entry: &'e ZipEntry,
    target: PathBuf,
}

struct Decoded {
    size: u64,
    warnings: Vec<String>,
}

fn failure(entry: &ZipEntry, error: SpacerError) -> FailedEntry {
    FailedEntry {
        name: entry.name.clone(),
        header_offset: entry.header_offset,
        error,
    }
}

/// Extracts `entries` of the archive held in `data` into `out_dir`.
///
/// Entries are decoded into a staging directory inside `out_dir` and renamed into place
/// once every entry has been decoded. Returns `Err` only for failures of the whole run:
/// cancellation or a staging directory that cannot be created. Everything scoped to one entry lands in
/// [`ExtractSummary::failed`].
///
/// # Arguments
/// * `data` - The whole archive.
/// * `entries` - Entry descriptions in archive order.
/// * `mode` - How `entries` were obtained; recovered entries get lenient CRC handling.
/// * `out_dir` - Output root; created if missing.
/// * `rules` - Exclusion patterns, matched against each name and its ancestors.
/// * `settings` - Password, verification, overwrite and buffer size.
/// * `pool` - Worker pool that decodes entries.
/// * `tracker` - Progress in compressed bytes; polled for cancellation.
#[allow(clippy::too_many_arguments)]
pub fn extract_entries(
    data: &[u8],
    entries: &[ZipEntry],
    mode: ParseMode,
    out_dir: &Path,
    rules: &ExcludeRules,
    settings: &ExtractSettings<'_>,
    pool: &rayon::ThreadPool,
    tracker: &ProgressTracker,
) -> Result<ExtractSummary> {
    let mut summary = ExtractSummary {
        mode,
        extracted: Vec::new(),
        skipped: Vec::new(),
        failed: Vec::new(),
        warnings: Vec::new(),
    };

    let plan = plan(entries, out_dir, rules, settings.overwrite, &mut summary);
    tracker.set_total(plan.iter().map(|p| p.entry.compressed_size).sum());

    let created_root = fs::symlink_metadata(out_dir).is_err();
    let staging = fsx::stage_dir_in(out_dir)?;
    let decoded: Vec<Result<Decoded>> = pool.install(|| {
        plan.par_iter()
            .map(|p| {
                let result = if p.entry.is_dir() {
                    Ok(Decoded {
                        size: 0,
                        warnings: Vec::new(),
                    })
                } else {
                    decode_entry(data, p.entry, &staged_path(staging.path(), p.index), settings, tracker)
                };
                tracker.advance(p.entry.compressed_size);
                result
            })
            .collect()
    });

    if decoded.iter().any(|r| matches!(r, Err(SpacerError::Cancelled))) || tracker.check_cancelled().is_err() {
        drop(staging);
        if created_root {
            let _ = fs::remove_dir(out_dir);
        }
        return Err(SpacerError::Cancelled);
    }

    let mut dir_modes = Vec::new();
    for (planned, result) in plan.iter().zip(decoded) {
        let decoded = match result {
            Ok(decoded) => decoded,
            Err(error) => {
                tracing::warn!("failed to extract '{}': {}", planned.entry.name, error);
                summary.failed.push(failure(planned.entry, error));
                continue;
            }
        };
        match commit(staging.path(), planned, &mut dir_modes) {
            Ok(()) => {
                tracker.record_file();
                for warning in &decoded.warnings {
                    tracing::warn!("'{}': {}", planned.entry.name, warning);
                }
                let mut warnings = planned.entry.warnings.clone();
                warnings.extend(decoded.warnings);
                summary.extracted.push(ExtractedEntry {
                    name: planned.entry.name.clone(),
                    path: planned.target.clone(),
                    size: decoded.size,
                    warnings,
                });
            }
            Err(error) => {
                tracing::warn!("failed to place '{}': {}", planned.entry.name, error);
                summary.failed.push(failure(planned.entry, error));
            }
        }
    }

    for (path, mode) in dir_modes.iter().rev() {
        if let Err(e) = fsx::set_unix_permissions(path, *mode) {
            summary
                .warnings
                .push(format!("cannot set mode {mode:o} on {}: {e}", path.display()));
        }
    }
    Ok(summary)
}

fn staged_path(staging: &Path, index: usize) -> PathBuf {
    staging.join(format!("{index}.part"))
}

/// Screens entries in archive order: exclusion, name safety, existing targets and
/// duplicates. Of several entries resolving to the same path the last one is kept.
fn plan<'e>(
    entries: &'e [ZipEntry],
    out_dir: &Path,
    rules: &ExcludeRules,
    overwrite: bool,
    summary: &mut ExtractSummary,
) -> Vec<Planned<'e>> {
    let mut planned: Vec<Planned<'e>> = Vec::new();
    let mut by_target: HashMap<PathBuf, usize> = HashMap::new();
    let mut superseded: Vec<bool> = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        let name = entry.name.replace('\\', "/");
        if rules.is_excluded(name.trim_end_matches('/')) {
            tracing::debug!("excluded '{}'", entry.name);
            summary.skipped.push(entry.name.clone());
            continue;
        }
        let target = match sanitize::resolve(out_dir, &entry.name) {
            Ok(target) => target,
            Err(error) => {
                tracing::warn!("refusing '{}': {}", entry.name, error);
                summary.failed.push(failure(entry, error));
                continue;
            }
        };
        if sanitize::normalize_entry(&entry.name).is_ok_and(|s| s.is_empty()) {
            if !entry.is_dir() {
                summary.failed.push(failure(
                    entry,
                    SpacerError::EntryCorrupt {
                        entry: entry.name.clone(),
                        reason: "entry name is empty".into(),
                    },
                ));
            }
            continue;
        }
        if !overwrite && !entry.is_dir() && fs::symlink_metadata(&target).is_ok() {
            summary
                .failed
                .push(failure(entry, SpacerError::AlreadyExists { path: target }));
            continue;
        }

        if let Some(previous) = by_target.insert(target.clone(), planned.len()) {
            let earlier = &planned[previous];
            summary.warnings.push(format!(
                "'{}' at offset {} is superseded by a later entry with the same path",
                earlier.entry.name, earlier.entry.header_offset
            ));
            superseded[previous] = true;
        }
        planned.push(Planned {
            index,
            entry,
            target,
        });
        superseded.push(false);
    }

    planned
        .into_iter()
        .zip(superseded)
        .filter_map(|(p, dropped)| (!dropped).then_some(p))
        .collect()
}

fn unsupported(entry: &ZipEntry, what: impl Into<String>) -> SpacerError {
    SpacerError::UnsupportedMethod {
        entry: entry.name.clone(),
        what: what.into(),
    }
}

fn corrupt(entry: &ZipEntry, reason: impl Into<String>) -> SpacerError {
    SpacerError::EntryCorrupt {
        entry: entry.name.clone(),
        reason: reason.into(),
    }
}

/// Opens the reader chain for one payload: decryption, then decompression.
fn open_payload<'d>(
    data: &'d [u8],
    entry: &ZipEntry,
    password: Option<&[u8]>,
) -> Result<Box<dyn Read + 'd>> {
    if entry.flags & FLAG_STRONG_ENCRYPTION != 0 {
        return Err(unsupported(entry, "strong encryption"));
    }
    match entry.method {
        CompressionMethod::Stored | CompressionMethod::Deflate | CompressionMethod::Zstd => {}
        CompressionMethod::Aes => return Err(unsupported(entry, "AES encryption")),
        CompressionMethod::Unknown(code) => {
            return Err(unsupported(entry, format!("compression method {code}")))
        }
    }

    let payload = data
        .get(entry.payload_range())
        .ok_or_else(|| corrupt(entry, "payload lies outside the file"))?;

    let raw: Box<dyn Read + 'd> = if entry.is_encrypted() {
        let auth = || SpacerError::Authentication {
            entry: entry.name.clone(),
        };
        let password = password.ok_or_else(auth)?;
        if payload.len() < ENCRYPTION_HEADER_SIZE {
            return Err(corrupt(entry, "encryption header is truncated"));
        }
        let (header, body) = payload.split_at(ENCRYPTION_HEADER_SIZE);
        let keys = crypto::open(password, header, entry.password_check_byte()).ok_or_else(auth)?;
        Box::new(DecryptingReader::new(body, keys))
    } else {
        Box::new(payload)
    };

    Ok(match entry.method {
        CompressionMethod::Deflate => Box::new(DeflateDecoder::new(raw)),
        CompressionMethod::Zstd => Box::new(
            zstd::stream::read::Decoder::new(raw).map_err(|e| corrupt(entry, e.to_string()))?,
        ),
        _ => raw,
    })
}

/// Decodes one file entry into `staged`, checking CRC and size when asked to.
fn decode_entry(
    data: &[u8],
    entry: &ZipEntry,
    staged: &Path,
    settings: &ExtractSettings<'_>,
    tracker: &ProgressTracker,
) -> Result<Decoded> {
    tracker.check_cancelled()?;
    let mut reader = open_payload(data, entry, settings.password)?;

    let mut out = BufWriter::new(File::create(staged).at(staged)?);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; settings.chunk_size];
    let mut size = 0u64;
    loop {
        tracker.check_cancelled()?;
        let n = read_chunk(&mut reader, &mut buf).map_err(|e| corrupt(entry, e.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).at(staged)?;
        size += n as u64;
    }
    out.flush().at(staged)?;

    let mut warnings = Vec::new();
    if !settings.verify {
        return Ok(Decoded { size, warnings });
    }
    let recovered = entry.source == EntrySource::Recovered;
    let mut problems = Vec::new();
    let crc = hasher.finalize();
    if !entry.crc_known {
        warnings.push("no CRC available; contents unverified".to_string());
    } else if crc != entry.crc32 {
        problems.push(format!(
            "CRC mismatch: expected {:08x}, got {:08x}",
            entry.crc32, crc
        ));
    }
    if entry.crc_known && size != entry.uncompressed_size {
        problems.push(format!(
            "size mismatch: expected {} bytes, got {}",
            entry.uncompressed_size, size
        ));
    }
    if problems.is_empty() {
        return Ok(Decoded { size, warnings });
    }
    if recovered {
        warnings.extend(problems.into_iter().map(|p| format!("{p}; best-effort data kept")));
        Ok(Decoded { size, warnings })
    } else {
        Err(corrupt(entry, problems.join("; ")))
    }
}

/// Moves one decoded entry from the staging directory to its target.
fn commit(staging: &Path, planned: &Planned<'_>, dir_modes: &mut Vec<(PathBuf, u32)>) -> Result<()> {
    let target = &planned.target;
    if planned.entry.is_dir() {
        fs::create_dir_all(target).at(target)?;
        if let Some(mode) = planned.entry.mode {
            dir_modes.push((target.clone(), mode));
        }
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let staged = staged_path(staging, planned.index);
    fs::rename(&staged, target).at(target)?;
    if let Some(mode) = planned.entry.mode {
        fsx::set_unix_permissions(target, mode).at(target)?;
    }
    Ok(())
}
