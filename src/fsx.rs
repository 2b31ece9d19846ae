//! Filesystem helpers for staged, all-or-nothing writes.
//!
//! Every operation writes into a uniquely named staging file or directory next to its
//! destination and renames it into place only once the output is complete. A failed or
//! cancelled run drops the staging object, which deletes it, so the user-visible path
//! never holds a partial result.
//!
//! Unix permission bits are applied with [`set_unix_permissions`]; on other platforms
//! the call is a no-op.

use crate::error::{IoContext, Result, SpacerError};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile, TempDir};

const STAGING_PREFIX: &str = ".filespacer-";
const STAGING_SUFFIX: &str = ".part";

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Fails with `AlreadyExists` when `dst` exists and `overwrite` is not set.
pub fn check_destination(dst: &Path, overwrite: bool) -> Result<()> {
    if !overwrite && fs::symlink_metadata(dst).is_ok() {
        return Err(SpacerError::AlreadyExists {
            path: dst.to_path_buf(),
        });
    }
    Ok(())
}

/// Creates a staging file in the directory that will hold `dst`, creating that directory
/// if needed.
pub fn stage_file(dst: &Path) -> Result<NamedTempFile> {
    let dir = parent_dir(dst);
    fs::create_dir_all(dir).at(dir)?;
    Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(STAGING_SUFFIX)
        .tempfile_in(dir)
        .at(dir)
}

/// Creates a staging directory next to `dst`.
pub fn stage_dir(dst: &Path) -> Result<TempDir> {
    stage_dir_in(parent_dir(dst))
}

/// Creates a staging directory inside `dir`, creating `dir` if needed.
///
/// Used when the output is many files under one root: renames out of the staging
/// directory then never cross a filesystem boundary, even when `dir` is a mount point.
pub fn stage_dir_in(dir: &Path) -> Result<TempDir> {
    fs::create_dir_all(dir).at(dir)?;
    Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(STAGING_SUFFIX)
        .tempdir_in(dir)
        .at(dir)
}

/// Atomically renames a finished staging file onto `dst`.
///
/// Without `overwrite` the rename refuses to replace an existing file, so a destination
/// created concurrently is never clobbered.
pub fn commit_file(staged: NamedTempFile, dst: &Path, overwrite: bool) -> Result<()> {
    let persisted = if overwrite {
        staged.persist(dst)
    } else {
        staged.persist_noclobber(dst)
    };
    match persisted {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Err(SpacerError::AlreadyExists {
            path: dst.to_path_buf(),
        }),
        Err(e) => Err(SpacerError::io(e.error, dst)),
    }
}

/// Moves a finished staging directory onto `dst`, replacing an existing destination only
/// when `overwrite` is set.
///
/// An existing destination is first moved into a holding directory next to it and only
/// deleted after the new tree is in place; if the final rename fails it is moved back.
pub fn commit_dir(staged: TempDir, dst: &Path, overwrite: bool) -> Result<()> {
    let mut displaced = None;
    if fs::symlink_metadata(dst).is_ok() {
        if !overwrite {
            return Err(SpacerError::AlreadyExists {
                path: dst.to_path_buf(),
            });
        }
        let holding = stage_dir(dst)?;
        let old = holding.path().join("previous");
        fs::rename(dst, &old).at(dst)?;
        displaced = Some((holding, old));
    }

    let staged_path: PathBuf = staged.into_path();
    if let Err(e) = fs::rename(&staged_path, dst) {
        let _ = fs::remove_dir_all(&staged_path);
        if let Some((_holding, old)) = &displaced {
            let _ = fs::rename(old, dst);
        }
        return Err(SpacerError::io(e, dst));
    }
    // Dropping the holding directory deletes the replaced tree.
    drop(displaced);
    Ok(())
}

/// Writes a small file through a staging file.
pub fn write_atomic(path: &Path, bytes: &[u8], overwrite: bool) -> Result<()> {
    let mut staged = stage_file(path)?;
    staged.write_all(bytes).at(path)?;
    staged.as_file().sync_all().at(path)?;
    commit_file(staged, path, overwrite)
}

/// Returns the Unix mode bits of `meta`, or `None` where the platform has none.
pub fn unix_mode(meta: &fs::Metadata) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Some(meta.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        None
    }
}

#[cfg(unix)]
/// Set POSIX permission bits on Unix.
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
/// No-op on Windows: POSIX permission bits are not preserved.
pub fn set_unix_permissions(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
