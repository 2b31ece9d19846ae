//! Resolution of archive entry names to output paths without escaping the output root.

use crate::error::{Result, SpacerError};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// Splits an entry name into its normal segments, rejecting anything that could leave
/// the output root: `..` segments, absolute paths, drive or UNC prefixes and NUL bytes.
///
/// `.` and empty segments are dropped, so `"./a//b"` becomes `["a", "b"]`.
pub fn normalize_entry(entry: &str) -> Result<Vec<&str>> {
    let traversal = || SpacerError::PathTraversal {
        entry: entry.to_string(),
    };

    if entry.contains('\0') || entry.starts_with('/') || entry.starts_with('\\') {
        return Err(traversal());
    }
    if has_drive_prefix(entry) {
        return Err(traversal());
    }

    let mut segments = Vec::new();
    for segment in entry.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => return Err(traversal()),
            s if cfg!(windows) && s.contains(':') => return Err(traversal()),
            s => segments.push(s),
        }
    }
    Ok(segments)
}

/// Returns the POSIX form of an entry name (`a/b/c`), or `PathTraversal`.
pub fn normalize_entry_string(entry: &str) -> Result<String> {
    Ok(normalize_entry(entry)?.join("/"))
}

/// Resolves `entry` under `output_root`.
///
/// The entry is normalized and screened first; the joined result must then still begin
/// with the absolute output root followed by a separator (or be the root itself). An
/// entry that normalizes to nothing resolves to the root.
///
/// # Arguments
/// * `output_root` - Directory everything is extracted into. Need not exist yet.
/// * `entry` - Relative entry name as stored in the archive.
pub fn resolve(output_root: &Path, entry: &str) -> Result<PathBuf> {
    let segments = normalize_entry(entry)?;
    let root = std::path::absolute(output_root)
        .map_err(|e| SpacerError::io(e, output_root))?;

    let mut resolved = root.clone();
    for segment in &segments {
        resolved.push(segment);
    }

    if !is_contained(&root, &resolved) {
        return Err(SpacerError::PathTraversal {
            entry: entry.to_string(),
        });
    }
    Ok(resolved)
}

fn is_contained(root: &Path, candidate: &Path) -> bool {
    let root_str = root.to_string_lossy();
    let candidate_str = candidate.to_string_lossy();
    if candidate_str == root_str {
        return true;
    }
    let mut prefix = root_str.into_owned();
    if !prefix.ends_with(MAIN_SEPARATOR) {
        prefix.push(MAIN_SEPARATOR);
    }
    candidate_str.starts_with(&prefix)
}

fn has_drive_prefix(entry: &str) -> bool {
    let bytes = entry.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn plain_entries_resolve_under_root() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let resolved = resolve(dir.path(), "bin/tool")?;
        assert!(resolved.starts_with(dir.path()));
        assert!(resolved.ends_with("bin/tool"));
        Ok(())
    }

    #[test]
    fn dot_and_empty_segments_collapse() {
        assert_eq!(normalize_entry_string("./a//b/./c").unwrap(), "a/b/c");
        assert_eq!(normalize_entry_string("a\\b").unwrap(), "a/b");
    }

    #[test]
    fn empty_entry_is_the_root() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let root = std::path::absolute(dir.path())?;
        assert_eq!(resolve(dir.path(), "./")?, root);
        Ok(())
    }

    #[test]
    fn traversal_attempts_are_rejected() {
        let root = Path::new("out");
        for bad in [
            "../../etc/passwd",
            "a/../../b",
            "a/..",
            "/etc/passwd",
            "\\windows\\system32",
            "C:\\Windows\\win.ini",
            "c:relative",
            "\\\\server\\share\\x",
            "nul\0byte",
        ] {
            assert!(
                matches!(resolve(root, bad), Err(SpacerError::PathTraversal { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn sibling_with_common_prefix_is_not_contained() {
        assert!(!is_contained(Path::new("/tmp/out"), Path::new("/tmp/outside/x")));
        assert!(is_contained(Path::new("/tmp/out"), Path::new("/tmp/out/x")));
        assert!(is_contained(Path::new("/tmp/out"), Path::new("/tmp/out")));
    }
}
