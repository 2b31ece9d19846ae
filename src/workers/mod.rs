//! Bounded worker pool and the folder-compression prefetch pipeline.
//!
//! The container stream is written by one thread in table order. Work that does not
//! depend on that order (reading small files) runs on a rayon pool a window at a time;
//! a producer thread hands finished windows to the writer over a channel of capacity one,
//! so memory stays bounded by a few windows of at most `chunk_size` bytes per entry.

use crate::common::ArchiveEntry;
use crate::error::{IoContext, Result, SpacerError};
use crate::fsx;
use crate::pattern::ExcludeRules;
use crate::progress::CancelFlag;

use crossbeam_channel::bounded;
use rayon::prelude::*;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::thread;
use walkdir::WalkDir;

/// Entries prefetched per window, per worker thread.
const WINDOW_PER_THREAD: usize = 4;

/// Builds a pool of `threads` workers.
pub fn build_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("filespacer-worker-{i}"))
        .build()
        .map_err(|e| SpacerError::io(io::Error::new(io::ErrorKind::Other, e.to_string()), ""))
}

/// A walked filesystem entry: its table record plus where to read it from.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub entry: ArchiveEntry,
    pub absolute: PathBuf,
}

fn relative_name(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        SpacerError::io(
            io::Error::new(io::ErrorKind::InvalidInput, "entry outside the walked root"),
            path,
        )
    })?;
    let mut parts = Vec::new();
    for component in rel.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            SpacerError::io(
                io::Error::new(io::ErrorKind::InvalidData, "file name is not valid UTF-8"),
                path,
            )
        })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

/// Walks `root` and returns every directory and regular file below it that survives
/// `rules`, in pre-order with siblings sorted by name.
///
/// Excluded directories are pruned whole. Symlinks and special files are skipped.
pub fn collect_entries(root: &Path, rules: &ExcludeRules) -> Result<Vec<SourceEntry>> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| match relative_name(root, e.path()) {
            Ok(rel) => !rules.matches(&rel),
            // Keep it so the error surfaces below.
            Err(_) => true,
        });

    let mut entries = Vec::new();
    for item in walker {
        let item = item.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            SpacerError::io(io::Error::from(e), path)
        })?;
        let file_type = item.file_type();
        if !file_type.is_dir() && !file_type.is_file() {
            tracing::debug!("skipping non-regular entry {}", item.path().display());
            continue;
        }
        let path = relative_name(root, item.path())?;
        let metadata = item.metadata().map_err(|e| {
            SpacerError::io(io::Error::from(e), item.path())
        })?;
        entries.push(SourceEntry {
            entry: ArchiveEntry {
                path,
                size: if file_type.is_dir() { 0 } else { metadata.len() },
                is_dir: file_type.is_dir(),
                mode: fsx::unix_mode(&metadata),
                offset: 0,
            },
            absolute: item.into_path(),
        });
    }
    Ok(entries)
}

/// What the writer receives for one entry.
#[derive(Debug)]
pub enum Payload {
    /// Directory, no payload.
    Directory,
    /// Small file read ahead on the pool.
    Loaded(Vec<u8>),
    /// Large file the writer must stream itself.
    Deferred,
}

fn load(source: &SourceEntry, chunk_size: usize, cancel: &CancelFlag) -> Result<Payload> {
    cancel.check()?;
    if source.entry.is_dir {
        return Ok(Payload::Directory);
    }
    if source.entry.size > chunk_size as u64 {
        return Ok(Payload::Deferred);
    }
    let file = File::open(&source.absolute).at(&source.absolute)?;
    let mut bytes = Vec::with_capacity(source.entry.size as usize);
    // One byte over the limit is enough for the writer to notice a file that grew.
    file.take(source.entry.size + 1)
        .read_to_end(&mut bytes)
        .at(&source.absolute)?;
    Ok(Payload::Loaded(bytes))
}

/// Feeds `entries` to `consume` in order, prefetching small files on `pool`.
///
/// The writer (`consume`) runs on the calling thread. The first error from either side
/// stops the pipeline; the producer notices a dropped receiver and exits.
///
/// # Arguments
/// * `pool` - Worker pool for prefetching.
/// * `entries` - Walked entries in table order.
/// * `chunk_size` - Files up to this size are read ahead; larger ones are `Deferred`.
/// * `cancel` - Checked before each entry is prefetched and before each is consumed.
/// * `consume` - Called once per entry, in order.
pub fn run_prefetch_pipeline<F>(
    pool: &rayon::ThreadPool,
    entries: &[SourceEntry],
    chunk_size: usize,
    cancel: &CancelFlag,
    mut consume: F,
) -> Result<()>
where
    F: FnMut(&SourceEntry, Payload) -> Result<()>,
{
    let window = (pool.current_num_threads() * WINDOW_PER_THREAD).max(1);
    let (sender, receiver) = bounded::<Result<Vec<Payload>>>(1);

    thread::scope(|s| {
        s.spawn(move || {
            for batch in entries.chunks(window) {
                if cancel.is_cancelled() {
                    let _ = sender.send(Err(SpacerError::Cancelled));
                    return;
                }
                let loaded: Result<Vec<Payload>> =
                    pool.install(|| batch.par_iter().map(|e| load(e, chunk_size, cancel)).collect());
                let failed = loaded.is_err();
                if sender.send(loaded).is_err() || failed {
                    return;
                }
            }
        });

        let result = drain(&receiver, entries, cancel, &mut consume);
        // Unblocks a producer waiting on a full channel before the scope joins it.
        drop(receiver);
        result
    })
}

fn drain<F>(
    receiver: &crossbeam_channel::Receiver<Result<Vec<Payload>>>,
    entries: &[SourceEntry],
    cancel: &CancelFlag,
    consume: &mut F,
) -> Result<()>
where
    F: FnMut(&SourceEntry, Payload) -> Result<()>,
{
    let mut position = 0usize;
    for batch in receiver.iter() {
        for payload in batch? {
            cancel.check()?;
            consume(&entries[position], payload)?;
            position += 1;
        }
    }
    Ok(())
}

/// Total payload bytes of `entries`.
pub fn total_size(entries: &[SourceEntry]) -> u64 {
    entries.iter().map(|e| e.entry.size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn tree() -> std::result::Result<tempfile::TempDir, Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join("b/node_modules/pkg"))?;
        fs::create_dir_all(dir.path().join("a"))?;
        fs::write(dir.path().join("b/keep.txt"), b"keep")?;
        fs::write(dir.path().join("b/skip.tmp"), b"skip")?;
        fs::write(dir.path().join("b/node_modules/pkg/index.js"), b"js")?;
        fs::write(dir.path().join("a/z.txt"), b"z")?;
        fs::write(dir.path().join("a/y.txt"), vec![7u8; 10_000])?;
        Ok(dir)
    }

    #[test]
    fn walk_is_sorted_preorder_and_pruned() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tree()?;
        let rules = ExcludeRules::new(&["*.tmp", "node_modules"])?;
        let entries = collect_entries(dir.path(), &rules)?;
        let names: Vec<_> = entries.iter().map(|e| e.entry.path.as_str()).collect();
        assert_eq!(names, ["a", "a/y.txt", "a/z.txt", "b", "b/keep.txt"]);
        assert!(entries[0].entry.is_dir);
        assert_eq!(entries[1].entry.size, 10_000);
        Ok(())
    }

    #[test]
    fn pipeline_preserves_order_and_defers_large_files() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tree()?;
        let entries = collect_entries(dir.path(), &ExcludeRules::new::<&str>(&[])?)?;
        let pool = build_pool(3)?;
        let mut seen = Vec::new();
        run_prefetch_pipeline(&pool, &entries, 4096, &CancelFlag::new(), |source, payload| {
            let kind = match payload {
                Payload::Directory => "dir",
                Payload::Loaded(_) => "loaded",
                Payload::Deferred => "deferred",
            };
            seen.push((source.entry.path.clone(), kind));
            Ok(())
        })?;
        let expected: Vec<_> = entries.iter().map(|e| e.entry.path.clone()).collect();
        assert_eq!(seen.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>(), expected);
        assert!(seen.contains(&("a/y.txt".to_string(), "deferred")));
        assert!(seen.contains(&("a/z.txt".to_string(), "loaded")));
        Ok(())
    }

    #[test]
    fn consumer_error_stops_the_pipeline() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tree()?;
        let entries = collect_entries(dir.path(), &ExcludeRules::new::<&str>(&[])?)?;
        let pool = build_pool(2)?;
        let mut calls = 0;
        let result = run_prefetch_pipeline(&pool, &entries, 4096, &CancelFlag::new(), |_, _| {
            calls += 1;
            Err(SpacerError::InvalidArchive("stop".into()))
        });
        assert!(matches!(result, Err(SpacerError::InvalidArchive(_))));
        assert_eq!(calls, 1);
        Ok(())
    }

    #[test]
    fn cancelled_pipeline_reports_cancelled() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tree()?;
        let entries = collect_entries(dir.path(), &ExcludeRules::new::<&str>(&[])?)?;
        let pool = build_pool(1)?;
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = run_prefetch_pipeline(&pool, &entries, 4096, &cancel, |_, _| Ok(()));
        assert!(matches!(result, Err(SpacerError::Cancelled)));
        Ok(())
    }

    #[test]
    fn cancel_inside_a_window_stops_at_the_next_entry() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tree()?;
        let entries = collect_entries(dir.path(), &ExcludeRules::new::<&str>(&[])?)?;
        assert!(entries.len() > 2);
        let pool = build_pool(4)?;
        let cancel = CancelFlag::new();
        let mut calls = 0;
        let result = run_prefetch_pipeline(&pool, &entries, 4096, &cancel, |_, _| {
            calls += 1;
            cancel.cancel();
            Ok(())
        });
        assert!(matches!(result, Err(SpacerError::Cancelled)));
        assert_eq!(calls, 1);
        Ok(())
    }

    #[test]
    fn prefetch_of_a_cancelled_entry_fails() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tree()?;
        let entries = collect_entries(dir.path(), &ExcludeRules::new::<&str>(&[])?)?;
        let cancel = CancelFlag::new();
        assert!(matches!(load(&entries[2], 4096, &cancel)?, Payload::Loaded(_)));
        cancel.cancel();
        assert!(matches!(load(&entries[2], 4096, &cancel), Err(SpacerError::Cancelled)));
        Ok(())
    }
}
