use filespacer::hash;
use filespacer::ops::{compress_file, compress_folder, decompress, list_archive};
use filespacer::{Hooks, Options, SpacerError, Verification};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

fn options() -> Options {
    Options {
        parallel_threads: 2,
        chunk_size: 16 * 1024,
        ..Options::default()
    }
}

fn sample_data(len: usize) -> Vec<u8> {
    let words = ["alpha ", "bravo ", "charlie ", "delta ", "echo "];
    let mut out = Vec::with_capacity(len);
    let mut i = 0usize;
    while out.len() < len {
        out.extend_from_slice(words[(i * 7 + i / 3) % words.len()].as_bytes());
        i += 1;
    }
    out.truncate(len);
    out
}

#[test]
fn every_level_round_trips() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("input.txt");
    let data = sample_data(40_000);
    fs::write(&src, &data)?;

    for level in [1, 3, 9, 19, 22] {
        let archive = dir.path().join(format!("input.{level}.zst"));
        let stats = compress_file(&src, &archive, level, &options(), &Hooks::new())?;
        assert_eq!(hash::read_sidecar(&archive)?.as_deref(), Some(stats.digest.as_str()));

        let out = dir.path().join(format!("out.{level}"));
        let report = decompress(&archive, &out, true, &options(), &Hooks::new())?;
        assert_eq!(report.verification, Verification::Verified);
        assert_eq!(fs::read(&out)?, data, "level {level}");
    }
    Ok(())
}

#[test]
fn stream_larger_than_many_chunks() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("big.bin");
    let data = sample_data(3 * 1024 * 1024 + 17);
    fs::write(&src, &data)?;

    let calls = Arc::new(AtomicU64::new(0));
    let last = Arc::new(AtomicU64::new(0));
    let (calls_cl, last_cl) = (Arc::clone(&calls), Arc::clone(&last));
    let hooks = Hooks::new().with_progress(move |done, _total| {
        calls_cl.fetch_add(1, Ordering::Relaxed);
        last_cl.store(done, Ordering::Relaxed);
    });

    let archive = dir.path().join("big.zst");
    compress_file(&src, &archive, 3, &options(), &hooks)?;
    assert!(calls.load(Ordering::Relaxed) > 100);
    assert_eq!(last.load(Ordering::Relaxed), data.len() as u64);

    let out = dir.path().join("big.out");
    decompress(&archive, &out, true, &options(), &Hooks::new())?;
    assert_eq!(fs::read(&out)?, data);
    Ok(())
}

#[test]
fn truncated_archive_is_reported_and_cleaned_up() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("input.txt");
    fs::write(&src, sample_data(200_000))?;
    let archive = dir.path().join("input.zst");
    compress_file(&src, &archive, 3, &options(), &Hooks::new())?;

    let bytes = fs::read(&archive)?;
    fs::write(&archive, &bytes[..bytes.len() / 2])?;

    let out = dir.path().join("out.txt");
    let err = decompress(&archive, &out, false, &options(), &Hooks::new()).unwrap_err();
    assert!(
        matches!(err, SpacerError::TruncatedStream { .. } | SpacerError::Decode { .. }),
        "{err:?}"
    );
    assert!(!out.exists());
    Ok(())
}

#[test]
fn not_a_zstd_stream_is_a_decode_error() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("plain.txt");
    fs::write(&src, b"this was never compressed")?;
    let out = dir.path().join("out");
    let err = decompress(&src, &out, false, &options(), &Hooks::new()).unwrap_err();
    assert!(matches!(err, SpacerError::Decode { offset: 0, .. }));
    assert!(!out.exists());
    Ok(())
}

#[test]
fn missing_sidecar_is_not_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("a.txt");
    fs::write(&src, b"no digest")?;
    let opts = Options {
        write_sidecar: false,
        ..options()
    };
    let archive = dir.path().join("a.zst");
    compress_file(&src, &archive, 3, &opts, &Hooks::new())?;
    assert!(!hash::sidecar_path(&archive).exists());

    let report = decompress(&archive, &dir.path().join("b.txt"), true, &opts, &Hooks::new())?;
    assert_eq!(report.verification, Verification::MissingSidecar);
    Ok(())
}

fn build_tree(root: &Path) -> std::io::Result<()> {
    fs::create_dir_all(root.join("src/nested"))?;
    fs::create_dir_all(root.join("node_modules/left-pad"))?;
    fs::write(root.join("README.md"), b"# readme\n")?;
    fs::write(root.join("src/main.rs"), b"fn main() {}\n")?;
    fs::write(root.join("src/nested/data.bin"), sample_data(70_000))?;
    fs::write(root.join("src/scratch.tmp"), b"temporary")?;
    fs::write(root.join("node_modules/left-pad/index.js"), b"module.exports = 1;")?;
    Ok(())
}

#[test]
fn folder_exclusions_and_restore() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("project");
    build_tree(&src)?;

    let archive = dir.path().join("project.fsp");
    let stats = compress_folder(
        &src,
        &archive,
        6,
        &["*.tmp", "node_modules"],
        &options(),
        &Hooks::new(),
    )?;
    assert_eq!(stats.files_processed, 3);

    let listing = list_archive(&archive)?;
    let names: Vec<_> = listing.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(
        names,
        ["README.md", "src", "src/main.rs", "src/nested", "src/nested/data.bin"]
    );
    assert_eq!(listing.sidecar_digest.as_deref(), Some(stats.digest.as_str()));

    let out = dir.path().join("restored");
    decompress(&archive, &out, true, &options(), &Hooks::new())?;
    assert_eq!(fs::read(out.join("src/nested/data.bin"))?, sample_data(70_000));
    assert!(!out.join("node_modules").exists());
    assert!(!out.join("src/scratch.tmp").exists());
    Ok(())
}

#[test]
fn unchanged_tree_gives_identical_digest() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("project");
    build_tree(&src)?;

    let first = compress_folder::<&str>(&src, &dir.path().join("a.fsp"), 3, &[], &options(), &Hooks::new())?;
    let single = Options {
        parallel_threads: 1,
        ..options()
    };
    let second = compress_folder::<&str>(&src, &dir.path().join("b.fsp"), 3, &[], &single, &Hooks::new())?;
    assert_eq!(first.digest, second.digest);
    assert_eq!(first.original_size, second.original_size);
    Ok(())
}

#[cfg(unix)]
#[test]
fn folder_modes_survive() -> Result<(), Box<dyn std::error::Error>> {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempdir()?;
    let src = dir.path().join("bin");
    fs::create_dir(&src)?;
    fs::write(src.join("run.sh"), b"#!/bin/sh\n")?;
    fs::set_permissions(src.join("run.sh"), fs::Permissions::from_mode(0o750))?;

    let archive = dir.path().join("bin.fsp");
    compress_folder::<&str>(&src, &archive, 3, &[], &options(), &Hooks::new())?;
    let out = dir.path().join("out");
    decompress(&archive, &out, true, &options(), &Hooks::new())?;
    let mode = fs::metadata(out.join("run.sh"))?.permissions().mode();
    assert_eq!(mode & 0o777, 0o750);
    Ok(())
}

#[test]
fn overwrite_replaces_existing_output() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("a.txt");
    fs::write(&src, b"new contents")?;
    let archive = dir.path().join("a.zst");
    fs::write(&archive, b"stale")?;

    let opts = Options {
        overwrite: true,
        ..options()
    };
    compress_file(&src, &archive, 3, &opts, &Hooks::new())?;
    let out = dir.path().join("a.out");
    decompress(&archive, &out, true, &opts, &Hooks::new())?;
    assert_eq!(fs::read(&out)?, b"new contents");
    Ok(())
}

#[test]
fn overwriting_without_digest_drops_the_old_sidecar() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("a.txt");
    let archive = dir.path().join("a.zst");

    fs::write(&src, b"first")?;
    compress_file(&src, &archive, 3, &options(), &Hooks::new())?;
    assert!(hash::sidecar_path(&archive).exists());

    fs::write(&src, b"second contents")?;
    let no_hash = Options {
        overwrite: true,
        write_sidecar: false,
        ..options()
    };
    compress_file(&src, &archive, 3, &no_hash, &Hooks::new())?;
    assert!(!hash::sidecar_path(&archive).exists());

    let out = dir.path().join("a.out");
    let report = decompress(&archive, &out, true, &options(), &Hooks::new())?;
    assert_eq!(report.verification, Verification::MissingSidecar);
    assert_eq!(fs::read(&out)?, b"second contents");
    Ok(())
}

#[test]
fn overwriting_with_digest_replaces_the_sidecar() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("project");
    build_tree(&src)?;
    let archive = dir.path().join("project.fsp");
    let first = compress_folder::<&str>(&src, &archive, 3, &[], &options(), &Hooks::new())?;

    fs::write(src.join("README.md"), b"# changed\n")?;
    let overwrite = Options {
        overwrite: true,
        ..options()
    };
    let second = compress_folder::<&str>(&src, &archive, 3, &[], &overwrite, &Hooks::new())?;
    assert_ne!(first.digest, second.digest);
    assert_eq!(hash::read_sidecar(&archive)?.as_deref(), Some(second.digest.as_str()));

    let out = dir.path().join("restored");
    let report = decompress(&archive, &out, true, &options(), &Hooks::new())?;
    assert_eq!(report.verification, Verification::Verified);
    assert_eq!(fs::read(out.join("README.md"))?, b"# changed\n");
    Ok(())
}

#[test]
fn level_bounds() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("a.txt");
    fs::write(&src, b"bounds")?;

    for level in [0, 23] {
        let archive = dir.path().join(format!("bad.{level}.zst"));
        let err = compress_file(&src, &archive, level, &options(), &Hooks::new()).unwrap_err();
        assert!(matches!(err, SpacerError::InvalidLevel { level: l } if l == level));
        assert!(!archive.exists());
    }
    for level in [1, 22] {
        compress_file(&src, &dir.path().join(format!("ok.{level}.zst")), level, &options(), &Hooks::new())?;
    }
    Ok(())
}

#[test]
fn empty_file_round_trips() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("empty");
    fs::write(&src, b"")?;
    let archive = dir.path().join("empty.zst");

    let stats = compress_file(&src, &archive, 3, &options(), &Hooks::new())?;
    assert_eq!(stats.original_size, 0);
    assert_eq!(
        stats.digest,
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );

    let out = dir.path().join("empty.out");
    let report = decompress(&archive, &out, true, &options(), &Hooks::new())?;
    assert_eq!(report.verification, Verification::Verified);
    assert!(!report.is_folder);
    assert_eq!(fs::read(&out)?.len(), 0);
    Ok(())
}

#[test]
fn cancelled_compression_leaves_no_archive() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let src = dir.path().join("project");
    build_tree(&src)?;
    let cancel = filespacer::CancelFlag::new();
    cancel.cancel();

    let archive = dir.path().join("project.fsp");
    let hooks = Hooks::new().with_cancel(cancel);
    let err = compress_folder::<&str>(&src, &archive, 3, &[], &options(), &hooks).unwrap_err();
    assert!(matches!(err, SpacerError::Cancelled));
    assert!(!archive.exists());
    assert!(!hash::sidecar_path(&archive).exists());
    Ok(())
}
