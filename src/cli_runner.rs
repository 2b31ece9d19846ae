//! Command execution for the `filespacer` binary.
//!
//! Turns parsed [`Args`] into calls of the [`ops`](crate::ops) API, renders progress on
//! stderr and prints results on stdout.

use crate::cli::{self, Args, Commands, GlobalArgs};
use crate::common::CompressionStats;
use crate::config::{self, Options, ZipMode};
use crate::error::SpacerError;
use crate::fsx;
use crate::ops;
use crate::progress::{Hooks, ProgressState};
use crate::zip::ExtractSummary;

use serde_json::json;
use std::io::{self, IsTerminal, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Installs the stderr log subscriber. `RUST_LOG` takes precedence over the flags.
pub fn init_logging(global: &GlobalArgs) {
    let default = if global.quiet {
        "error"
    } else if global.verbose {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
}

/// Loads the options snapshot: the explicit config file (errors are fatal), else the
/// per-user file (errors are warnings), then command-line overrides.
pub fn load_options(global: &GlobalArgs) -> Result<Options, SpacerError> {
    let mut options = match &global.config {
        Some(path) => Options::load(path)?,
        None => Options::load_default(),
    };
    if let Some(threads) = global.threads {
        options.parallel_threads = threads;
    }
    if let Some(chunk_size) = global.chunk_size {
        options.chunk_size = chunk_size;
    }
    options.validate()?;
    Ok(options)
}

fn hooks_for(operation: &str, global: &GlobalArgs) -> Hooks {
    if global.quiet || !io::stderr().is_terminal() {
        return Hooks::new();
    }
    Hooks::new().with_progress(create_cli_progress_callback(operation))
}

/// Runs one command. Returns `Ok(false)` when the command finished but some ZIP entries
/// failed, which the binary turns into a non-zero exit code.
pub fn run_cli_app(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let global = args.global;

    match args.command {
        Commands::Compress { input, output, level, exclude, no_hash, force, stats, json } => {
            let mut options = load_options(&global)?;
            options.overwrite |= force;
            options.write_sidecar &= !no_hash;
            let level = level.unwrap_or(options.compression_level);
            let hooks = hooks_for("compress", &global);

            let result = if input.is_dir() {
                ops::compress_folder(&input, &output, level, &exclude, &options, &hooks)?
            } else {
                ops::compress_file(&input, &output, level, &options, &hooks)?
            };
            print_compression(&result, &output, stats, json)?;
        }
        Commands::Decompress { input, output, no_verify, force, json } => {
            let mut options = load_options(&global)?;
            options.overwrite |= force;
            let verify = options.verify_integrity && !no_verify;
            let hooks = hooks_for("decompress", &global);

            let report = ops::decompress(&input, &output, verify, &options, &hooks)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Restored {} -> {} ({} bytes{}, integrity: {:?})",
                    input.display(),
                    output.display(),
                    report.decompressed_size,
                    if report.is_folder {
                        format!(", {} entries", report.entries_restored)
                    } else {
                        String::new()
                    },
                    report.verification
                );
            }
        }
        Commands::Extract {
            archive,
            output,
            exclude,
            password,
            ask_password,
            no_verify,
            recover,
            strict,
            force,
            json,
        } => {
            let mut options = load_options(&global)?;
            options.overwrite |= force;
            options.verify_integrity &= !no_verify;
            if recover {
                options.zip_mode = ZipMode::Recovery;
            } else if strict {
                options.zip_mode = ZipMode::Strict;
            }
            let password = cli::get_password(password, ask_password)?;
            let hooks = hooks_for("extract", &global);

            let summary = ops::extract_zip(&archive, &output, password.as_deref(), &exclude, &options, &hooks)?;
            print_extract_summary(&summary, json)?;
            return Ok(summary.is_complete());
        }
        Commands::List { archive, json } => {
            let options = load_options(&global)?;
            if ops::looks_like_zip(&archive)? {
                print_zip_listing(&ops::list_zip(&archive, &options)?, json)?;
            } else {
                print_archive_listing(&ops::list_archive(&archive)?, json)?;
            }
        }
        Commands::Config { show, init } => {
            let path = match global.config.clone().or_else(config::default_config_path) {
                Some(path) => path,
                None => return Err("cannot determine the configuration path".into()),
            };
            if init {
                let text = Options::default().to_json_pretty()?;
                fsx::write_atomic(&path, format!("{text}\n").as_bytes(), false)?;
                println!("Wrote default configuration to {}", path.display());
            }
            if show || !init {
                let options = load_options(&global)?;
                println!("# {}", path.display());
                println!("{}", options.to_json_pretty()?);
            }
        }
    }
    Ok(true)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

fn print_compression(
    result: &CompressionStats,
    output: &Path,
    stats: bool,
    json_out: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if json_out {
        let value = json!({
            "output": output,
            "original_size": result.original_size,
            "compressed_size": result.compressed_size,
            "compression_ratio": result.compression_ratio,
            "files_processed": result.files_processed,
            "elapsed_secs": result.elapsed.as_secs_f64(),
            "speed_mbps": result.speed_mbps(),
            "sha256": result.digest,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("Compressed to {}", output.display());
    if stats {
        println!("  Original size:   {}", format_bytes(result.original_size));
        println!("  Compressed size: {}", format_bytes(result.compressed_size));
        println!("  Ratio:           {:.2}x", result.compression_ratio);
        println!("  Files processed: {}", result.files_processed);
        println!("  Duration:        {:.2}s", result.elapsed.as_secs_f64());
        println!("  Speed:           {:.1} MB/s", result.speed_mbps());
    }
    println!("  SHA256: {}", result.digest);
    Ok(())
}

fn print_extract_summary(summary: &ExtractSummary, json_out: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json_out {
        let value = json!({
            "mode": if summary.mode.is_recovery() { "recovery" } else { "central_directory" },
            "extracted": summary.extracted.iter().map(|e| json!({
                "name": e.name,
                "path": e.path,
                "size": e.size,
                "warnings": e.warnings,
            })).collect::<Vec<_>>(),
            "skipped": summary.skipped,
            "failed": summary.failed.iter().map(|f| json!({
                "name": f.name,
                "header_offset": f.header_offset,
                "error": f.error.to_string(),
            })).collect::<Vec<_>>(),
            "warnings": summary.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for warning in &summary.warnings {
        println!("warning: {warning}");
    }
    for entry in &summary.extracted {
        for warning in &entry.warnings {
            println!("warning: {}: {}", entry.name, warning);
        }
    }
    for failed in &summary.failed {
        println!(
            "FAILED {} (header at {}): {}",
            failed.name, failed.header_offset, failed.error
        );
    }
    println!(
        "Extracted {} entries ({}), {} skipped, {} failed",
        summary.extracted.len(),
        format_bytes(summary.bytes_written()),
        summary.skipped.len(),
        summary.failed.len()
    );
    Ok(())
}

fn print_zip_listing(listing: &ops::ZipListing, json_out: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json_out {
        let value = json!({
            "format": "zip",
            "recovered": listing.mode.is_recovery(),
            "entries": listing.entries.iter().map(|e| json!({
                "name": e.name,
                "method": e.method.name(),
                "compressed_size": e.compressed_size,
                "size": e.uncompressed_size,
                "encrypted": e.is_encrypted(),
                "warnings": e.warnings,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    if let crate::zip::ParseMode::Recovery { reason } = &listing.mode {
        println!("(recovered from local headers: {reason})");
    }
    for entry in &listing.entries {
        println!(
            "{:>12}  {:<8} {}{}",
            entry.uncompressed_size,
            entry.method.name(),
            entry.name,
            if entry.is_encrypted() { "  [encrypted]" } else { "" }
        );
    }
    println!("ZIP archive: {} entries", listing.entries.len());
    Ok(())
}

fn print_archive_listing(listing: &ops::ArchiveListing, json_out: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json_out {
        let value = json!({
            "format": if listing.is_folder { "folder" } else { "file" },
            "compressed_size": listing.compressed_size,
            "sha256": listing.sidecar_digest,
            "entries": listing.entries.iter().map(|e| json!({
                "path": e.path,
                "size": e.size,
                "is_dir": e.is_dir,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!(
        "{} archive, {}",
        if listing.is_folder { "Folder" } else { "Single-file" },
        format_bytes(listing.compressed_size)
    );
    match &listing.sidecar_digest {
        Some(digest) => println!("SHA256: {digest}"),
        None => println!("SHA256: (no digest file)"),
    }
    for entry in &listing.entries {
        if entry.is_dir {
            println!("{:>12}  {}/", "-", entry.path);
        } else {
            println!("{:>12}  {}", entry.size, entry.path);
        }
    }
    Ok(())
}

// --- utils for CLI progress -------------------------------------------------

fn create_cli_progress_callback(operation: &str) -> impl Fn(u64, u64) + Send + Sync + 'static {
    let operation = operation.to_string();
    let start_time = Instant::now();
    let last_update = Arc::new(Mutex::new(Instant::now()));
    let prev_len = Arc::new(Mutex::new(0usize));
    let done = Arc::new(AtomicBool::new(false));

    move |processed: u64, total: u64| {
        if done.load(Ordering::Relaxed) {
            return;
        }
        let state = ProgressState::from_counts(processed, total, start_time.elapsed());
        let now = Instant::now();
        // Redraw at most every 100ms, but always show completion
        let should_update = state.progress_percent >= 100.0 || {
            match last_update.lock() {
                Ok(mut last) if now.duration_since(*last).as_millis() >= 100 => {
                    *last = now;
                    true
                }
                _ => false,
            }
        };
        if !should_update {
            return;
        }

        // Determine terminal width (default 80)
        let term_width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80);

        let remaining = state.estimated_time_remaining().as_secs_f32();
        let eta_str = if state.speed_mbps > 0.0 && state.progress_percent > 0.0 {
            if remaining > 60.0 {
                format!("{:.1}m", remaining / 60.0)
            } else {
                format!("{remaining:.1}s")
            }
        } else {
            "--".to_string()
        };

        let build_status_line = |bw: usize| -> String {
            let filled = ((state.progress_percent / 100.0) * bw as f32) as usize;
            let empty = bw.saturating_sub(filled);
            format!(
                "[{}] [{}{}] {:.1}% | {:.1} MB/s | ETA: {}",
                operation.to_uppercase(),
                "█".repeat(filled),
                "░".repeat(empty),
                state.progress_percent,
                state.speed_mbps,
                eta_str
            )
        };

        let mut bar_len = 40usize;
        let status_line = loop {
            let line = build_status_line(bar_len);
            if line.chars().count() <= term_width || bar_len <= 10 {
                break line;
            }
            bar_len -= 4;
        };

        let mut line_to_print = status_line;
        if let Ok(mut prev) = prev_len.lock() {
            let len = line_to_print.chars().count();
            if *prev > len {
                line_to_print.push_str(&" ".repeat(*prev - len));
            }
            *prev = len;
        }
        eprint!("\r\x1B[2K{line_to_print}");
        io::stderr().flush().ok();

        if state.progress_percent >= 100.0 {
            eprintln!();
            done.store(true, Ordering::Relaxed);
        }
    }
}
