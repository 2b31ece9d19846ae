use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

/// Environment variable consulted for the ZIP password when none is given on the command line.
pub const PASSWORD_ENV: &str = "FILESPACER_PASSWORD";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every subcommand.
#[derive(ClapArgs, Clone, Debug, Default)]
pub struct GlobalArgs {
    /// Show debug output.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only show errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file to load instead of ~/.filespacer/config.json.
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of worker threads. [default: from config, else CPU count]
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    /// Bytes processed per step (4096 to 16777216). [default: from config, else 1 MiB]
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Compress a file or a folder into a single zstd archive.
    #[command(alias = "c")]
    Compress {
        /// File or directory to compress.
        input: PathBuf,

        /// Path of the archive to create.
        output: PathBuf,

        /// Zstandard compression level (1-22). [default: from config, else 3]
        #[arg(short, long)]
        level: Option<i32>,

        /// Glob pattern of paths to leave out of a folder archive. May be repeated.
        #[arg(short, long = "exclude", value_name = "PATTERN")]
        exclude: Vec<String>,

        /// Do not write the .sha256 digest file.
        #[arg(long)]
        no_hash: bool,

        /// Replace the output if it exists.
        #[arg(short, long)]
        force: bool,

        /// Print compression statistics.
        #[arg(long)]
        stats: bool,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Restore a file or folder from an archive made by `compress`.
    #[command(alias = "d")]
    Decompress {
        /// Archive to read.
        input: PathBuf,

        /// Output file or directory.
        output: PathBuf,

        /// Skip the digest check.
        #[arg(long)]
        no_verify: bool,

        /// Replace the output if it exists.
        #[arg(short, long)]
        force: bool,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Extract a ZIP archive, recovering what it can from damaged ones.
    #[command(alias = "x")]
    Extract {
        /// ZIP file to extract.
        archive: PathBuf,

        /// Output directory.
        output: PathBuf,

        /// Glob pattern of entries to skip. May be repeated.
        #[arg(short, long = "exclude", value_name = "PATTERN")]
        exclude: Vec<String>,

        /// Password for encrypted entries. Falls back to FILESPACER_PASSWORD.
        #[arg(short, long, conflicts_with = "ask_password")]
        password: Option<String>,

        /// Prompt for the password without echoing it.
        #[arg(long)]
        ask_password: bool,

        /// Skip CRC checks.
        #[arg(long)]
        no_verify: bool,

        /// Ignore the central directory and scan local headers.
        #[arg(long, conflicts_with = "strict")]
        recover: bool,

        /// Fail instead of falling back to the recovery scan.
        #[arg(long)]
        strict: bool,

        /// Replace files that already exist.
        #[arg(short, long)]
        force: bool,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show what an archive or ZIP file contains.
    #[command(alias = "l")]
    List {
        /// Archive or ZIP file.
        archive: PathBuf,

        /// Print the listing as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show or create the configuration file.
    Config {
        /// Print the effective configuration.
        #[arg(long)]
        show: bool,

        /// Write the default configuration to the config path.
        #[arg(long)]
        init: bool,
    },
}

/// Gets the password from the command-line option, the `FILESPACER_PASSWORD` environment
/// variable, or an interactive prompt when `ask` is set.
///
/// Priority:
/// 1. `--password` command-line argument.
/// 2. `--ask-password` prompt.
/// 3. `FILESPACER_PASSWORD` environment variable.
pub fn get_password(password_opt: Option<String>, ask: bool) -> Result<Option<String>, std::io::Error> {
    if let Some(pass) = password_opt {
        return Ok(Some(pass));
    }
    if ask {
        return rpassword::prompt_password("Password: ").map(Some);
    }
    if let Ok(pass) = std::env::var(PASSWORD_ENV) {
        return Ok(Some(pass));
    }
    Ok(None)
}

/// Parses command-line arguments using `clap`.
pub fn parse() -> Args {
    Args::parse()
}
