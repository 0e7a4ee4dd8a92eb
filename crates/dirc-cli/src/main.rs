mod commands;

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Result};
use clap::{error::ErrorKind, Parser};
use dirc_hash::HashAlgorithm;
use dirc_index::IndexConfig;
use tracing_subscriber::EnvFilter;

use commands::Commands;

#[derive(Parser)]
#[command(name = "dirc", about = "Inspect and rewrite index files", version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Run as if started in <path>
    #[arg(short = 'C', global = true)]
    change_dir: Option<PathBuf>,

    /// Index file to operate on (default: $GIT_INDEX_FILE or .git/index)
    #[arg(short = 'f', long = "file", global = true)]
    index_file: Option<PathBuf>,

    /// Working tree root for stat and content checks
    #[arg(long = "work-tree", global = true)]
    work_tree: Option<PathBuf>,

    /// Hash algorithm of the index (sha1 or sha256)
    #[arg(long = "object-format", global = true, default_value = "sha1")]
    object_format: String,

    /// Do not verify the trailing checksum when loading
    #[arg(long = "skip-hash-check", global = true)]
    skip_hash_check: bool,
}

impl Cli {
    pub fn index_path(&self) -> PathBuf {
        if let Some(path) = &self.index_file {
            return path.clone();
        }
        match std::env::var_os("GIT_INDEX_FILE") {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(".git/index"),
        }
    }

    pub fn work_tree(&self) -> PathBuf {
        self.work_tree.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn config(&self) -> Result<IndexConfig> {
        let Some(algo) = HashAlgorithm::from_name(&self.object_format) else {
            bail!("unknown object format '{}'", self.object_format);
        };
        Ok(IndexConfig::from_env()
            .with_hash_algorithm(algo)
            .with_skip_hash_check(self.skip_hash_check))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("DIRC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => process::exit(0),
                _ => process::exit(128),
            }
        }
    };
    init_tracing();

    if let Some(dir) = &cli.change_dir {
        if let Err(e) = std::env::set_current_dir(dir) {
            eprintln!("fatal: cannot change to '{}': {}", dir.display(), e);
            process::exit(128);
        }
    }

    match commands::run(&cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("fatal: {e:#}");
            process::exit(128);
        }
    }
}
