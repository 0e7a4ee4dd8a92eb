pub mod convert;
pub mod dump_dirs;
pub mod ls;
pub mod refresh;
pub mod unmerge;
pub mod verify;

use anyhow::{Context, Result};
use clap::Subcommand;
use dirc_index::{IndexConfig, IndexState};

use crate::Cli;

#[derive(Subcommand)]
pub enum Commands {
    /// List index entries
    Ls(ls::LsArgs),
    /// Rewrite the index in another format version
    Convert(convert::ConvertArgs),
    /// Re-check stat data against the working tree
    Refresh(refresh::RefreshArgs),
    /// Recreate conflicts from resolve-undo data
    Unmerge(unmerge::UnmergeArgs),
    /// Check that the index decodes cleanly
    Verify,
    /// Print the directory records of a version 5 index
    DumpDirs,
}

pub fn run(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Commands::Ls(args) => ls::run(args, cli),
        Commands::Convert(args) => convert::run(args, cli),
        Commands::Refresh(args) => refresh::run(args, cli),
        Commands::Unmerge(args) => unmerge::run(args, cli),
        Commands::Verify => verify::run(cli),
        Commands::DumpDirs => dump_dirs::run(cli),
    }
}

/// Load the index named on the command line.
pub(crate) fn load_index(cli: &Cli) -> Result<(IndexState, IndexConfig)> {
    let config = cli.config()?;
    let path = cli.index_path();
    let state = IndexState::load(&path, &config)
        .with_context(|| format!("unable to read index file '{}'", path.display()))?;
    Ok((state, config))
}
