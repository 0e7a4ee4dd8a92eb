use anyhow::{bail, Result};
use clap::Args;
use dirc_index::Worktree;

use super::load_index;
use crate::Cli;

#[derive(Args)]
pub struct ConvertArgs {
    /// Target format version (2 to 5)
    #[arg(long = "to", value_name = "version")]
    to: u32,
}

pub fn run(args: &ConvertArgs, cli: &Cli) -> Result<i32> {
    if !(2..=5).contains(&args.to) {
        bail!("index version {} is not supported (2 to 5)", args.to);
    }
    let (mut state, config) = load_index(cli)?;
    let from = state.version();
    state.set_version(args.to);
    let worktree = Worktree::new(cli.work_tree(), config.hash_algorithm);
    state.write(cli.index_path(), &config, Some(&worktree))?;
    tracing::info!(from = ?from, to = args.to, "converted index");
    Ok(0)
}
