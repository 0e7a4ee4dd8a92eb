use anyhow::Result;
use clap::Args;
use dirc_index::{Pathspec, Worktree};

use super::load_index;
use crate::Cli;

#[derive(Args)]
pub struct UnmergeArgs {
    #[arg(value_name = "pathspec")]
    paths: Vec<String>,
}

pub fn run(args: &UnmergeArgs, cli: &Cli) -> Result<i32> {
    let (mut state, config) = load_index(cli)?;
    let restored = state.unmerge_matching(&Pathspec::parse(&args.paths));
    for path in &restored {
        println!("{path}");
    }
    if !restored.is_empty() {
        let worktree = Worktree::new(cli.work_tree(), config.hash_algorithm);
        state.write(cli.index_path(), &config, Some(&worktree))?;
    }
    Ok(0)
}
