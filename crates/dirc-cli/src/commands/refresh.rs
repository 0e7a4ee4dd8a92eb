use anyhow::Result;
use clap::Args;
use dirc_index::{Pathspec, RefreshFlags, Worktree};

use super::load_index;
use crate::Cli;

#[derive(Args)]
pub struct RefreshArgs {
    /// Also check entries marked assume-unchanged
    #[arg(long)]
    really: bool,

    /// Do not list entries that need updating
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Ignore files missing from the working tree
    #[arg(long = "ignore-missing")]
    ignore_missing: bool,

    /// Do not report unmerged entries
    #[arg(long)]
    unmerged: bool,

    /// Skip submodule entries
    #[arg(long = "ignore-submodules")]
    ignore_submodules: bool,

    #[arg(value_name = "pathspec")]
    paths: Vec<String>,
}

impl RefreshArgs {
    fn flags(&self) -> RefreshFlags {
        let mut flags = RefreshFlags::empty();
        flags.set(RefreshFlags::REALLY, self.really);
        flags.set(RefreshFlags::QUIET, self.quiet);
        flags.set(RefreshFlags::IGNORE_MISSING, self.ignore_missing);
        flags.set(RefreshFlags::UNMERGED, self.unmerged);
        flags.set(RefreshFlags::IGNORE_SUBMODULES, self.ignore_submodules);
        flags
    }
}

pub fn run(args: &RefreshArgs, cli: &Cli) -> Result<i32> {
    let (mut state, config) = load_index(cli)?;
    let worktree = Worktree::new(cli.work_tree(), config.hash_algorithm);
    let report = state.refresh_all(&Pathspec::parse(&args.paths), args.flags(), &config, &worktree);
    for (path, outcome) in &report.outcomes {
        println!("{}: {}", path, outcome.label());
    }
    state.update_if_able(cli.index_path(), &config, Some(&worktree))?;
    Ok(if report.has_errors { 1 } else { 0 })
}
