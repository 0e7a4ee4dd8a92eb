use std::io::{self, Write};

use anyhow::Result;
use bstr::ByteSlice;
use clap::Args;
use dirc_index::{PathMatch, Pathspec, Stage};

use super::load_index;
use crate::Cli;

#[derive(Args)]
pub struct LsArgs {
    /// Show mode, hash and stage for each entry
    #[arg(short = 's', long)]
    stage: bool,

    /// Show only unmerged entries (implies --stage)
    #[arg(short = 'u', long)]
    unmerged: bool,

    /// Show resolve-undo records instead of entries
    #[arg(long = "resolve-undo")]
    resolve_undo: bool,

    /// Paths to list (default: all)
    #[arg(value_name = "pathspec")]
    paths: Vec<String>,
}

pub fn run(args: &LsArgs, cli: &Cli) -> Result<i32> {
    let (state, _) = load_index(cli)?;
    let pathspec = Pathspec::parse(&args.paths);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.resolve_undo {
        for (path, info) in state.resolve_undo_entries() {
            if !pathspec.matches(path.as_bstr()) {
                continue;
            }
            for (stage, mode, hash) in info.stages() {
                writeln!(out, "{:06o} {} {}\t{}", mode, hash, stage.as_u8(), path)?;
            }
        }
        return Ok(0);
    }

    let show_stage = args.stage || args.unmerged;
    for entry in state.entries() {
        if !pathspec.matches(entry.path()) || (args.unmerged && entry.stage == Stage::Normal) {
            continue;
        }
        if show_stage {
            writeln!(
                out,
                "{:06o} {} {}\t{}",
                entry.mode.raw(),
                entry.hash,
                entry.stage.as_u8(),
                entry.path
            )?;
        } else {
            writeln!(out, "{}", entry.path)?;
        }
    }
    Ok(0)
}
