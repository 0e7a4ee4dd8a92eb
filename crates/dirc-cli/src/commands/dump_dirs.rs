use std::io::{self, Write};

use anyhow::Result;
use dirc_index::MappedIndex;

use crate::Cli;

pub fn run(cli: &Cli) -> Result<i32> {
    let mapped = MappedIndex::open(cli.index_path(), &cli.config()?)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for dir in mapped.directories()? {
        let tree = match dir.hash {
            Some(hash) => format!("{} {}", dir.nentries, hash),
            None => "invalid".to_string(),
        };
        let path = if dir.path.is_empty() { "/".to_string() } else { dir.path.to_string() };
        writeln!(
            out,
            "{path}\tsubtrees={} files={} conflicts={} tree={tree}",
            dir.nsubtrees, dir.nfiles, dir.ncr
        )?;
    }
    Ok(0)
}
