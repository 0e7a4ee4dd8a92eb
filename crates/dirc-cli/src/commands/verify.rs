use anyhow::{Context, Result};
use dirc_index::MappedIndex;

use crate::Cli;

pub fn run(cli: &Cli) -> Result<i32> {
    let config = cli.config()?;
    let path = cli.index_path();
    let mapped = MappedIndex::open(&path, &config)
        .with_context(|| format!("unable to map index file '{}'", path.display()))?;
    let state = mapped.load()?;
    println!(
        "version {}: {} entries, {} resolve-undo records, cache tree {}",
        mapped.version(),
        state.len(),
        state.resolve_undo_entries().len(),
        if state.cache_tree().is_some() { "present" } else { "absent" },
    );
    for signature in state.unknown_extensions() {
        println!("skipped extension {}", String::from_utf8_lossy(signature));
    }
    Ok(0)
}
