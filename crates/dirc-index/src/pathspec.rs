//! Pathspec matching for entry filtering.
//!
//! A pattern is a literal path, a directory prefix (`src` matches
//! `src/main.rs`), or a stem with a single trailing `*` (`src/ma*`).
//! `:!` / `:^` turn a pattern into an exclusion.

use bstr::{BStr, BString, ByteSlice};

/// Anything that can decide whether a path is selected.
pub trait PathMatch {
    fn matches(&self, path: &BStr) -> bool;
}

impl<F> PathMatch for F
where
    F: Fn(&BStr) -> bool,
{
    fn matches(&self, path: &BStr) -> bool {
        self(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathspecPattern {
    /// Pattern text after any magic prefix and without a trailing `/`.
    pub pattern: BString,
    pub exclude: bool,
    /// Pattern ended in `*`: match any path starting with the stem.
    pub prefix_glob: bool,
}

/// A set of patterns; a path matches when some include pattern matches and
/// no exclude pattern does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pathspec {
    pub patterns: Vec<PathspecPattern>,
}

impl Pathspec {
    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> Self {
        Pathspec {
            patterns: patterns
                .iter()
                .map(|p| PathspecPattern::parse(p.as_ref()))
                .collect(),
        }
    }

    /// Matches every path.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl PathMatch for Pathspec {
    fn matches(&self, path: &BStr) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let has_includes = self.patterns.iter().any(|p| !p.exclude);
        let mut included = !has_includes;
        for pat in &self.patterns {
            if pat.matches_path(path) {
                if pat.exclude {
                    return false;
                }
                included = true;
            }
        }
        included
    }
}

impl PathspecPattern {
    pub fn parse(input: &str) -> Self {
        let (exclude, rest) = match input
            .strip_prefix(":!")
            .or_else(|| input.strip_prefix(":^"))
        {
            Some(rest) => (true, rest),
            None => (false, input),
        };
        let (prefix_glob, stem) = match rest.strip_suffix('*') {
            Some(stem) => (true, stem),
            None => (false, rest.trim_end_matches('/')),
        };
        PathspecPattern {
            pattern: BString::from(stem),
            exclude,
            prefix_glob,
        }
    }

    fn matches_path(&self, path: &BStr) -> bool {
        let pat = self.pattern.as_bytes();
        if self.prefix_glob {
            return path.starts_with(pat);
        }
        if pat.is_empty() || pat == b"." {
            return true;
        }
        path.starts_with(pat) && (path.len() == pat.len() || path[pat.len()] == b'/')
    }
}
