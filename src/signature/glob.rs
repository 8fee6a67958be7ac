//! Shell-style glob patterns compiled to anchored, case-insensitive regexes.
//!
//! Supported syntax:
//! - `*` matches any run of characters except `/`
//! - `**/` matches zero or more whole path segments
//! - `**` anywhere else (typically trailing) matches everything, separators included
//! - `?` matches exactly one character
//!
//! Every other character is literal. Paths are normalized to forward slashes
//! before matching, so Windows-style paths match the same patterns.

use std::fmt;
use std::path::Path;

use regex::{Regex, RegexBuilder};

/// A compiled glob pattern.
#[derive(Clone)]
pub struct GlobPattern {
    pattern: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(&glob_to_regex(pattern))
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// The pattern as written in the signature pack.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, path: &Path) -> bool {
        self.is_match_str(&path.to_string_lossy())
    }

    pub fn is_match_str(&self, path: &str) -> bool {
        self.regex.is_match(&normalize_separators(path))
    }
}

impl fmt::Debug for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GlobPattern").field(&self.pattern).finish()
    }
}

/// One-shot convenience: compile `pattern` and test `path` against it.
/// Invalid patterns never match.
pub fn matches(path: &str, pattern: &str) -> bool {
    GlobPattern::compile(pattern)
        .map(|g| g.is_match_str(path))
        .unwrap_or(false)
}

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

fn glob_to_regex(pattern: &str) -> String {
    let pattern = normalize_separators(pattern);
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push('.');
                i += 1;
            }
            c => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
                i += 1;
            }
        }
    }

    out.push('$');
    out
}
