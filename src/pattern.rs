//! Glob-style exclusion rules over archive paths.
//!
//! Patterns understand `*` (any run of characters inside one path segment), `?` (one
//! character other than `/`) and `**` (any run of characters, `/` included). A pattern
//! without a `/` is compared with the last component of a path, so `*.tmp` or
//! `node_modules` apply at any depth. A pattern containing `/` is compared with the
//! whole relative path, which makes `dir/*` match the direct children of `dir` only.
//! Matching is case-sensitive and does not depend on pattern order.

use crate::error::{Result, SpacerError};
use regex::Regex;

#[derive(Debug, Clone)]
struct CompiledPattern {
    regex: Regex,
    whole_path: bool,
}

/// A compiled, order-independent set of exclusion patterns.
#[derive(Debug, Clone, Default)]
pub struct ExcludeRules {
    patterns: Vec<CompiledPattern>,
}

impl ExcludeRules {
    /// Compiles the given glob patterns. Blank patterns are ignored.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let raw = raw.as_ref();
            let trimmed = raw.trim_end_matches('/');
            let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
            let whole_path = trimmed.contains('/');
            let body = trimmed.trim_start_matches('/');
            if body.is_empty() {
                continue;
            }
            let regex = Regex::new(&glob_to_regex(body))
                .map_err(|e| SpacerError::InvalidOptions(format!("bad pattern '{raw}': {e}")))?;
            compiled.push(CompiledPattern {
                regex,
                whole_path,
            });
        }
        Ok(Self { patterns: compiled })
    }

    /// True if any pattern matches `path` itself.
    pub fn matches(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let path = normalize(path);
        self.matches_normalized(&path)
    }

    /// True if `path` or one of its ancestor directories is matched.
    ///
    /// Used for ZIP entries, whose parent directories usually have no entry of their own.
    pub fn is_excluded(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let path = normalize(path);
        let mut end = 0;
        for segment in path.split('/') {
            end += segment.len();
            if self.matches_normalized(&path[..end]) {
                return true;
            }
            end += 1;
        }
        false
    }

    fn matches_normalized(&self, path: &str) -> bool {
        let basename = path.rsplit('/').next().unwrap_or(path);
        self.patterns.iter().any(|p| {
            let candidate = if p.whole_path { path } else { basename };
            p.regex.is_match(candidate)
        })
    }
}

/// Returns true if `path` matches any of `patterns`.
///
/// Convenience wrapper over [`ExcludeRules`]; a pattern that cannot be compiled never matches.
pub fn matches<S: AsRef<str>>(path: &str, patterns: &[S]) -> bool {
    match ExcludeRules::new(patterns) {
        Ok(rules) => rules.matches(path),
        Err(e) => {
            tracing::warn!("ignoring exclusion patterns: {e}");
            false
        }
    }
}

fn normalize(path: &str) -> String {
    let s = path.replace('\\', "/");
    let s = s.strip_prefix("./").unwrap_or(&s);
    s.trim_matches('/').to_string()
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut chars = glob.chars().peekable();
    let mut buf = [0u8; 4];
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    out.push('$');
    out
}
