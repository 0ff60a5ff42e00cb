//! Glob patterns compiled to anchored regular expressions.
//!
//! `*` matches within one path segment, `**` crosses segments and `?`
//! matches a single non-separator character.

use crate::{TrellisError, TrellisResult};
use regex::Regex;

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> TrellisResult<Self> {
        if pattern.is_empty() {
            return Err(TrellisError::InvalidParameter(
                "glob pattern is empty".to_string(),
            ));
        }
        let regex = Regex::new(&translate(pattern)).map_err(|e| {
            TrellisError::InvalidParameter(format!("invalid glob pattern {}: {}", pattern, e))
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

fn translate(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // "**/" also matches zero directories
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// An ordered set of globs. An empty set matches everything.
#[derive(Debug, Clone, Default)]
pub struct GlobSet {
    globs: Vec<Glob>,
}

impl GlobSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> TrellisResult<Self> {
        let globs = patterns
            .iter()
            .map(|p| Glob::new(p.as_ref()))
            .collect::<TrellisResult<Vec<_>>>()?;
        Ok(Self { globs })
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_empty()
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.globs.is_empty() || self.globs.iter().any(|g| g.is_match(candidate))
    }
}
