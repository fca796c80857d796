use std::fmt;

use regex::Regex;

use crate::error::ProxyError;

/// A compiled glob over logical repository paths.
///
/// `*` matches within a single path segment, `?` matches one non-separator
/// character and `**` spans any number of whole directories. Matching is
/// case-sensitive and both sides are normalized to a leading `/`.
#[derive(Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, ProxyError> {
        let normalized = normalize(pattern);
        let regex = Regex::new(&glob_to_regex(&normalized)).map_err(|err| {
            ProxyError::Configuration(format!("invalid path pattern {pattern}: {err}"))
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(&normalize(path))
    }
}

impl fmt::Debug for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GlobPattern").field(&self.source).finish()
    }
}

impl PartialEq for GlobPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

pub fn matches(path: &str, patterns: &[GlobPattern]) -> bool {
    let path = normalize(path);
    patterns.iter().any(|pattern| pattern.regex.is_match(&path))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathFilter {
    pub whitelist: Vec<GlobPattern>,
    pub blacklist: Vec<GlobPattern>,
}

impl PathFilter {
    /// Compiles both lists, dropping (and reporting) patterns that fail to compile.
    pub fn compile(whitelist: &[String], blacklist: &[String]) -> (Self, Vec<ProxyError>) {
        let mut errors = Vec::new();
        let mut compile_all = |patterns: &[String]| {
            patterns
                .iter()
                .filter_map(|pattern| match GlobPattern::new(pattern) {
                    Ok(glob) => Some(glob),
                    Err(err) => {
                        errors.push(err);
                        None
                    }
                })
                .collect::<Vec<_>>()
        };
        let whitelist = compile_all(whitelist);
        let blacklist = compile_all(blacklist);
        (
            Self {
                whitelist,
                blacklist,
            },
            errors,
        )
    }

    pub fn allows(&self, path: &str) -> bool {
        (self.whitelist.is_empty() || matches(path, &self.whitelist))
            && !matches(path, &self.blacklist)
    }
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let chars = pattern.chars().collect::<Vec<_>>();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                let segment_start = i == 0 || chars[i - 1] == '/';
                let next = chars.get(i + 2);
                if segment_start && next == Some(&'/') {
                    out.push_str("(?:[^/]*/)*");
                    i += 3;
                } else if segment_start && next.is_none() && i > 0 {
                    // trailing "/**" also matches the directory itself
                    out.pop();
                    out.push_str("(?:/.*)?");
                    i += 2;
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
                out.push_str("[^/]");
                i += 1;
            }
            ch => {
                out.push_str(&regex::escape(ch.encode_utf8(&mut [0u8; 4])));
                i += 1;
            }
        }
    }
    out.push('$');
    out
}
