//! Scanners discover implicit dependencies (headers and the like) from the
//! content of a node, without those edges being declared.

use crate::canon::{join, parent_dir};

pub trait Scanner: Send + Sync {
    /// Returns canonical graph paths that `path` depends on, given its
    /// content.  `exists` answers whether a candidate path is either on disk
    /// or produced by some build, for scanners that search include paths.
    fn scan(&self, path: &str, content: &[u8], exists: &dyn Fn(&str) -> bool) -> Vec<String>;
}

/// Finds C-preprocessor style `#include "x"` and `#include <x>` lines.
///
/// Quoted includes are looked up next to the including file first; both forms
/// then search `search_path` in order.  Includes that resolve nowhere are
/// dropped: they are system headers as far as the graph is concerned.
pub struct IncludeScanner {
    search_path: Vec<String>,
}

impl IncludeScanner {
    pub fn new<I, S>(search_path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        IncludeScanner {
            search_path: search_path
                .into_iter()
                .map(|p| crate::canon::canon_path(p.as_ref()))
                .collect(),
        }
    }
}

/// Parses one line, returning the included name and whether it was quoted.
fn parse_include(line: &str) -> Option<(&str, bool)> {
    let rest = line.trim_start().strip_prefix('#')?;
    let rest = rest.trim_start().strip_prefix("include")?.trim_start();
    let (close, quoted) = match rest.chars().next()? {
        '"' => ('"', true),
        '<' => ('>', false),
        _ => return None,
    };
    let body = &rest[1..];
    let end = body.find(close)?;
    let name = &body[..end];
    if name.is_empty() {
        return None;
    }
    Some((name, quoted))
}

impl Scanner for IncludeScanner {
    fn scan(&self, path: &str, content: &[u8], exists: &dyn Fn(&str) -> bool) -> Vec<String> {
        let text = String::from_utf8_lossy(content);
        let mut found: Vec<String> = Vec::new();
        for line in text.lines() {
            let (name, quoted) = match parse_include(line) {
                Some(inc) => inc,
                None => continue,
            };
            let local = if quoted {
                Some(join(parent_dir(path), name))
            } else {
                None
            };
            let resolved = local
                .into_iter()
                .chain(self.search_path.iter().map(|dir| join(dir, name)))
                .find(|candidate| exists(candidate));
            if let Some(dep) = resolved {
                if dep != path && !found.contains(&dep) {
                    found.push(dep);
                }
            }
        }
        found
    }
}
