//! Path canonicalization.
//!
//! Node identity is the canonical spelling of a path, so two declarations of
//! "src/./a.c" and "src/a.c" land on the same node.

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, but only simplifies things like
/// "foo/./bar" => "foo/bar" and "foo/../bar" => "bar".
/// Backslashes are treated as separators so Windows-style spellings intern
/// to the same node.
pub fn canon_path<T: AsRef<str>>(inpath: T) -> String {
    let path = inpath.as_ref();
    let absolute = path.starts_with('/') || path.starts_with('\\');

    let mut components: Vec<&str> = Vec::new();
    // Count of leading ".." components that could not be popped.
    let mut ups = 0;
    for component in path.split(|c| c == '/' || c == '\\') {
        match component {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() && !absolute {
                    ups += 1;
                }
            }
            _ => components.push(component),
        }
    }

    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    for _ in 0..ups {
        out.push_str("../");
    }
    for (i, component) in components.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(component);
    }
    if out.ends_with('/') && out.len() > 1 {
        out.pop();
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// The directory part of a canonical path, "." for top-level names.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => ".",
    }
}

/// The final component of a canonical path.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// If `path` lies strictly beneath `dir` (both canonical), returns the
/// remainder of `path` relative to `dir`.
pub fn strip_dir<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    if dir == "." {
        if path.starts_with("../") || path.starts_with('/') || path == "." || path == ".." {
            return None;
        }
        return Some(path);
    }
    let rest = path.strip_prefix(dir)?;
    let rest = if dir.ends_with('/') {
        rest
    } else {
        rest.strip_prefix('/')?
    };
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Joins a canonical directory and a relative name, canonicalizing the result.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "." || dir.is_empty() {
        canon_path(name)
    } else {
        canon_path(format!("{}/{}", dir, name))
    }
}
