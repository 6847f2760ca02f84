//! Logical path utilities
//!
//! Logical paths are '/'-separated, normalized (no duplicate separators, no
//! trailing '/') strings independent of physical placement. The cache's
//! directory-prefix range scans rely on these helpers.

/// Normalize a logical path: collapse duplicate separators, strip any
/// trailing '/' (the root stays "/").
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_sep = false;
    for c in path.chars() {
        if c == '/' {
            if !last_was_sep {
                out.push('/');
            }
            last_was_sep = true;
        } else {
            out.push(c);
            last_was_sep = false;
        }
    }
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Join a directory path and a relative name.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return normalize(name);
    }
    if name.is_empty() {
        return normalize(dir);
    }
    normalize(&format!("{}/{}", dir, name))
}

/// Parent directory of a path, or None for the root / a bare name.
pub fn parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        if trimmed.len() > 1 {
            Some("/")
        } else {
            None
        }
    } else {
        Some(&trimmed[..idx])
    }
}

/// Final component of a path.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// True when `path` lies strictly below directory `dir`.
///
/// "/a/bb" is a strict prefix of "/a/bb/c" but not of "/a/bbb.txt".
pub fn is_strict_prefix(dir: &str, path: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        return !path.is_empty();
    }
    path.len() > dir.len() + 1 && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// The portion of `path` below directory `dir`, if any.
pub fn relative_to<'a>(dir: &str, path: &'a str) -> Option<&'a str> {
    if !is_strict_prefix(dir, path) {
        return None;
    }
    Some(&path[dir.trim_end_matches('/').len() + 1..])
}
