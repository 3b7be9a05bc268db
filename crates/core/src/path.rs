//! Normalized, absolute, slash-separated paths.
//!
//! All paths handled by the engine are rooted at `/`. Two paths are equal
//! when their normalized strings are equal, and "inside" is a rooted-prefix
//! test on path segments.

/// The root path.
pub const ROOT: &str = "/";

/// Normalize `path` into its canonical absolute form.
///
/// Repeated slashes collapse, `.` segments vanish, `..` pops a segment (never
/// above the root) and the trailing slash is removed.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return ROOT.to_string();
    }

    let mut out = String::with_capacity(path.len() + 1);
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

/// Join a child name (or relative path) onto a normalized parent.
pub fn join(parent: &str, child: &str) -> String {
    normalize(&format!("{}/{}", parent, child))
}

/// The parent of a normalized path, or `None` for the root.
pub fn parent(path: &str) -> Option<String> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT.to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// The final segment of a normalized path (empty for the root).
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Whether `path` is `root` itself or lies beneath it.
pub fn is_inside(root: &str, path: &str) -> bool {
    if root == ROOT {
        return path.starts_with('/');
    }
    match path.strip_prefix(root) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Whether `path` lies strictly beneath `root`.
pub fn is_strictly_inside(root: &str, path: &str) -> bool {
    path != root && is_inside(root, path)
}

/// Iterate the segments of a normalized path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}
