//! Mapping of request paths onto the served directory tree.
//!
//! Resolution is purely lexical: the logical path is stripped of the mount
//! prefix and cleaned of `.`/`..` segments before it is joined onto the serve
//! root, so the result can never name anything above the root. Symbolic links
//! inside the tree are left to the host filesystem.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::FileServerError;

/// Percent-decode the path component of a request URI.
pub fn decode_request_path(raw: &str) -> Result<String, FileServerError> {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| FileServerError::InvalidPath(raw.to_string()))
}

/// Subtree-relative logical path (always starting with `/`).
///
/// `override_path` is the `fileName` field of a method-override delete form
/// and replaces the URL path when present.
pub fn logical_path(request_path: &str, override_path: Option<&str>, mount: &str) -> String {
    let mut path = if request_path.starts_with('/') {
        request_path.to_string()
    } else {
        format!("/{}", request_path)
    };

    if let Some(name) = override_path.filter(|name| !name.is_empty()) {
        path = name.to_string();
    }

    let stripped = strip_mount(&path, mount);
    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{}", stripped)
    }
}

/// Remove `mount` from the front of `path`, matching only at a segment boundary.
///
/// The prefix is tried with and without its leading separator.
fn strip_mount<'a>(path: &'a str, mount: &str) -> &'a str {
    if mount.is_empty() {
        return path;
    }

    for prefix in [mount, mount.trim_start_matches('/')] {
        if let Some(rest) = path.strip_prefix(prefix) {
            if rest.is_empty() || rest.starts_with('/') {
                return rest;
            }
        }
    }

    path
}

fn is_separator(c: char) -> bool {
    c == '/' || (cfg!(windows) && c == '\\')
}

/// Lexically clean a logical path into a relative native path.
///
/// `..` pops the previous segment and is clamped at the top, so the result
/// only ever holds normal components.
pub fn clean_relative(logical: &str) -> PathBuf {
    let mut segments: Vec<&str> = Vec::new();
    let mut clamped = false;

    for segment in logical.split(is_separator) {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    clamped = true;
                }
            }
            other => segments.push(other),
        }
    }

    if clamped {
        debug!("Clamped parent traversal above serve root: {:?}", logical);
    }

    let mut relative = PathBuf::new();
    for segment in segments {
        // A segment such as `C:` parses as a prefix on Windows; keep only normal parts.
        for component in Path::new(segment).components() {
            if let Component::Normal(name) = component {
                relative.push(name);
            }
        }
    }
    relative
}

/// Resolve a request onto `root`.
///
/// The returned path is `root` itself or a descendant of it.
pub fn resolve(
    root: &Path,
    mount: &str,
    request_path: &str,
    override_path: Option<&str>,
) -> PathBuf {
    let logical = logical_path(request_path, override_path, mount);
    root.join(clean_relative(&logical))
}

/// Relative path of `full_path` below `root`, always using `/` separators.
pub fn relative_slash_path(root: &Path, full_path: &Path) -> String {
    let Ok(relative) = full_path.strip_prefix(root) else {
        return String::new();
    };

    let mut parts = Vec::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            parts.push(part.to_string_lossy().to_string());
        }
    }

    parts.join("/")
}
