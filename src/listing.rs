//! Directory listing view-model.
//!
//! [`build_listing`] reads the immediate children of a directory and turns
//! them into a [`ListingView`] for a [`crate::render::ListingRenderer`]. It
//! produces data only; no HTML is generated here.

use std::cmp::Ordering;
use std::fs::DirEntry;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::debug;

use crate::dispatch::{TAR_GZ_KEY, ZIP_KEY};
use crate::error::FileServerError;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntryView {
    pub name: String,
    pub size: u64,
    /// Human-scaled size (`10`, `3K`, `2M`, `5G`)
    pub size_label: String,
    /// `YYYY-MM-DD HH:MM:SS`, local time
    pub mod_time: String,
    pub is_dir: bool,
    /// Navigation link, percent-encoded, `/`-terminated for directories
    pub url: String,
    /// Absolute link for copying to the clipboard
    pub copy_url: String,
}

/// Everything the listing page shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingView {
    pub title: String,
    /// Cleaned request path (decoded, no trailing `/`)
    pub req_path: String,
    /// `req_path`, percent-encoded
    pub req_url: String,
    /// Target of the "up" link
    pub parent_path: String,
    pub zip_url: String,
    pub tar_gz_url: String,
    pub allow_upload: bool,
    pub allow_delete: bool,
    pub files: Vec<DirectoryEntryView>,
}

/// Request-side inputs of a listing.
#[derive(Debug, Clone)]
pub struct ListingRequest<'a> {
    /// Decoded URL path as received, mount included
    pub url_path: &'a str,
    /// `Host` header, if any
    pub host: Option<&'a str>,
    /// Normalized mount point (`""` for the root)
    pub mount: &'a str,
    pub title: &'a str,
    pub allow_upload: bool,
    pub allow_delete: bool,
}

/// Format a byte count as a rounded size class.
///
/// Below 1 KiB the exact count is shown; above, the value is divided by
/// 1024, 1024² or 1024³ and rounded half-up. `G` is the largest unit.
pub fn format_size(bytes: u64) -> String {
    let div_by = |unit: u64| (bytes as f64 / unit as f64).round() as u64;
    if bytes < KB {
        bytes.to_string()
    } else if bytes < MB {
        format!("{}K", div_by(KB))
    } else if bytes < GB {
        format!("{}M", div_by(MB))
    } else {
        format!("{}G", div_by(GB))
    }
}

pub fn format_mod_time(time: SystemTime) -> String {
    let local: DateTime<Local> = time.into();
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Directories first, then case-sensitive byte order of the name.
pub fn listing_order(a_dir: bool, a_name: &str, b_dir: bool, b_name: &str) -> Ordering {
    b_dir.cmp(&a_dir).then_with(|| a_name.cmp(b_name))
}

/// Lexically clean a `/`-separated URL path. The result starts with `/` and
/// has no trailing `/` unless it is the root.
pub fn clean_url_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Percent-encode each segment of a `/`-separated path.
pub fn encode_url_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Up link for `req_path`; at (or above) the subtree root it is the mount point.
pub fn parent_url(req_path: &str, mount: &str) -> String {
    let mount_root = if mount.is_empty() { "/" } else { mount };
    if req_path == "/" || req_path == mount_root {
        return mount_root.to_string();
    }

    let parent = match req_path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &req_path[..idx],
    };

    if !mount.is_empty() && !parent.starts_with(mount) {
        return mount_root.to_string();
    }
    encode_url_path(parent)
}

fn join_url(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

struct Child {
    name: String,
    is_dir: bool,
    size: u64,
    modified: SystemTime,
}

/// Row data for one directory entry, or `None` if it vanished after the
/// directory was read.
fn child_from_entry(entry: &DirEntry) -> Result<Option<Child>, FileServerError> {
    let metadata = match entry.metadata() {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("Skipping vanished entry: {}", entry.path().display());
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };

    Ok(Some(Child {
        name: entry.file_name().to_string_lossy().to_string(),
        is_dir: metadata.is_dir(),
        size: metadata.len(),
        modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    }))
}

fn read_children(dir: &Path) -> Result<Vec<Child>, FileServerError> {
    let mut children = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        if let Some(child) = child_from_entry(&entry?)? {
            children.push(child);
        }
    }

    children.sort_by(|a, b| listing_order(a.is_dir, &a.name, b.is_dir, &b.name));
    Ok(children)
}

/// Build the listing of `dir` (blocking).
pub fn build_listing(
    dir: &Path,
    request: &ListingRequest<'_>,
) -> Result<ListingView, FileServerError> {
    let children = read_children(dir)?;

    let req_path = clean_url_path(request.url_path);
    let encoded_dir = encode_url_path(&req_path);
    let host = request.host.unwrap_or("localhost");

    let files = children
        .into_iter()
        .map(|child| {
            let mut url = join_url(&encoded_dir, &urlencoding::encode(&child.name));
            if child.is_dir {
                url.push('/');
            }
            DirectoryEntryView {
                size_label: format_size(child.size),
                mod_time: format_mod_time(child.modified),
                copy_url: format!("http://{}{}", host, url),
                url,
                name: child.name,
                size: child.size,
                is_dir: child.is_dir,
            }
        })
        .collect();

    let archive_base = join_url(&encoded_dir, "");
    Ok(ListingView {
        title: request.title.to_string(),
        parent_path: parent_url(&req_path, request.mount),
        zip_url: format!("{}?{}=true", archive_base, ZIP_KEY),
        tar_gz_url: format!("{}?{}=true", archive_base, TAR_GZ_KEY),
        allow_upload: request.allow_upload,
        allow_delete: request.allow_delete,
        req_url: encoded_dir,
        req_path,
        files,
    })
}
