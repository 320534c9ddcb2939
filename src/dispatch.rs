//! Request classification.
//!
//! Every request is reduced to exactly one [`RequestAction`] by [`classify`],
//! a pure function over the stat outcome of the resolved path, the HTTP verb,
//! the archive query flags and the configured capabilities. The handler then
//! performs that single action.

use std::io;

use axum::extract::Query;
use axum::http::{Method, Uri};
use serde::Deserialize;

pub const ZIP_KEY: &str = "zip";
pub const TAR_GZ_KEY: &str = "tar.gz";

/// Result of stat-ing the resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatOutcome {
    Missing,
    Denied,
    Failed,
    Found { is_dir: bool },
}

impl StatOutcome {
    pub fn from_metadata(result: &io::Result<std::fs::Metadata>) -> Self {
        match result {
            Ok(metadata) => Self::Found {
                is_dir: metadata.is_dir(),
            },
            Err(err) => match err.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => Self::Missing,
                io::ErrorKind::PermissionDenied => Self::Denied,
                _ => Self::Failed,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub allow_upload: bool,
    pub allow_delete: bool,
}

/// Archive selectors from the query string (`?zip=true`, `?tar.gz=true`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveQuery {
    pub zip: Option<String>,
    #[serde(rename = "tar.gz")]
    pub tar_gz: Option<String>,
}

fn flag_set(value: &Option<String>) -> bool {
    match value.as_deref().map(str::trim) {
        None | Some("") => false,
        Some(v) => !v.eq_ignore_ascii_case("false") && v != "0",
    }
}

impl ArchiveQuery {
    /// Parse the selectors; a malformed query string selects nothing.
    pub fn from_uri(uri: &Uri) -> Self {
        Query::<ArchiveQuery>::try_from_uri(uri)
            .map(|Query(query)| query)
            .unwrap_or_default()
    }

    pub fn wants_zip(&self) -> bool {
        flag_set(&self.zip)
    }

    pub fn wants_tar_gz(&self) -> bool {
        flag_set(&self.tar_gz)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    NotFound,
    Forbidden,
    InternalError,
    ServeZip,
    ServeTarGz,
    ServeUpload,
    ServeDelete,
    ServeListing,
    ServeRawFile,
}

/// Whether the request asks for deletion, natively or via a `_method` form field.
pub fn is_delete(method: &Method, override_method: Option<&str>) -> bool {
    *method == Method::DELETE
        || (*method == Method::POST
            && override_method.is_some_and(|m| m.trim().eq_ignore_ascii_case("DELETE")))
}

/// Pick the single action for a request. The first matching rule wins.
pub fn classify(
    stat: StatOutcome,
    method: &Method,
    override_method: Option<&str>,
    query: &ArchiveQuery,
    caps: Capabilities,
) -> RequestAction {
    let is_dir = match stat {
        StatOutcome::Missing => return RequestAction::NotFound,
        StatOutcome::Denied => return RequestAction::Forbidden,
        StatOutcome::Failed => return RequestAction::InternalError,
        StatOutcome::Found { is_dir } => is_dir,
    };

    let delete = is_delete(method, override_method);
    // Every POST uses the upload verb, including form deletes.
    let upload = *method == Method::POST;

    if delete && !caps.allow_delete {
        return RequestAction::Forbidden;
    }
    if upload && !caps.allow_upload {
        return RequestAction::Forbidden;
    }
    if query.wants_zip() {
        return RequestAction::ServeZip;
    }
    if query.wants_tar_gz() {
        return RequestAction::ServeTarGz;
    }
    if upload && is_dir {
        return RequestAction::ServeUpload;
    }
    if delete && !is_dir {
        return RequestAction::ServeDelete;
    }
    if is_dir {
        return RequestAction::ServeListing;
    }
    RequestAction::ServeRawFile
}
