use std::fs::Metadata;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    extract::{ConnectInfo, Form, FromRequest, Multipart, Request, State, multipart::Field},
    http::{HeaderMap, Method, Uri, header},
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::archive::{ArchiveFormat, archive_body};
use crate::dispatch::{ArchiveQuery, RequestAction, StatOutcome, classify};
use crate::error::FileServerError;
use crate::listing::{ListingRequest, build_listing};
use crate::resolve::{decode_request_path, resolve};

/// Multipart part carrying the uploaded file
pub const UPLOAD_FIELD: &str = "file";
/// Form field naming the intended HTTP verb
pub const METHOD_FIELD: &str = "_method";
/// Form field naming the target of a form delete
pub const FILE_NAME_FIELD: &str = "fileName";

/// Method-override fields of a POSTed form.
#[derive(Debug, Default, Deserialize)]
pub struct FormOverride {
    #[serde(rename = "_method")]
    pub method: Option<String>,
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
}

/// The parts of a request every action needs.
struct RequestContext {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    /// Percent-decoded URL path, mount included
    url_path: String,
    query: ArchiveQuery,
}

impl RequestContext {
    fn host(&self) -> Option<String> {
        self.headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| self.uri.authority().map(|a| a.to_string()))
    }
}

enum PostBody {
    Multipart,
    UrlEncoded,
    Other,
}

fn post_body_kind(headers: &HeaderMap) -> PostBody {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        PostBody::Multipart
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        PostBody::UrlEncoded
    } else {
        PostBody::Other
    }
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> FileServerError {
    FileServerError::Multipart(err.body_text())
}

fn join_error(err: tokio::task::JoinError) -> FileServerError {
    FileServerError::Io(io::Error::other(err.to_string()))
}

/// Entry point for every request below the mount point.
pub async fn serve(State(state): State<AppState>, request: Request) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    info!(
        "[{}] {} {} {}",
        state.root_dir.display(),
        remote,
        request.method(),
        request.uri()
    );

    let method = request.method().clone();
    let uri = request.uri().clone();

    match handle(&state, request).await {
        Ok(response) => response,
        Err(err) => {
            let status = err.status_code();
            if status.is_server_error() {
                error!("{} {} failed: {}", method, uri, err);
            } else {
                debug!("{} {} rejected: {}", method, uri, err);
            }
            err.into_response()
        }
    }
}

async fn handle(state: &AppState, request: Request) -> Result<Response, FileServerError> {
    let ctx = RequestContext {
        method: request.method().clone(),
        uri: request.uri().clone(),
        headers: request.headers().clone(),
        url_path: decode_request_path(request.uri().path())?,
        query: ArchiveQuery::from_uri(request.uri()),
    };

    // With uploads disabled every POST is refused, so its body is never read.
    if ctx.method != Method::POST || !state.config.allow_upload {
        return perform(state, &ctx, &FormOverride::default(), None).await;
    }

    match post_body_kind(&ctx.headers) {
        PostBody::Multipart => {
            let mut multipart = Multipart::from_request(request, &())
                .await
                .map_err(|rejection| FileServerError::Multipart(rejection.body_text()))?;
            let mut form = FormOverride::default();

            // Override fields precede the file part in browser-built forms; the
            // file part is handed over unread so it can be streamed to disk.
            while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
                let name = field.name().map(str::to_string);
                match name.as_deref() {
                    Some(UPLOAD_FIELD) => return perform(state, &ctx, &form, Some(field)).await,
                    Some(METHOD_FIELD) => {
                        form.method = Some(field.text().await.map_err(multipart_error)?);
                    }
                    Some(FILE_NAME_FIELD) => {
                        form.file_name = Some(field.text().await.map_err(multipart_error)?);
                    }
                    _ => {}
                }
            }

            perform(state, &ctx, &form, None).await
        }
        PostBody::UrlEncoded => {
            let form = match Form::<FormOverride>::from_request(request, &()).await {
                Ok(Form(form)) => form,
                Err(rejection) => {
                    debug!("Ignoring unreadable form body: {}", rejection.body_text());
                    FormOverride::default()
                }
            };
            perform(state, &ctx, &form, None).await
        }
        PostBody::Other => perform(state, &ctx, &FormOverride::default(), None).await,
    }
}

/// Resolve, stat, classify, and run the one action the request maps to.
async fn perform(
    state: &AppState,
    ctx: &RequestContext,
    form: &FormOverride,
    upload: Option<Field<'_>>,
) -> Result<Response, FileServerError> {
    let target = resolve(
        &state.root_dir,
        &state.mount,
        &ctx.url_path,
        form.file_name.as_deref(),
    );
    let metadata = fs::metadata(&target).await;
    let action = classify(
        StatOutcome::from_metadata(&metadata),
        &ctx.method,
        form.method.as_deref(),
        &ctx.query,
        state.capabilities(),
    );
    debug!("{} {} -> {:?} ({})", ctx.method, ctx.uri, action, target.display());

    match action {
        RequestAction::NotFound | RequestAction::Forbidden | RequestAction::InternalError => {
            Err(rejection(ctx, metadata))
        }
        RequestAction::ServeZip => Ok(serve_archive(state, target, ArchiveFormat::Zip)),
        RequestAction::ServeTarGz => Ok(serve_archive(state, target, ArchiveFormat::TarGz)),
        RequestAction::ServeUpload => serve_upload(state, ctx, &target, upload).await,
        RequestAction::ServeDelete => serve_delete(ctx, &target).await,
        RequestAction::ServeListing => serve_listing(state, ctx, target).await,
        RequestAction::ServeRawFile => serve_raw_file(ctx, &target).await,
    }
}

fn rejection(ctx: &RequestContext, metadata: io::Result<Metadata>) -> FileServerError {
    match metadata {
        Err(err) => FileServerError::from_stat(err, &ctx.url_path),
        Ok(_) => {
            warn!("Rejected {} {}: capability disabled", ctx.method, ctx.uri);
            FileServerError::Forbidden("capability disabled")
        }
    }
}

/// 303 back to the page the request came from.
fn redirect_back(ctx: &RequestContext) -> Response {
    Redirect::to(&ctx.uri.to_string()).into_response()
}

/// Headers go out first; the archive is produced while the body is read.
fn serve_archive(state: &AppState, target: PathBuf, format: ArchiveFormat) -> Response {
    info!("Streaming {} archive of {}", format.extension(), target.display());

    let disposition = format.content_disposition(&target);
    let body = archive_body(target, format, state.config.copy_buffer_size());

    (
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response()
}

async fn serve_listing(
    state: &AppState,
    ctx: &RequestContext,
    dir: PathBuf,
) -> Result<Response, FileServerError> {
    let url_path = ctx.url_path.clone();
    let host = ctx.host();
    let mount = state.mount.clone();
    let config = state.config.clone();

    let view = tokio::task::spawn_blocking(move || {
        build_listing(
            &dir,
            &ListingRequest {
                url_path: &url_path,
                host: host.as_deref(),
                mount: &mount,
                title: &config.title,
                allow_upload: config.allow_upload,
                allow_delete: config.allow_delete,
            },
        )
    })
    .await
    .map_err(join_error)??;

    let html = state.renderer.render(&view)?;

    Ok(([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response())
}

/// Base name of an uploaded file, or `None` if nothing usable is left.
pub fn upload_file_name(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    match cleaned {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

#[cfg(unix)]
async fn create_upload_file(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await
}

#[cfg(not(unix))]
async fn create_upload_file(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
}

/// Stream the part into `file`, enforcing the size limit.
async fn copy_field(
    field: &mut Field<'_>,
    file: &mut fs::File,
    limit: Option<u64>,
) -> Result<u64, FileServerError> {
    let mut total_size = 0u64;

    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        total_size = total_size.saturating_add(chunk.len() as u64);
        if let Some(limit) = limit {
            if total_size > limit {
                return Err(FileServerError::FileTooLarge {
                    size: total_size,
                    limit,
                });
            }
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(total_size)
}

async fn serve_upload(
    state: &AppState,
    ctx: &RequestContext,
    dir: &Path,
    upload: Option<Field<'_>>,
) -> Result<Response, FileServerError> {
    let Some(mut field) = upload else {
        debug!("Upload without a file part, nothing to store");
        return Ok(redirect_back(ctx));
    };

    let raw_name = field.file_name().unwrap_or_default().to_string();
    let Some(file_name) = upload_file_name(&raw_name) else {
        if raw_name.trim().is_empty() {
            debug!("Upload with an empty file name, nothing to store");
            return Ok(redirect_back(ctx));
        }
        warn!("Rejected upload file name: {:?}", raw_name);
        return Err(FileServerError::InvalidPath(raw_name));
    };

    let dest_path = dir.join(&file_name);
    let mut file = create_upload_file(&dest_path).await.map_err(|e| {
        error!("Failed to create {}: {}", dest_path.display(), e);
        FileServerError::Io(e)
    })?;

    match copy_field(&mut field, &mut file, state.config.upload_limit()).await {
        Ok(total_size) => {
            info!(
                "Uploaded file: {} ({} bytes)",
                dest_path.display(),
                total_size
            );
            Ok(redirect_back(ctx))
        }
        Err(err) => {
            drop(file);
            if let Err(remove_err) = fs::remove_file(&dest_path).await {
                warn!(
                    "Failed to remove partial upload {}: {}",
                    dest_path.display(),
                    remove_err
                );
            }
            Err(err)
        }
    }
}

async fn serve_delete(ctx: &RequestContext, path: &Path) -> Result<Response, FileServerError> {
    fs::remove_file(path).await.map_err(|e| {
        error!("Failed to delete {}: {}", path.display(), e);
        FileServerError::Io(e)
    })?;

    info!("Deleted: {}", path.display());
    Ok(redirect_back(ctx))
}

/// Method `ServeFile` is asked with: the file is sent whatever the verb, and
/// only `HEAD` keeps its bodiless response.
fn raw_file_method(method: &Method) -> Method {
    if *method == Method::HEAD {
        Method::HEAD
    } else {
        Method::GET
    }
}

/// Stream a regular file with metadata-derived caching and range headers.
async fn serve_raw_file(ctx: &RequestContext, path: &Path) -> Result<Response, FileServerError> {
    let mut request = Request::new(Body::empty());
    *request.method_mut() = raw_file_method(&ctx.method);
    *request.uri_mut() = ctx.uri.clone();
    *request.headers_mut() = ctx.headers.clone();

    let response = match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    Ok(response.into_response())
}
