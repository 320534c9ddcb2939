//! Test utilities and common setup.

use std::path::Path;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, Response},
};
use dirserve::{AppState, Config, routes};
use tempfile::TempDir;
use tower::ServiceExt;

pub const BOUNDARY: &str = "dirserve-test-boundary";

/// Root layout shared by most tests:
///
/// ```text
/// a.txt          "0123456789"
/// sub/a.txt      "0123456789"
/// sub/d/e.txt    "echo"
/// ```
pub fn fixture() -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    std::fs::write(root.join("a.txt"), "0123456789").unwrap();
    std::fs::create_dir_all(root.join("sub").join("d")).unwrap();
    std::fs::write(root.join("sub").join("a.txt"), "0123456789").unwrap();
    std::fs::write(root.join("sub").join("d").join("e.txt"), "echo").unwrap();
    temp_dir
}

/// Create a test application serving `root` at `route`.
pub fn test_app(root: &Path, route: &str, allow_upload: bool, allow_delete: bool) -> Router {
    let config = Config {
        route: route.to_string(),
        allow_upload,
        allow_delete,
        ..Config::default()
    };
    let state = AppState::with_config(root.to_path_buf(), config).unwrap();
    routes::app(state)
}

pub async fn send(app: Router, request: Request<Body>) -> Response<Body> {
    app.oneshot(request).await.unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::GET)
        .header("host", "localhost:8080")
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 64 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_text(response: Response<Body>) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

/// Multipart body holding a single `file` part.
pub fn multipart_upload(file_name: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_post(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::POST)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn form_post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::POST)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}
