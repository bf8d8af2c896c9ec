//! HTTP Upload Panel
//!
//! Small axum sidecar for dropping files into a directory over HTTP:
//! authenticated upload, anonymous download, and a health probe. Runs
//! next to the replication core but shares nothing with it beyond
//! process lifecycle.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::WebConfig;
use crate::error::SyncError;

struct WebState {
    username: String,
    password: String,
    upload_dir: PathBuf,
}

/// Running panel; dropping it does not stop the server, `stop` does.
pub struct WebServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl WebServer {
    /// Bind and start serving. The upload directory is created if absent.
    pub async fn start(config: WebConfig) -> Result<Self, SyncError> {
        let upload_dir = PathBuf::from(&config.upload_dir);
        tokio::fs::create_dir_all(&upload_dir).await?;

        let state = Arc::new(WebState {
            username: config.username,
            password: config.password,
            upload_dir,
        });

        let app = Router::new()
            .route("/health", get(health))
            .route("/upload", post(upload))
            .route("/uploads/:file", get(download))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let bind_addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(SyncError::FileSystem)?;
        let local_addr = listener.local_addr().map_err(SyncError::FileSystem)?;

        tracing::info!(addr = %local_addr, "upload panel listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("upload panel stopped: {}", e);
            }
        });

        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.handle.abort();
        tracing::info!(addr = %self.local_addr, "upload panel stopped");
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct UploadParams {
    name: Option<String>,
}

async fn upload(
    State(state): State<Arc<WebState>>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if !state.username.is_empty() && !authorized(&headers, &state.username, &state.password) {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"upload\"")],
            "unauthorized",
        )
            .into_response();
    }

    let name = params.name.unwrap_or_else(|| "file.bin".to_string());
    if !is_safe_name(&name) {
        return (StatusCode::BAD_REQUEST, "invalid file name").into_response();
    }

    let stored = format!("{}_{}", random_prefix(), name);
    let target = state.upload_dir.join(&stored);
    if let Err(e) = tokio::fs::write(&target, &body).await {
        tracing::error!(path = %target.display(), "upload write failed: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "write failed").into_response();
    }

    tracing::info!(file = %stored, bytes = body.len(), "file uploaded");
    Json(serde_json::json!({
        "status": "ok",
        "file": stored,
        "url": format!("/uploads/{}", stored),
    }))
    .into_response()
}

async fn download(State(state): State<Arc<WebState>>, UrlPath(file): UrlPath<String>) -> Response {
    if !is_safe_name(&file) {
        return (StatusCode::BAD_REQUEST, "invalid file name").into_response();
    }

    match tokio::fs::read(state.upload_dir.join(&file)).await {
        Ok(content) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            content,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// A stored name must stay inside the upload directory.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

fn random_prefix() -> String {
    let bytes: [u8; 8] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Check a Basic auth header against configured credentials without
/// short-circuiting on the first mismatched byte.
fn authorized(headers: &HeaderMap, username: &str, password: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };

    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };

    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };

    constant_time_eq(user.as_bytes(), username.as_bytes())
        & constant_time_eq(pass.as_bytes(), password.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn basic_header(user: &str, pass: &str) -> HeaderMap {
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {}", token).parse().unwrap(),
        );
        headers
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_safe_names() {
        assert!(is_safe_name("report.pdf"));
        assert!(is_safe_name("a-b_c.1.txt"));
        assert!(!is_safe_name(""));
        assert!(!is_safe_name("../escape"));
        assert!(!is_safe_name("dir/file"));
        assert!(!is_safe_name("dir\\file"));
    }

    #[test]
    fn test_authorized_accepts_valid_credentials() {
        let headers = basic_header("admin", "hunter2");
        assert!(authorized(&headers, "admin", "hunter2"));
        assert!(!authorized(&headers, "admin", "other"));
        assert!(!authorized(&headers, "root", "hunter2"));
    }

    #[test]
    fn test_authorized_rejects_malformed_header() {
        let mut headers = HeaderMap::new();
        assert!(!authorized(&headers, "admin", "x"));

        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert!(!authorized(&headers, "admin", "x"));

        headers.insert(header::AUTHORIZATION, "Basic %%%".parse().unwrap());
        assert!(!authorized(&headers, "admin", "x"));
    }

    #[test]
    fn test_random_prefix_format() {
        let prefix = random_prefix();
        assert_eq!(prefix.len(), 16);
        assert!(prefix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_prefix(), prefix);
    }

    async fn http_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    fn panel_config(dir: &std::path::Path) -> WebConfig {
        WebConfig {
            enabled: true,
            port: 0,
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            upload_dir: dir.display().to_string(),
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let server = WebServer::start(panel_config(dir.path())).await.unwrap();

        let response = http_request(
            server.local_addr(),
            "GET /health HTTP/1.1\r\nHost: panel\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.contains("200"));
        assert!(response.contains("ok"));

        server.stop();
    }

    #[tokio::test]
    async fn test_upload_requires_auth() {
        let dir = tempfile::tempdir().unwrap();
        let server = WebServer::start(panel_config(dir.path())).await.unwrap();

        let response = http_request(
            server.local_addr(),
            "POST /upload?name=a.txt HTTP/1.1\r\nHost: panel\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndata",
        )
        .await;
        assert!(response.contains("401"));

        server.stop();
    }

    #[tokio::test]
    async fn test_download_missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let server = WebServer::start(panel_config(dir.path())).await.unwrap();

        let response = http_request(
            server.local_addr(),
            "GET /uploads/nope.txt HTTP/1.1\r\nHost: panel\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.contains("404"));

        server.stop();
    }
}
