//! Static router: serves published deployments from the blob store.
//!
//! The tenant is the leading label of the `Host` header, so
//! `abc12.example.com/css/site.css` reads `dist/abc12/css/site.css`.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{debug, error, warn};

use super::models::DeploymentId;
use super::storage::BlobStore;
use crate::config::RouterConfig;
use crate::errors::StorageError;

const NOT_FOUND_BODY: &str = "404 Not Found";
const INTERNAL_ERROR_BODY: &str = "500 Internal Server Error";
const INDEX_DOCUMENT: &str = "index.html";

pub struct RouterState {
    pub blobs: Arc<dyn BlobStore>,
    pub base_prefix: String,
    pub buffer_limit_bytes: u64,
}

impl RouterState {
    pub fn new(blobs: Arc<dyn BlobStore>, config: &RouterConfig) -> Self {
        Self {
            blobs,
            base_prefix: config.base_prefix.trim_matches('/').to_string(),
            buffer_limit_bytes: config.buffer_limit_bytes,
        }
    }
}

pub type SharedRouterState = Arc<RouterState>;

pub fn static_router() -> Router<SharedRouterState> {
    Router::new()
        .route("/", get(serve_root))
        .route("/{*path}", get(serve_path))
}

/// Content type by file suffix. Anything that is not HTML or CSS is served
/// as JavaScript.
pub fn content_type_for(path: &str) -> &'static str {
    if path.ends_with(".html") {
        "text/html"
    } else if path.ends_with(".css") {
        "text/css"
    } else {
        "application/javascript"
    }
}

/// Tenant label of a `Host` value: port stripped, first dot-separated label.
pub fn tenant_from_host(host: &str) -> Option<DeploymentId> {
    let host = host.trim();
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    // Host names are case-insensitive; ids are stored lowercase.
    let label = without_port.split('.').next().unwrap_or_default();
    DeploymentId::parse(&label.to_ascii_lowercase())
}

/// Relative object path for a request path.
///
/// Empty segments collapse, `.` and `..` are refused and a directory path
/// resolves to its index document.
pub fn normalize_path(path: &str) -> Option<String> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" => continue,
            "." | ".." => return None,
            s => segments.push(s),
        }
    }
    if segments.is_empty() || path.ends_with('/') {
        segments.push(INDEX_DOCUMENT);
    }
    Some(segments.join("/"))
}

fn object_key(state: &RouterState, tenant: &DeploymentId, path: &str) -> String {
    if state.base_prefix.is_empty() {
        format!("{tenant}/{path}")
    } else {
        format!("{}/{tenant}/{path}", state.base_prefix)
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response()
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response()
}

async fn serve_root(State(state): State<SharedRouterState>, headers: HeaderMap) -> Response {
    serve(&state, &headers, "/").await
}

async fn serve_path(
    State(state): State<SharedRouterState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Response {
    serve(&state, &headers, &path).await
}

async fn serve(state: &RouterState, headers: &HeaderMap, raw_path: &str) -> Response {
    let Some(tenant) = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(tenant_from_host)
    else {
        debug!(path = raw_path, "request without a usable host");
        return not_found();
    };
    let Some(path) = normalize_path(raw_path) else {
        return not_found();
    };
    let key = object_key(state, &tenant, &path);

    let object = match state.blobs.get(&key).await {
        Ok(object) => object,
        Err(StorageError::NotFound { .. }) => {
            debug!(key, "object not found");
            return not_found();
        }
        Err(e) => {
            warn!(key, error = %e, "object fetch failed");
            return not_found();
        }
    };

    let content_type = HeaderValue::from_static(content_type_for(&path));
    if object.content_length <= state.buffer_limit_bytes {
        match object.bytes().await {
            Ok(bytes) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
            Err(e) => {
                error!(key, error = %e, "object body read failed");
                internal_error()
            }
        }
    } else {
        debug!(key, bytes = object.content_length, "streaming large object");
        let length = HeaderValue::from(object.content_length);
        (
            [(header::CONTENT_TYPE, content_type), (header::CONTENT_LENGTH, length)],
            Body::from_stream(object.body),
        )
            .into_response()
    }
}
