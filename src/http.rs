//! HTTP API for the context store.
//!
//! Routes:
//! - `OPTIONS *` - CORS preflight
//! - `GET /api/health` - liveness, no auth
//! - `GET /api/context` - fetch the current context (`X-Context-ID`)
//! - `POST|PUT /api/context` - save (`X-Context-ID`, `X-Session-ID`)
//! - `DELETE /api/context` - delete a context and its history
//! - `GET /api/context/list` - list the caller's contexts
//! - `POST /api/context/sync` - pull/push reconciliation
//! - `POST /api/context/version` - version listing
//! - `POST /api/context/restore` - point current at an old version
//!
//! Every response carries CORS headers. Errors map to statuses by variant:
//! validation 400, auth 401, not-found 404, everything else a generic 500
//! whose `errorId` correlates with the server log line.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::PrincipalResolver;
use crate::error::{ContextError, Result};
use crate::repository::ContextRepository;

const CONTEXT_ID_HEADER: &str = "x-context-id";
const SESSION_ID_HEADER: &str = "x-session-id";
const DEFAULT_CONTEXT_ID: &str = "default";

/// HTTP server state
pub struct HttpServer {
    repository: Arc<ContextRepository>,
    resolver: Arc<PrincipalResolver>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(
        repository: Arc<ContextRepository>,
        resolver: Arc<PrincipalResolver>,
        bind_addr: SocketAddr,
    ) -> Self {
        Self {
            repository,
            resolver,
            bind_addr,
        }
    }

    /// Bind and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener (tests bind an
    /// ephemeral port first to learn the address).
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "connection error");
                }
            });
        }
    }

    /// Route one request. Generic over the body type so tests can drive the
    /// full dispatcher with `Full<Bytes>` requests.
    pub async fn handle_request<B>(
        &self,
        req: Request<B>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: std::fmt::Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(method = %method, path = %path, "incoming request");

        if method == Method::OPTIONS {
            return Ok(preflight_response());
        }
        if method == Method::GET && path == "/api/health" {
            return Ok(health_response());
        }

        Ok(match self.dispatch(req, &method, &path).await {
            Ok(response) => response,
            Err(e) => error_response(e),
        })
    }

    async fn dispatch<B>(
        &self,
        req: Request<B>,
        method: &Method,
        path: &str,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: std::fmt::Display,
    {
        // Everything past health requires a resolved user
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let user_id = self.resolver.resolve(authorization.as_deref()).await?;

        match (method, path) {
            (&Method::GET, "/api/context") => {
                let context_id = context_id_header(&req);
                self.handle_get(&user_id, &context_id).await
            }
            (&Method::POST, "/api/context") | (&Method::PUT, "/api/context") => {
                let context_id = context_id_header(&req);
                let session_id = header_string(&req, SESSION_ID_HEADER)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let body = read_body(req).await?;
                self.handle_save(&user_id, &context_id, &session_id, &body).await
            }
            (&Method::DELETE, "/api/context") => {
                let context_id = context_id_header(&req);
                self.handle_delete(&user_id, &context_id).await
            }
            (&Method::GET, "/api/context/list") => self.handle_list(&user_id).await,
            (&Method::POST, "/api/context/sync") => {
                let body = read_body(req).await?;
                self.handle_sync(&user_id, &body).await
            }
            (&Method::POST, "/api/context/version") => {
                let body = read_body(req).await?;
                self.handle_versions(&user_id, &body).await
            }
            (&Method::POST, "/api/context/restore") => {
                let body = read_body(req).await?;
                self.handle_restore(&user_id, &body).await
            }
            _ => Ok(json_response(
                StatusCode::NOT_FOUND,
                &json!({"error": "Not found"}),
            )),
        }
    }

    async fn handle_get(&self, user_id: &str, context_id: &str) -> Result<Response<Full<Bytes>>> {
        let record = self.repository.get(user_id, context_id).await?;
        Ok(json_response(StatusCode::OK, &record))
    }

    async fn handle_save(
        &self,
        user_id: &str,
        context_id: &str,
        session_id: &str,
        body: &Bytes,
    ) -> Result<Response<Full<Bytes>>> {
        let body: SaveBody = parse_body(body)?;
        let content = body.content.ok_or_else(|| {
            ContextError::Validation("Invalid context structure".to_string())
        })?;

        let receipt = self
            .repository
            .save(user_id, context_id, &content, body.metadata.as_ref(), session_id)
            .await?;

        Ok(json_response(
            StatusCode::OK,
            &json!({
                "success": true,
                "contextId": receipt.context_id,
                "version": receipt.version,
                "timestamp": receipt.timestamp,
            }),
        ))
    }

    async fn handle_delete(&self, user_id: &str, context_id: &str) -> Result<Response<Full<Bytes>>> {
        let deleted = self.repository.delete(user_id, context_id).await?;
        Ok(json_response(
            StatusCode::OK,
            &json!({"success": true, "deleted": deleted}),
        ))
    }

    async fn handle_list(&self, user_id: &str) -> Result<Response<Full<Bytes>>> {
        let contexts = self.repository.list(user_id).await?;
        Ok(json_response(StatusCode::OK, &json!({"contexts": contexts})))
    }

    async fn handle_sync(&self, user_id: &str, body: &Bytes) -> Result<Response<Full<Bytes>>> {
        let body: SyncBody = parse_body(body)?;
        let context_id = body
            .context_id
            .unwrap_or_else(|| DEFAULT_CONTEXT_ID.to_string());

        let outcome = self
            .repository
            .sync(user_id, &context_id, body.last_sync.as_deref())
            .await?;
        Ok(json_response(StatusCode::OK, &outcome))
    }

    async fn handle_versions(&self, user_id: &str, body: &Bytes) -> Result<Response<Full<Bytes>>> {
        let body: VersionsBody = parse_body(body)?;
        let context_id = body
            .context_id
            .unwrap_or_else(|| DEFAULT_CONTEXT_ID.to_string());

        let versions = self
            .repository
            .versions(user_id, &context_id, body.limit)
            .await?;
        Ok(json_response(StatusCode::OK, &json!({"versions": versions})))
    }

    async fn handle_restore(&self, user_id: &str, body: &Bytes) -> Result<Response<Full<Bytes>>> {
        let body: RestoreBody = parse_body(body)?;
        let context_id = body
            .context_id
            .unwrap_or_else(|| DEFAULT_CONTEXT_ID.to_string());
        // A missing version can't match any record
        let version = body
            .version
            .ok_or_else(|| ContextError::NotFound("Version not found".to_string()))?;

        let restored = self.repository.restore(user_id, &context_id, version).await?;
        Ok(json_response(
            StatusCode::OK,
            &json!({"success": true, "restoredVersion": restored}),
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveBody {
    content: Option<serde_json::Value>,
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncBody {
    context_id: Option<String>,
    last_sync: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionsBody {
    context_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreBody {
    context_id: Option<String>,
    version: Option<i64>,
}

fn context_id_header<B>(req: &Request<B>) -> String {
    header_string(req, CONTEXT_ID_HEADER).unwrap_or_else(|| DEFAULT_CONTEXT_ID.to_string())
}

fn header_string<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Collect the request body into memory.
async fn read_body<B>(req: Request<B>) -> Result<Bytes>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::fmt::Display,
{
    let collected = req
        .into_body()
        .collect()
        .await
        .map_err(|e| ContextError::Internal(format!("failed to read request body: {}", e)))?;
    Ok(collected.to_bytes())
}

/// Parse a JSON request body; malformed JSON is a 400, not a 500.
fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|_| ContextError::Validation("Invalid JSON payload".to_string()))
}

/// CORS headers attached to every response
fn with_cors(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "GET, POST, PUT, DELETE, OPTIONS",
        )
        .header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Content-Type, Authorization, X-Context-ID, X-Session-ID",
        )
        .header(header::ACCESS_CONTROL_MAX_AGE, "86400")
}

/// Build a JSON response with CORS headers attached.
fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    with_cors(Response::builder().status(status))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

/// CORS preflight: headers only, no body.
fn preflight_response() -> Response<Full<Bytes>> {
    with_cors(Response::builder().status(StatusCode::OK))
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn health_response() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "healthy",
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }),
    )
}

/// Map an error to its response by variant. Internal failures are logged
/// with a fresh correlation id; no detail reaches the caller.
fn error_response(err: ContextError) -> Response<Full<Bytes>> {
    match err {
        ContextError::Validation(message) => {
            json_response(StatusCode::BAD_REQUEST, &json!({"error": message}))
        }
        ContextError::Auth(message) => {
            json_response(StatusCode::UNAUTHORIZED, &json!({"error": message}))
        }
        ContextError::NotFound(message) => {
            json_response(StatusCode::NOT_FOUND, &json!({"error": message}))
        }
        ContextError::Storage(_)
        | ContextError::Crypto(_)
        | ContextError::Io(_)
        | ContextError::Database(_)
        | ContextError::Json(_)
        | ContextError::Http(_)
        | ContextError::Internal(_) => {
            let error_id = Uuid::new_v4().to_string();
            error!(error_id = %error_id, error = %err, "internal error");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({
                    "error": "Internal server error",
                    "errorId": error_id,
                    "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                }),
            )
        }
    }
}
