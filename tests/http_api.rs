//! Integration tests for the HTTP API
//!
//! Most tests drive the request dispatcher directly with in-memory requests;
//! the last one binds a real loopback socket and exercises the reqwest
//! client against a running server.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use tempfile::TempDir;

use context_vault::auth::PrincipalResolver;
use context_vault::blob_store::{BlobStore, FsBlobStore};
use context_vault::client::{ClientConfig, ContextClient};
use context_vault::http::HttpServer;
use context_vault::keys;
use context_vault::metadata::{MetadataIndex, SledIndex};
use context_vault::repository::{ContextRepository, SyncOutcome};

const TEST_TOKEN: &str = "test-api-key-1";
const TEST_USER: &str = "user-1";
const JWT_SECRET: &str = "http-test-jwt-secret";

/// Helper to build a server over temp stores with one registered API key
async fn create_server() -> (Arc<HttpServer>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = FsBlobStore::new(temp_dir.path().join("objects"));
    store.init().await.unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(store);
    let index: Arc<dyn MetadataIndex> = Arc::new(SledIndex::temporary().unwrap());

    index
        .put(&keys::api_key_lookup(TEST_TOKEN), TEST_USER.as_bytes(), None)
        .await
        .unwrap();

    let repository = Arc::new(ContextRepository::new(
        blobs,
        index.clone(),
        "http-test-key",
    ));
    let resolver = Arc::new(PrincipalResolver::new(index, JWT_SECRET));
    let server = Arc::new(HttpServer::new(
        repository,
        resolver,
        "127.0.0.1:0".parse().unwrap(),
    ));
    (server, temp_dir)
}

fn request(
    method: Method,
    path: &str,
    token: Option<&str>,
    headers: &[(&str, &str)],
    body: Option<&serde_json::Value>,
) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let bytes = match body {
        Some(value) => Bytes::from(value.to_string()),
        None => Bytes::new(),
    };
    builder.body(Full::new(bytes)).unwrap()
}

fn request_raw(method: Method, path: &str, token: Option<&str>, body: &str) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn response_json(response: Response<Full<Bytes>>) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn make_jwt(sub: &str) -> String {
    let claims = json!({
        "sub": sub,
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Test that health answers without any credential
#[tokio::test]
async fn test_health_requires_no_auth() {
    let (server, _temp) = create_server().await;

    let response = server
        .handle_request(request(Method::GET, "/api/health", None, &[], None))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
    assert!(body["timestamp"].is_string());
}

/// Test the 401 responses for absent and unrecognized credentials
#[tokio::test]
async fn test_auth_failures() {
    let (server, _temp) = create_server().await;

    let response = server
        .handle_request(request(Method::GET, "/api/context", None, &[], None))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("Missing authorization"));

    let response = server
        .handle_request(request(
            Method::GET,
            "/api/context",
            Some("no-such-key"),
            &[],
            None,
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("Invalid token"));

    // Three dot-separated parts route through JWT verification
    let response = server
        .handle_request(request(
            Method::GET,
            "/api/context",
            Some("bad.jwt.token"),
            &[],
            None,
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("Invalid token"));
}

/// Test CORS preflight and the headers carried on ordinary responses
#[tokio::test]
async fn test_cors() {
    let (server, _temp) = create_server().await;

    let response = server
        .handle_request(request(Method::OPTIONS, "/api/context", None, &[], None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(
        headers["access-control-allow-methods"],
        "GET, POST, PUT, DELETE, OPTIONS"
    );
    assert_eq!(
        headers["access-control-allow-headers"],
        "Content-Type, Authorization, X-Context-ID, X-Session-ID"
    );
    assert_eq!(headers["access-control-max-age"], "86400");

    // Error responses carry CORS headers too
    let response = server
        .handle_request(request(Method::GET, "/api/context", None, &[], None))
        .await
        .unwrap();
    assert_eq!(response.headers()["access-control-allow-origin"], "*");

    let response = server
        .handle_request(request(Method::GET, "/api/health", None, &[], None))
        .await
        .unwrap();
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
}

/// Test the full save / get / delete flow over the API
#[tokio::test]
async fn test_save_get_delete_flow() {
    let (server, _temp) = create_server().await;
    let content = json!({"notes": ["alpha"], "cursor": 7});

    let response = server
        .handle_request(request(
            Method::POST,
            "/api/context",
            Some(TEST_TOKEN),
            &[("x-context-id", "notes"), ("x-session-id", "sess-42")],
            Some(&json!({"content": content, "metadata": {"device": "laptop"}})),
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["contextId"], json!("notes"));
    assert!(body["version"].as_i64().unwrap() > 0);
    assert!(body["timestamp"].is_string());

    let response = server
        .handle_request(request(
            Method::GET,
            "/api/context",
            Some(TEST_TOKEN),
            &[("x-context-id", "notes")],
            None,
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], content);
    assert_eq!(body["metadata"]["device"], json!("laptop"));
    assert_eq!(body["metadata"]["userId"], json!(TEST_USER));
    assert_eq!(body["metadata"]["sessionId"], json!("sess-42"));

    let response = server
        .handle_request(request(
            Method::DELETE,
            "/api/context",
            Some(TEST_TOKEN),
            &[("x-context-id", "notes")],
            None,
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["deleted"], json!(2));

    let response = server
        .handle_request(request(
            Method::GET,
            "/api/context",
            Some(TEST_TOKEN),
            &[("x-context-id", "notes")],
            None,
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("Context not found"));
}

/// Test the header defaults: context id falls back to "default", the
/// session id is minted per save
#[tokio::test]
async fn test_header_defaults() {
    let (server, _temp) = create_server().await;

    let response = server
        .handle_request(request(
            Method::PUT,
            "/api/context",
            Some(TEST_TOKEN),
            &[],
            Some(&json!({"content": {"a": 1}})),
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["contextId"], json!("default"));

    let response = server
        .handle_request(request(
            Method::GET,
            "/api/context",
            Some(TEST_TOKEN),
            &[],
            None,
        ))
        .await
        .unwrap();
    let (_, body) = response_json(response).await;
    let session_id = body["metadata"]["sessionId"].as_str().unwrap();
    assert_eq!(session_id.len(), 36);
}

/// Test JWT bearer auth end to end
#[tokio::test]
async fn test_jwt_auth() {
    let (server, _temp) = create_server().await;
    let token = make_jwt("jwt-user");

    let response = server
        .handle_request(request(
            Method::POST,
            "/api/context",
            Some(&token),
            &[],
            Some(&json!({"content": {"from": "jwt"}})),
        ))
        .await
        .unwrap();
    let (status, _) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);

    let response = server
        .handle_request(request(Method::GET, "/api/context", Some(&token), &[], None))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["userId"], json!("jwt-user"));
}

/// Test the 400 responses for malformed and malshaped payloads
#[tokio::test]
async fn test_bad_payloads() {
    let (server, _temp) = create_server().await;

    let response = server
        .handle_request(request_raw(
            Method::POST,
            "/api/context",
            Some(TEST_TOKEN),
            "not json at all",
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Invalid JSON payload"));

    // Empty body also fails to parse
    let response = server
        .handle_request(request_raw(
            Method::POST,
            "/api/context/sync",
            Some(TEST_TOKEN),
            "",
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Invalid JSON payload"));

    // Valid JSON with the wrong shape
    for bad in [json!({}), json!({"content": [1, 2]}), json!({"content": "x"})] {
        let response = server
            .handle_request(request(
                Method::POST,
                "/api/context",
                Some(TEST_TOKEN),
                &[],
                Some(&bad),
            ))
            .await
            .unwrap();
        let (status, body) = response_json(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Invalid context structure"));
    }
}

/// Test that unmatched routes 404 after auth
#[tokio::test]
async fn test_unknown_routes() {
    let (server, _temp) = create_server().await;

    let response = server
        .handle_request(request(
            Method::GET,
            "/api/nope",
            Some(TEST_TOKEN),
            &[],
            None,
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("Not found"));

    // Wrong method on a known path
    let response = server
        .handle_request(request(
            Method::POST,
            "/api/context/list",
            Some(TEST_TOKEN),
            &[],
            None,
        ))
        .await
        .unwrap();
    let (status, _) = response_json(response).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Unmatched path with no credential still 401s first
    let response = server
        .handle_request(request(Method::GET, "/api/nope", None, &[], None))
        .await
        .unwrap();
    let (status, _) = response_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

/// Test the list endpoint
#[tokio::test]
async fn test_list_endpoint() {
    let (server, _temp) = create_server().await;

    for id in ["alpha", "beta"] {
        let response = server
            .handle_request(request(
                Method::POST,
                "/api/context",
                Some(TEST_TOKEN),
                &[("x-context-id", id)],
                Some(&json!({"content": {"id": id}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = server
        .handle_request(request(
            Method::GET,
            "/api/context/list",
            Some(TEST_TOKEN),
            &[],
            None,
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    let contexts = body["contexts"].as_array().unwrap();
    assert_eq!(contexts.len(), 2);
    let mut ids: Vec<&str> = contexts
        .iter()
        .map(|c| c["contextId"].as_str().unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["alpha", "beta"]);
    assert!(contexts[0]["version"].is_i64());
}

/// Test sync over the API: stale pulls, current pushes, missing 404s
#[tokio::test]
async fn test_sync_endpoint() {
    let (server, _temp) = create_server().await;
    let content = json!({"inbox": [1]});

    server
        .handle_request(request(
            Method::POST,
            "/api/context",
            Some(TEST_TOKEN),
            &[("x-context-id", "notes")],
            Some(&json!({"content": content})),
        ))
        .await
        .unwrap();

    let response = server
        .handle_request(request(
            Method::POST,
            "/api/context/sync",
            Some(TEST_TOKEN),
            &[],
            Some(&json!({"contextId": "notes", "lastSync": "2020-01-01T00:00:00.000Z"})),
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], json!("pull"));
    assert_eq!(body["context"]["content"], content);
    assert!(body["timestamp"].is_string());

    let response = server
        .handle_request(request(
            Method::POST,
            "/api/context/sync",
            Some(TEST_TOKEN),
            &[],
            Some(&json!({"contextId": "notes", "lastSync": "2099-01-01T00:00:00.000Z"})),
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], json!("push"));

    let response = server
        .handle_request(request(
            Method::POST,
            "/api/context/sync",
            Some(TEST_TOKEN),
            &[],
            Some(&json!({"contextId": "missing"})),
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("Context not found"));
}

/// Test version history and restore over the API
#[tokio::test]
async fn test_version_and_restore_endpoints() {
    let (server, _temp) = create_server().await;

    let response = server
        .handle_request(request(
            Method::POST,
            "/api/context",
            Some(TEST_TOKEN),
            &[("x-context-id", "notes")],
            Some(&json!({"content": {"state": "first"}})),
        ))
        .await
        .unwrap();
    let (_, body) = response_json(response).await;
    let v1 = body["version"].as_i64().unwrap();

    tokio::time::sleep(Duration::from_millis(2)).await;
    server
        .handle_request(request(
            Method::POST,
            "/api/context",
            Some(TEST_TOKEN),
            &[("x-context-id", "notes")],
            Some(&json!({"content": {"state": "second"}})),
        ))
        .await
        .unwrap();

    let response = server
        .handle_request(request(
            Method::POST,
            "/api/context/version",
            Some(TEST_TOKEN),
            &[],
            Some(&json!({"contextId": "notes"})),
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    let versions = body["versions"].as_array().unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0]["version"].as_i64().unwrap(), v1);
    assert!(versions[1]["version"].as_i64().unwrap() > v1);

    let response = server
        .handle_request(request(
            Method::POST,
            "/api/context/restore",
            Some(TEST_TOKEN),
            &[],
            Some(&json!({"contextId": "notes", "version": v1})),
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["restoredVersion"].as_i64().unwrap(), v1);

    let response = server
        .handle_request(request(
            Method::GET,
            "/api/context",
            Some(TEST_TOKEN),
            &[("x-context-id", "notes")],
            None,
        ))
        .await
        .unwrap();
    let (_, body) = response_json(response).await;
    assert_eq!(body["content"], json!({"state": "first"}));

    // Unknown and absent versions both miss
    for bad in [json!({"contextId": "notes", "version": 123}), json!({"contextId": "notes"})] {
        let response = server
            .handle_request(request(
                Method::POST,
                "/api/context/restore",
                Some(TEST_TOKEN),
                &[],
                Some(&bad),
            ))
            .await
            .unwrap();
        let (status, body) = response_json(response).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("Version not found"));
    }
}

/// Test the reqwest client against a server on a real loopback socket
#[tokio::test]
async fn test_client_against_live_server() {
    let (server, _temp) = create_server().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    let client = ContextClient::new(ClientConfig {
        base_url: format!("http://{}", addr),
        token: TEST_TOKEN.to_string(),
        context_id: "notes".to_string(),
        ..Default::default()
    });

    let health = client.health().await.unwrap();
    assert_eq!(health.status, "healthy");

    let content = json!({"notes": ["over the wire"]});
    let saved = client
        .save_with_metadata(&content, &json!({"device": "laptop"}))
        .await
        .unwrap();
    assert!(saved.success);
    assert_eq!(saved.context_id, "notes");

    let record = client.get().await.unwrap();
    assert_eq!(record.content, content);
    assert_eq!(record.metadata["device"], json!("laptop"));

    let contexts = client.list().await.unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].context_id, "notes");

    match client.sync(Some("2020-01-01T00:00:00.000Z")).await.unwrap() {
        SyncOutcome::Pull { context, .. } => assert_eq!(context.content, content),
        other => panic!("expected pull, got {:?}", other),
    }

    let versions = client.versions(None).await.unwrap();
    assert_eq!(versions.len(), 1);

    let restored = client.restore(versions[0].version).await.unwrap();
    assert_eq!(restored.restored_version, versions[0].version);

    let deleted = client.delete().await.unwrap();
    assert_eq!(deleted.deleted, 2);

    // Errors map back onto the taxonomy
    let err = client.get().await.unwrap_err();
    assert!(matches!(err, context_vault::ContextError::NotFound(_)));
}
