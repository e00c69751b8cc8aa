#![allow(dead_code)] // not every test crate uses every helper

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, Response};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use nebula::api::AppState;
use nebula::catalog::Catalog;
use nebula::test_support::{InMemoryJobQueue, MockObjectStore};

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false)
        .try_init();
}

pub struct TestHarness {
    pub state: AppState,
    pub catalog: Catalog,
    pub store: Arc<MockObjectStore>,
    pub queue: Arc<InMemoryJobQueue>,
    _dir: TempDir,
}

pub async fn harness() -> TestHarness {
    tracing_init();

    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("catalog.db").display());
    let catalog = Catalog::new(&url).await.expect("catalog init");
    let store = Arc::new(MockObjectStore::new());
    let queue = Arc::new(InMemoryJobQueue::new());

    let state = AppState {
        catalog: catalog.clone(),
        store: store.clone(),
        queue: queue.clone(),
    };

    TestHarness {
        state,
        catalog,
        store,
        queue,
        _dir: dir,
    }
}

/// Fire one request at a fresh router instance.
pub async fn send(harness: &TestHarness, request: Request<Body>) -> Response<Body> {
    nebula::api::router(harness.state.clone())
        .oneshot(request)
        .await
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).expect("response body must be JSON")
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn get_with_range(uri: &str, range: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(header::RANGE, range)
        .body(Body::empty())
        .unwrap()
}

pub fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Hand-rolled multipart encoding for upload tests.
pub fn multipart_upload(
    uri: &str,
    filename: &str,
    content_type: &str,
    data: &[u8],
    description: Option<&str>,
) -> Request<Body> {
    let boundary = "nebula-test-boundary";
    let mut body = Vec::new();

    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
            filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");

    if let Some(description) = description {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"description\"\r\n\r\n");
        body.extend_from_slice(description.as_bytes());
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

/// Register a file directly against the catalog and plant its bytes in the
/// mock store, bypassing the HTTP upload path.
pub async fn seed_file(
    harness: &TestHarness,
    filename: &str,
    object_key: &str,
    mime_type: &str,
    data: &[u8],
) -> i64 {
    harness.store.insert(object_key, data.to_vec(), mime_type);
    let file = harness
        .catalog
        .insert_file(nebula::catalog::models::NewFile {
            filename: filename.to_string(),
            object_key: object_key.to_string(),
            size: data.len() as i64,
            mime_type: mime_type.to_string(),
            file_hash: None,
            description: None,
            user_id: None,
        })
        .await
        .expect("seed file");
    file.id
}
