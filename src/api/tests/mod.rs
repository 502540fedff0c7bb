use super::*;
use crate::completion::CompletionTracker;
use crate::counter::{AtomicCounterStore, MemoryCounterStore};
use crate::db::Database;
use crate::publisher::JobPublisher;
use crate::queue::{MemoryQueue, QueueClient};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;


/// Router over a fresh database and in-memory broker
struct TestApp {
    router: Router,
    service: Arc<PackageService>,
    db: Arc<Database>,
    queue: Arc<MemoryQueue>,
    dir: TempDir,
}

async fn test_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new(&dir.path().join("media-dl.db")).await.unwrap());
    let queue = Arc::new(MemoryQueue::new());
    let counters: Arc<dyn AtomicCounterStore> = Arc::new(MemoryCounterStore::new());

    let mut config = Config::default();
    config.workers.download_dir = dir.path().join("downloads");
    let config = Arc::new(config);

    let client: Arc<dyn QueueClient> = queue.clone();
    let publisher = JobPublisher::new(client, counters.clone(), &config);
    let tracker = CompletionTracker::new(counters, db.clone());
    let service = Arc::new(PackageService::new(db.clone(), publisher, tracker));

    TestApp {
        router: create_router(service.clone(), config),
        service,
        db,
        queue,
        dir,
    }
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

async fn get(router: &Router, uri: &str) -> Response {
    send(router, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn post_json(router: &Router, uri: &str, body: serde_json::Value) -> Response {
    send(
        router,
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

async fn json_body<T: DeserializeOwned>(response: Response) -> T {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_api_server_spawns_and_stops() {
    let app = test_app().await;
    let mut config = Config::default();
    config.api.bind_address = "127.0.0.1:0".parse().unwrap();
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(start_api_server(
        app.service.clone(),
        Arc::new(config),
        shutdown.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_cors_headers_present() {
    let app = test_app().await;

    let request = Request::builder()
        .uri("/api/v1/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = send(&app.router, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .contains_key("access-control-allow-origin")
    );
}
