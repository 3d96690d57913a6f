//! End-to-end tests against a gateway bound on a real port, with a local
//! axum server standing in for the upload source.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::StatusCode as AxumStatus, routing::get, Router};
use reqwest::StatusCode;
use sandbox_gateway::config::GatewayConfig;
use sandbox_gateway::http_server::router;
use sandbox_gateway::sdk::mock::MockBackend;
use sandbox_gateway::state::AppState;
use serde_json::{json, Value};

const SOURCE_BODY: &[u8] = b"id,value\n1,42\n";

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn spawn_source() -> SocketAddr {
    let app = Router::new()
        .route("/data.csv", get(|| async { SOURCE_BODY }))
        .route("/gone", get(|| async { AxumStatus::NOT_FOUND }));
    spawn(app).await
}

struct Harness {
    base: String,
    state: AppState,
    client: reqwest::Client,
    _root: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        let root = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = GatewayConfig {
            port: addr.port(),
            host_url: format!("http://{addr}"),
            scratch_root: root.path().to_path_buf(),
            ..GatewayConfig::default()
        };
        let state = AppState::new(config, Arc::new(MockBackend::new()));
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            state,
            client: reqwest::Client::new(),
            _root: root,
        }
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn create(&self) -> String {
        let (status, body) = self.post("/create_sandbox", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        body["sandbox_id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn upload_then_download_round_trip() {
    let source = spawn_source().await;
    let gw = Harness::start().await;
    let id = gw.create().await;

    let (status, body) = gw
        .post(
            "/upload_file",
            json!({
                "sandbox_id": id,
                "file_url": format!("http://{source}/data.csv"),
                "remote_filename": "data.csv"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["status"], "success");
    assert_eq!(body["remote_path"], "/workspace/data.csv");

    let scratch = gw.state.registry.scratch_dir(&id).await.unwrap();
    assert!(!scratch.join("data.csv").exists(), "staging copy must be removed");

    let (status, body) = gw
        .post(
            "/download_file",
            json!({ "sandbox_id": id, "remote_path": "/workspace/data.csv" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let url = body["download_url"].as_str().unwrap().to_string();
    assert_eq!(url, format!("{}/files/{id}/data.csv", gw.base));

    let resp = gw.client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let staged = std::fs::read(scratch.join("data.csv")).unwrap();
    let served = resp.bytes().await.unwrap();
    assert_eq!(&served[..], SOURCE_BODY);
    assert_eq!(&served[..], &staged[..]);
}

#[tokio::test]
async fn upload_from_missing_source_is_500_without_leftovers() {
    let source = spawn_source().await;
    let gw = Harness::start().await;
    let id = gw.create().await;

    let (status, body) = gw
        .post(
            "/upload_file",
            json!({
                "sandbox_id": id,
                "file_url": format!("http://{source}/gone"),
                "remote_filename": "gone.bin"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].as_str().unwrap().contains("404"));

    let scratch = gw.state.registry.scratch_dir(&id).await.unwrap();
    assert!(!scratch.join("gone.bin").exists());
}

#[tokio::test]
async fn stopped_sandbox_files_are_gone() {
    let gw = Harness::start().await;
    let id = gw.create().await;

    gw.post(
        "/write_file",
        json!({ "sandbox_id": id, "content": "x", "remote_path": "/workspace/x.txt" }),
    )
    .await;
    let (status, _) = gw
        .post(
            "/download_file",
            json!({ "sandbox_id": id, "remote_path": "/workspace/x.txt" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let scratch = gw.state.registry.scratch_dir(&id).await.unwrap();

    let (_, body) = gw.post("/stop_sandbox", json!({ "sandbox_id": id })).await;
    assert_eq!(body["status"], "stopped");
    assert!(!scratch.exists());

    let resp = gw
        .client
        .get(format!("{}/files/{id}/x.txt", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    for path in ["/get_sandbox_info", "/download_file", "/upload_file", "/write_file"] {
        let (status, _) = gw
            .post(
                path,
                json!({
                    "sandbox_id": id,
                    "remote_path": "/workspace/x.txt",
                    "content": "x",
                    "file_url": "http://127.0.0.1:9/x",
                    "remote_filename": "x.txt"
                }),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
    }
}

#[tokio::test]
async fn concurrent_sandboxes_do_not_interfere() {
    let gw = Harness::start().await;
    let a = gw.create().await;
    let b = gw.create().await;
    assert_ne!(a, b);

    let (_, body) = gw.post("/stop_sandbox", json!({ "sandbox_id": a })).await;
    assert_eq!(body["status"], "stopped");

    let (status, body) = gw
        .post(
            "/execute_command",
            json!({ "sandbox_id": b, "command": "echo hi" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "Mock Exec: echo hi");
}
