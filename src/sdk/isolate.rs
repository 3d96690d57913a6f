//! Client for an isolate sandbox server.
//!
//! Each gateway sandbox is one isolate session. Commands go through
//! `POST /sessions/{id}/run`, and file transfer is base64 piped through
//! `sh` since the sessions API has no file endpoints.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{SandboxBackend, SandboxHandle, SdkError, SdkResult};

const WRITE_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && printf '%s' "$2" | base64 -d > "$1""#;
const APPEND_SCRIPT: &str = r#"printf '%s' "$2" | base64 -d >> "$1""#;
const READ_SCRIPT: &str = r#"[ -f "$1" ] || exit 3; base64 "$1""#;
/// Exit status of [`READ_SCRIPT`] when the file does not exist.
const MISSING_FILE_EXIT: i32 = 3;
/// Raw bytes per write command. Multiple of 3, so every chunk encodes to
/// 64 KiB of base64 without padding in the middle of the file, well under
/// the kernel's per-argument limit.
const WRITE_CHUNK: usize = 48 * 1024;

#[derive(Serialize)]
struct CreateSessionRequest {
    env: HashMap<String, String>,
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Serialize)]
struct RunRequest<'a> {
    command: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RunResult {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: Option<i32>,
    signal: Option<i32>,
}

impl RunResult {
    fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn output_text(self) -> String {
        let mut output = self.stdout;
        output.push_str(&self.stderr);
        output
    }
}

/// Map a language tag to the interpreter invocation that takes code inline.
fn interpreter(language: &str) -> Option<[&'static str; 2]> {
    match language {
        "py" | "python" | "python3" => Some(["python3", "-c"]),
        "js" | "javascript" | "node" => Some(["node", "-e"]),
        "sh" | "bash" => Some(["sh", "-c"]),
        _ => None,
    }
}

#[derive(Debug)]
struct Endpoint {
    client: Client,
    base_url: Url,
}

impl Endpoint {
    fn url(&self, path: &str) -> SdkResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SdkError::new(format!("invalid path '{path}': {e}")))
    }

    fn request(&self, method: Method, path: &str) -> SdkResult<RequestBuilder> {
        Ok(self.client.request(method, self.url(path)?))
    }

    async fn send(&self, request: RequestBuilder) -> SdkResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| SdkError::new(format!("isolate request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SdkError::new(format!("isolate returned HTTP {status}: {body}")));
        }
        Ok(response)
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(&self, request: RequestBuilder) -> SdkResult<T> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| SdkError::new(format!("invalid isolate response: {e}")))
    }
}

/// Creates isolate sessions on one server.
#[derive(Debug)]
pub struct IsolateBackend {
    endpoint: Arc<Endpoint>,
}

impl IsolateBackend {
    pub fn new(base_url: &str) -> SdkResult<Self> {
        // Url::join drops the last path segment unless the base ends in '/'.
        let base = format!("{}/", base_url.trim_end_matches('/'));
        let base_url =
            Url::parse(&base).map_err(|e| SdkError::new(format!("invalid isolate URL: {e}")))?;
        Ok(Self {
            endpoint: Arc::new(Endpoint {
                client: Client::new(),
                base_url,
            }),
        })
    }
}

#[async_trait]
impl SandboxBackend for IsolateBackend {
    async fn create(&self) -> SdkResult<Arc<dyn SandboxHandle>> {
        let request = self
            .endpoint
            .request(Method::POST, "sessions")?
            .json(&CreateSessionRequest { env: HashMap::new() });
        let created: CreateSessionResponse = self.endpoint.send_json(request).await?;
        info!(session_id = %created.session_id, "isolate session created");
        Ok(Arc::new(IsolateSandbox {
            endpoint: Arc::clone(&self.endpoint),
            session_id: created.session_id,
        }))
    }
}

/// One isolate session.
#[derive(Debug)]
pub struct IsolateSandbox {
    endpoint: Arc<Endpoint>,
    session_id: String,
}

impl IsolateSandbox {
    async fn run(&self, command: Vec<&str>) -> SdkResult<RunResult> {
        let request = self
            .endpoint
            .request(Method::POST, &format!("sessions/{}/run", self.session_id))?
            .json(&RunRequest { command });
        let result: RunResult = self.endpoint.send_json(request).await?;
        debug!(
            session_id = %self.session_id,
            exit_code = ?result.exit_code,
            signal = ?result.signal,
            "isolate run finished"
        );
        Ok(result)
    }

    /// Truncate `remote_path` with the first chunk, then append the rest.
    async fn write_bytes(&self, remote_path: &str, bytes: &[u8]) -> SdkResult<()> {
        let mut chunks = bytes.chunks(WRITE_CHUNK);
        let first = chunks.next().unwrap_or_default();
        self.write_chunk(WRITE_SCRIPT, remote_path, first).await?;
        for chunk in chunks {
            self.write_chunk(APPEND_SCRIPT, remote_path, chunk).await?;
        }
        Ok(())
    }

    async fn write_chunk(&self, script: &str, remote_path: &str, chunk: &[u8]) -> SdkResult<()> {
        let encoded = STANDARD.encode(chunk);
        let result = self
            .run(vec!["sh", "-c", script, "sh", remote_path, encoded.as_str()])
            .await?;
        if !result.succeeded() {
            return Err(SdkError::new(format!(
                "write {remote_path} failed: {}",
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxHandle for IsolateSandbox {
    fn id(&self) -> &str {
        &self.session_id
    }

    async fn info(&self) -> SdkResult<Value> {
        let request = self
            .endpoint
            .request(Method::GET, &format!("sessions/{}", self.session_id))?;
        let mut info: Value = self.endpoint.send_json(request).await?;
        if let Value::Object(map) = &mut info {
            map.entry("status").or_insert_with(|| Value::from("running"));
            map.entry("host")
                .or_insert_with(|| Value::from(self.endpoint.base_url.as_str()));
        }
        Ok(info)
    }

    async fn execute_command(&self, command: &str) -> SdkResult<String> {
        Ok(self.run(vec!["sh", "-c", command]).await?.output_text())
    }

    async fn run_code(&self, language: &str, code: &str) -> SdkResult<String> {
        let [bin, flag] = interpreter(language)
            .ok_or_else(|| SdkError::new(format!("unsupported language: {language}")))?;
        Ok(self.run(vec![bin, flag, code]).await?.output_text())
    }

    async fn write_file(&self, content: &str, remote_path: &str) -> SdkResult<()> {
        self.write_bytes(remote_path, content.as_bytes()).await
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> SdkResult<()> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| SdkError::new(format!("read {}: {e}", local_path.display())))?;
        self.write_bytes(remote_path, &bytes).await
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> SdkResult<()> {
        let result = self
            .run(vec!["sh", "-c", READ_SCRIPT, "sh", remote_path])
            .await?;
        if result.exit_code == Some(MISSING_FILE_EXIT) {
            debug!(session_id = %self.session_id, remote_path, "remote file missing");
            return Ok(());
        }
        if !result.succeeded() {
            return Err(SdkError::new(format!(
                "read {remote_path} failed: {}",
                result.stderr.trim()
            )));
        }
        let encoded: String = result.stdout.split_whitespace().collect();
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| SdkError::new(format!("decode {remote_path}: {e}")))?;
        tokio::fs::write(local_path, bytes)
            .await
            .map_err(|e| SdkError::new(format!("write {}: {e}", local_path.display())))
    }

    async fn stop(&self) -> SdkResult<()> {
        let request = self
            .endpoint
            .request(Method::DELETE, &format!("sessions/{}", self.session_id))?;
        self.endpoint.send(request).await?;
        info!(session_id = %self.session_id, "isolate session deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path as AxumPath, State},
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct FakeIsolate {
        commands: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[derive(Deserialize)]
    struct FakeRun {
        command: Vec<String>,
    }

    async fn fake_create() -> Json<Value> {
        Json(json!({ "session_id": "sess-1" }))
    }

    async fn fake_info(AxumPath(id): AxumPath<String>) -> Result<Json<Value>, StatusCode> {
        if id != "sess-1" {
            return Err(StatusCode::NOT_FOUND);
        }
        Ok(Json(json!({ "id": id, "cwd": "/", "age_secs": 1, "idle_secs": 0 })))
    }

    async fn fake_delete(AxumPath(id): AxumPath<String>) -> StatusCode {
        if id == "sess-1" {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::NOT_FOUND
        }
    }

    async fn fake_run(
        State(fake): State<FakeIsolate>,
        Json(req): Json<FakeRun>,
    ) -> Json<Value> {
        fake.commands.lock().unwrap().push(req.command.clone());
        let script = req.command.get(2).cloned().unwrap_or_default();
        if script == WRITE_SCRIPT || script == APPEND_SCRIPT {
            return Json(json!({ "stdout": "", "stderr": "", "exit_code": 0, "signal": null }));
        }
        if script == READ_SCRIPT {
            return if req.command[4] == "/workspace/present.txt" {
                // base64 wraps lines; the client must strip whitespace.
                Json(json!({ "stdout": "cGF5\nbG9hZA==\n", "stderr": "", "exit_code": 0, "signal": null }))
            } else {
                Json(json!({ "stdout": "", "stderr": "", "exit_code": 3, "signal": null }))
            };
        }
        Json(json!({
            "stdout": format!("ran {}\n", req.command.join(" ")),
            "stderr": "warn\n",
            "exit_code": 0,
            "signal": null
        }))
    }

    async fn spawn_fake() -> (String, FakeIsolate) {
        let fake = FakeIsolate::default();
        let app = Router::new()
            .route("/sessions", post(fake_create))
            .route("/sessions/:id", get(fake_info).delete(fake_delete))
            .route("/sessions/:id/run", post(fake_run))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), fake)
    }

    #[test]
    fn interpreter_mapping() {
        assert_eq!(interpreter("py"), Some(["python3", "-c"]));
        assert_eq!(interpreter("node"), Some(["node", "-e"]));
        assert_eq!(interpreter("bash"), Some(["sh", "-c"]));
        assert_eq!(interpreter("cobol"), None);
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(IsolateBackend::new("not a url").is_err());
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let (url, _fake) = spawn_fake().await;
        let backend = IsolateBackend::new(&format!("{url}/")).unwrap();
        let sandbox = backend.create().await.unwrap();
        assert_eq!(sandbox.id(), "sess-1");

        let info = sandbox.info().await.unwrap();
        assert_eq!(info["id"], "sess-1");
        assert_eq!(info["status"], "running");

        sandbox.stop().await.unwrap();
    }

    #[tokio::test]
    async fn commands_and_code_go_through_run() {
        let (url, fake) = spawn_fake().await;
        let sandbox = IsolateBackend::new(&url).unwrap().create().await.unwrap();

        let out = sandbox.execute_command("echo hi").await.unwrap();
        assert_eq!(out, "ran sh -c echo hi\nwarn\n");

        let out = sandbox.run_code("py", "print(1)").await.unwrap();
        assert_eq!(out, "ran python3 -c print(1)\nwarn\n");

        let err = sandbox.run_code("cobol", "x").await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported language: cobol");

        assert_eq!(fake.commands.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn write_sends_base64_payload() {
        let (url, fake) = spawn_fake().await;
        let sandbox = IsolateBackend::new(&url).unwrap().create().await.unwrap();
        sandbox.write_file("hello", "/workspace/a.txt").await.unwrap();

        let commands = fake.commands.lock().unwrap();
        let last = commands.last().unwrap();
        assert_eq!(last[4], "/workspace/a.txt");
        assert_eq!(last[5], STANDARD.encode("hello"));
    }

    #[tokio::test]
    async fn large_write_is_split_into_appends() {
        let (url, fake) = spawn_fake().await;
        let sandbox = IsolateBackend::new(&url).unwrap().create().await.unwrap();
        let payload: String = (0..150 * 1024).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        sandbox.write_file(&payload, "/workspace/big.txt").await.unwrap();

        let commands = fake.commands.lock().unwrap();
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0][2], WRITE_SCRIPT);
        assert!(commands[1..].iter().all(|c| c[2] == APPEND_SCRIPT));

        let mut written = Vec::new();
        for command in commands.iter() {
            assert_eq!(command[4], "/workspace/big.txt");
            assert!(command[5].len() <= 64 * 1024);
            written.extend(STANDARD.decode(&command[5]).unwrap());
        }
        assert_eq!(written, payload.as_bytes());
    }

    #[tokio::test]
    async fn empty_write_still_truncates() {
        let (url, fake) = spawn_fake().await;
        let sandbox = IsolateBackend::new(&url).unwrap().create().await.unwrap();
        sandbox.write_file("", "/workspace/empty.txt").await.unwrap();

        let commands = fake.commands.lock().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0][2], WRITE_SCRIPT);
        assert_eq!(commands[0][5], "");
    }

    #[tokio::test]
    async fn download_decodes_or_leaves_nothing() {
        let (url, _fake) = spawn_fake().await;
        let sandbox = IsolateBackend::new(&url).unwrap().create().await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let present = dir.path().join("present.txt");
        sandbox
            .download_file("/workspace/present.txt", &present)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&present).unwrap(), b"payload");

        let missing = dir.path().join("missing.txt");
        sandbox
            .download_file("/workspace/missing.txt", &missing)
            .await
            .unwrap();
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn http_errors_carry_status() {
        let (url, _fake) = spawn_fake().await;
        let sandbox = IsolateSandbox {
            endpoint: Arc::new(Endpoint {
                client: Client::new(),
                base_url: Url::parse(&format!("{url}/")).unwrap(),
            }),
            session_id: "gone".to_string(),
        };
        let err = sandbox.stop().await.unwrap_err();
        assert!(err.to_string().contains("404"), "got: {err}");
    }
}
