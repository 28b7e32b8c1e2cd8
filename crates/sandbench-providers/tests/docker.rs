//! Docker backend against a scripted Engine API on a Unix socket.

use sandbench_core::{
    encode_frame, CoreError, ExecRequest, LaunchSpec, SandboxProvider, SandboxState, StreamKind,
};
use sandbench_providers::{DockerConfig, DockerProvider};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

struct Reply {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
    chunked: bool,
}

impl Reply {
    fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.as_bytes().to_vec(),
            chunked: false,
        }
    }

    fn empty(status: u16) -> Self {
        Self::json(status, "")
    }

    fn encode(&self) -> Vec<u8> {
        let reason = match self.status {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            304 => "Not Modified",
            404 => "Not Found",
            _ => "Internal Server Error",
        };
        let mut out = format!(
            "HTTP/1.1 {} {reason}\r\nContent-Type: {}\r\n",
            self.status, self.content_type
        )
        .into_bytes();

        if self.chunked {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");
            // odd-sized chunks so frames straddle chunk boundaries
            for piece in self.body.chunks(3) {
                out.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
                out.extend_from_slice(piece);
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"0\r\n\r\n");
        } else if self.status == 204 || self.status == 304 {
            out.extend_from_slice(b"\r\n");
        } else {
            out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
            out.extend_from_slice(&self.body);
        }
        out
    }
}

/// Just enough of the Engine API for one container and one exec at a time.
#[derive(Clone, Default)]
struct FakeEngine {
    /// `METHOD path?query` of every request, in order.
    log: Arc<Mutex<Vec<String>>>,
    /// Request bodies keyed by path.
    bodies: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    fail_start: bool,
    exec_wire: Vec<u8>,
}

impl FakeEngine {
    fn with_output(stdout: &str, stderr: &str) -> Self {
        let mut wire = encode_frame(StreamKind::Stdout, stdout.as_bytes()).to_vec();
        wire.extend_from_slice(&encode_frame(StreamKind::Stderr, stderr.as_bytes()));
        Self {
            exec_wire: wire,
            ..Default::default()
        }
    }

    fn route(&self, method: &str, target: &str) -> Reply {
        let path = target.split('?').next().unwrap_or(target);
        match (method, path) {
            ("GET", "/_ping") => Reply::json(200, "OK"),
            ("GET", "/containers/json") => Reply::json(
                200,
                r#"[{"Id":"c0ffee","Labels":{"sandbench.sandbox-id":"sb-d"}},
                    {"Id":"beef","Labels":{"sandbench.sandbox-id":"other-run-0"}},
                    {"Id":"cafe","Labels":null}]"#,
            ),
            ("GET", "/version") => Reply::json(200, r#"{"Version":"27.0.3","ApiVersion":"1.46"}"#),
            ("POST", "/containers/create") => Reply::json(201, r#"{"Id":"c0ffee","Warnings":[]}"#),
            ("POST", "/containers/c0ffee/start") if self.fail_start => {
                Reply::json(500, r#"{"message":"port is already allocated"}"#)
            }
            ("POST", "/containers/c0ffee/start") => Reply::empty(204),
            ("POST", "/containers/c0ffee/exec") => Reply::json(201, r#"{"Id":"e1"}"#),
            ("POST", "/exec/e1/start") => Reply {
                status: 200,
                content_type: "application/vnd.docker.raw-stream",
                body: self.exec_wire.clone(),
                chunked: true,
            },
            ("GET", "/exec/e1/json") => Reply::json(200, r#"{"ExitCode":3,"Running":false}"#),
            ("GET", "/containers/c0ffee/stats") => {
                Reply::json(200, r#"{"memory_stats":{"usage":1048576}}"#)
            }
            ("POST", "/containers/c0ffee/stop") => Reply::empty(304),
            ("DELETE", "/containers/c0ffee") => Reply::empty(204),
            _ => Reply::json(404, r#"{"message":"page not found"}"#),
        }
    }

    async fn handle(&self, mut stream: UnixStream) -> std::io::Result<()> {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        loop {
            let header_end = loop {
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
                let n = stream.read(&mut tmp).await?;
                if n == 0 {
                    return Ok(());
                }
                buf.extend_from_slice(&tmp[..n]);
            };

            let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
            let mut lines = head.lines();
            let mut request_line = lines.next().unwrap_or_default().split_whitespace();
            let method = request_line.next().unwrap_or_default().to_string();
            let target = request_line.next().unwrap_or_default().to_string();
            let content_length = lines
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);

            while buf.len() < header_end + content_length {
                let n = stream.read(&mut tmp).await?;
                if n == 0 {
                    return Ok(());
                }
                buf.extend_from_slice(&tmp[..n]);
            }
            let body: Vec<u8> = buf.drain(..header_end + content_length).skip(header_end).collect();

            self.log.lock().unwrap().push(format!("{method} {target}"));
            if let Ok(json) = serde_json::from_slice(&body) {
                self.bodies.lock().unwrap().push((target.clone(), json));
            }

            stream.write_all(&self.route(&method, &target).encode()).await?;
        }
    }

    fn serve(&self, socket: &Path) {
        let listener = UnixListener::bind(socket).unwrap();
        let engine = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let _ = engine.handle(stream).await;
                });
            }
        });
    }

    fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn body_for(&self, path: &str) -> Option<serde_json::Value> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, b)| b.clone())
    }
}

fn provider(engine: &FakeEngine, dir: &tempfile::TempDir) -> DockerProvider {
    let socket = dir.path().join("docker.sock");
    engine.serve(&socket);
    DockerProvider::new(DockerConfig {
        socket_path: socket,
        ..Default::default()
    })
}

fn spec(dir: &tempfile::TempDir) -> LaunchSpec {
    LaunchSpec {
        id: "sb-d".into(),
        image: "alpine:3.20".into(),
        mount_path: dir.path().join("workspace"),
        ssh_port: 2240,
        memory_mib: Some(256),
        cpus: Some(1),
        env: BTreeMap::new(),
        mount_target: "/workspace".into(),
    }
}

#[tokio::test]
async fn test_availability_and_info() {
    let dir = tempfile::tempdir().unwrap();
    let provider = provider(&FakeEngine::default(), &dir);

    assert!(provider.is_available().await);
    let info = provider.info().await;
    assert_eq!(info.version, "27.0.3 (api 1.46)");
    assert!(info.features.contains("framed-exec"));
    assert!(info.features.contains("host-mount"));
}

#[tokio::test]
async fn test_missing_socket_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let provider = DockerProvider::new(DockerConfig {
        socket_path: dir.path().join("absent.sock"),
        ..Default::default()
    });
    assert!(!provider.is_available().await);
    assert_eq!(provider.info().await.version, "unknown");
}

#[tokio::test]
async fn test_create_and_exec() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::with_output("hi\n", "warn\n");
    let provider = provider(&engine, &dir);

    let sandbox = provider.create(&spec(&dir)).await.unwrap();
    let result = sandbox.exec(ExecRequest::new("echo").arg("hi")).await.unwrap();

    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.stderr, "warn\n");
    assert_eq!(result.exit_code, 3);
    assert_eq!(sandbox.state().await, SandboxState::Running);

    let create = engine.body_for("/containers/create?name=sandbench-sb-d").unwrap();
    assert_eq!(create["Image"], "alpine:3.20");
    assert_eq!(create["HostConfig"]["PortBindings"]["22/tcp"][0]["HostPort"], "2240");

    // no user installed, so the exec runs as root
    let exec = engine.body_for("/containers/c0ffee/exec").unwrap();
    assert_eq!(exec["Cmd"], serde_json::json!(["echo", "hi"]));
    assert_eq!(exec["User"], "0:0");
}

#[tokio::test]
async fn test_exec_streaming_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::with_output("streamed output", "");
    let provider = provider(&engine, &dir);
    let sandbox = provider.create(&spec(&dir)).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = sandbox
        .exec_streaming(ExecRequest::new("cat").arg("log"), tx)
        .await
        .unwrap();

    let mut streamed = Vec::new();
    while let Some(chunk) = rx.recv().await {
        assert_eq!(chunk.stream, StreamKind::Stdout);
        streamed.extend_from_slice(&chunk.data);
    }
    assert_eq!(streamed, b"streamed output");
    assert_eq!(result.stdout, "streamed output");
}

#[tokio::test]
async fn test_malformed_stream_is_decode_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine {
        exec_wire: vec![9, 0, 0, 0, 0, 0, 0, 1, b'x'],
        ..Default::default()
    };
    let provider = provider(&engine, &dir);
    let sandbox = provider.create(&spec(&dir)).await.unwrap();

    let err = sandbox.exec(ExecRequest::new("true")).await.unwrap_err();
    assert!(matches!(err, CoreError::Decode(_)));
}

#[tokio::test]
async fn test_failed_start_removes_container() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine {
        fail_start: true,
        ..Default::default()
    };
    let provider = provider(&engine, &dir);

    let err = provider.create(&spec(&dir)).await.unwrap_err();

    assert!(matches!(&err, CoreError::CreateFailed(msg) if msg.contains("port is already allocated")));
    assert!(engine
        .requests()
        .contains(&"DELETE /containers/c0ffee?force=true&v=true".to_string()));
}

#[tokio::test]
async fn test_stop_removes_container_once() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    let provider = provider(&engine, &dir);
    let sandbox = provider.create(&spec(&dir)).await.unwrap();

    sandbox.stop().await;
    sandbox.stop().await;

    let requests = engine.requests();
    assert!(requests.contains(&"POST /containers/c0ffee/stop?t=2".to_string()));
    let deletes = requests.iter().filter(|r| r.starts_with("DELETE ")).count();
    assert_eq!(deletes, 1);
}

#[tokio::test]
async fn test_remove_labelled_reclaims_unregistered_container() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    let provider = provider(&engine, &dir);

    // created, then abandoned before anything could stop it
    drop(provider.create(&spec(&dir)).await.unwrap());

    let removed = provider.remove_labelled(&["sb-d".to_string()]).await.unwrap();
    assert_eq!(removed, 1);

    let requests = engine.requests();
    let list = requests
        .iter()
        .find(|r| r.starts_with("GET /containers/json"))
        .unwrap();
    assert!(list.contains("all=true"));
    assert!(list.contains("sandbench.sandbox-id"));
    assert!(requests.contains(&"DELETE /containers/c0ffee?force=true&v=true".to_string()));
    assert!(!requests.iter().any(|r| r.contains("beef") || r.contains("cafe")));
}

#[tokio::test]
async fn test_memory_from_stats() {
    let dir = tempfile::tempdir().unwrap();
    let provider = provider(&FakeEngine::default(), &dir);
    let sandbox = provider.create(&spec(&dir)).await.unwrap();

    let metrics = sandbox.update_stats().await;
    assert_eq!(metrics.memory_bytes, Some(1_048_576));
}

#[tokio::test]
#[ignore = "requires a running Docker daemon and the alpine:3.20 image"]
async fn test_real_docker_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let provider = DockerProvider::default();
    assert!(provider.is_available().await);

    let mut spec = spec(&dir);
    spec.id = format!("it-{}", std::process::id());
    std::fs::create_dir_all(&spec.mount_path).unwrap();
    std::fs::write(spec.mount_path.join("hello.txt"), "from host").unwrap();

    let sandbox = provider.create(&spec).await.unwrap();
    let result = sandbox
        .exec(ExecRequest::new("cat").arg("/workspace/hello.txt"))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "from host");

    let result = sandbox
        .exec(ExecRequest::new("sh").args(["-c", "echo out; echo err >&2; exit 7"]))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 7);
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");

    sandbox.stop().await;
}
