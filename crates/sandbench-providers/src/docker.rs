//! Container backend driving the Docker Engine API over its Unix socket.
//!
//! Each sandbox is one container kept alive by `sleep infinity`. Commands
//! run as execs; their output arrives as a framed stream on the exec-start
//! response body and goes through the [`StreamDemultiplexer`].

use async_trait::async_trait;
use bytes::Bytes;
use hyper::body::HttpBody;
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use sandbench_core::{
    CoreError, ExecOutput, ExecRequest, Identity, IsolationType, LaunchSpec, OutputChunk,
    ProviderInfo, Result, Sandbox, SandboxBackend, SandboxProvider, StreamDemultiplexer,
    SYNTHETIC_EXIT_CODE,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

pub const DOCKER: &str = "docker";

/// Default Engine API socket.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Label carrying the sandbox id on every container we create.
pub const LABEL_SANDBOX_ID: &str = "sandbench.sandbox-id";

/// `{"label":["sandbench.sandbox-id"]}`, query-encoded.
const LABEL_FILTER: &str = "%7B%22label%22%3A%5B%22sandbench.sandbox-id%22%5D%7D";

const KEEP_ALIVE: [&str; 2] = ["sleep", "infinity"];

/// Polls of the exec inspect endpoint while the daemon records the exit code.
const EXIT_CODE_POLLS: u32 = 50;
const EXIT_CODE_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub socket_path: PathBuf,
    /// Grace period the daemon gives a container on stop.
    pub stop_timeout_secs: u32,
    /// Bound on the availability ping.
    pub ping_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET),
            stop_timeout_secs: 2,
            ping_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("docker request failed: {0}")]
    Transport(#[from] hyper::Error),

    #[error("invalid docker request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("docker returned {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("unexpected docker response: {0}")]
    Body(#[from] serde_json::Error),
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn create_failed(e: ApiError) -> CoreError {
    CoreError::CreateFailed(e.to_string())
}

fn transport_failed(e: ApiError) -> CoreError {
    CoreError::ExecTransportFailed(e.to_string())
}

fn status_error(status: StatusCode, body: &[u8]) -> ApiError {
    #[derive(Deserialize)]
    struct Message {
        message: String,
    }

    let message = serde_json::from_slice::<Message>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    ApiError::Status { status, message }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionResponse {
    version: String,
    #[serde(default)]
    api_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecInspect {
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    memory_stats: MemoryStats,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryStats {
    usage: Option<u64>,
}

/// Minimal Engine API client.
#[derive(Clone)]
struct DockerApi {
    socket: PathBuf,
    client: Client<UnixConnector>,
}

impl DockerApi {
    fn new(socket: PathBuf) -> Self {
        Self {
            socket,
            client: Client::unix(),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ApiResult<Response<Body>> {
        let uri: hyper::Uri = Uri::new(&self.socket, path).into();
        let mut builder = Request::builder().method(method.clone()).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        tracing::trace!(%method, path, "Docker API request");
        Ok(self.client.request(builder.body(body)?).await?)
    }

    /// Send a request and collect the whole response.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ApiResult<(StatusCode, Bytes)> {
        let response = self.request(method, path, body).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, bytes))
    }

    /// Send a request that must succeed, ignoring the body.
    async fn expect_ok(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ApiResult<()> {
        let (status, bytes) = self.call(method, path, body).await?;
        if !status.is_success() {
            return Err(status_error(status, &bytes));
        }
        Ok(())
    }

    async fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ApiResult<T> {
        let (status, bytes) = self.call(method, path, body).await?;
        if !status.is_success() {
            return Err(status_error(status, &bytes));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Stop (tolerating "already stopped" and "gone") and force-remove.
    async fn remove_container(&self, id: &str, stop_timeout_secs: u32) -> ApiResult<()> {
        match self
            .call(Method::POST, &format!("/containers/{id}/stop?t={stop_timeout_secs}"), None)
            .await
        {
            Ok((status, _))
                if status.is_success()
                    || status == StatusCode::NOT_MODIFIED
                    || status == StatusCode::NOT_FOUND => {}
            Ok((status, bytes)) => {
                let error = status_error(status, &bytes);
                tracing::warn!(container = %id, error = %error, "Container stop failed");
            }
            Err(e) => {
                tracing::warn!(container = %id, error = %e, "Container stop failed");
            }
        }

        let (status, bytes) = self
            .call(Method::DELETE, &format!("/containers/{id}?force=true&v=true"), None)
            .await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(status_error(status, &bytes))
        }
    }
}

/// Container name for a sandbox id.
pub fn container_name(sandbox_id: &str) -> String {
    format!("sandbench-{sandbox_id}")
}

/// Body for `POST /containers/create`.
fn container_create_body(spec: &LaunchSpec) -> Value {
    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let mut host_config = json!({
        "Binds": [format!("{}:{}", spec.mount_path.display(), spec.mount_target)],
        "PortBindings": {
            "22/tcp": [{ "HostIp": "127.0.0.1", "HostPort": spec.ssh_port.to_string() }]
        },
        "Init": true,
    });
    if let Some(mib) = spec.memory_mib {
        host_config["Memory"] = json!(u64::from(mib) * 1024 * 1024);
    }
    if let Some(cpus) = spec.cpus {
        host_config["NanoCpus"] = json!(u64::from(cpus) * 1_000_000_000);
    }

    json!({
        "Image": spec.image,
        "Cmd": KEEP_ALIVE,
        "Env": env,
        "Labels": { LABEL_SANDBOX_ID: spec.id },
        "ExposedPorts": { "22/tcp": {} },
        "HostConfig": host_config,
    })
}

/// `User` field for an exec. `None` keeps the image's default user.
fn exec_user(identity: &Identity) -> Option<String> {
    match identity {
        Identity::Default => None,
        Identity::Root => Some("0:0".into()),
        Identity::User { uid, gid } => Some(format!("{uid}:{gid}")),
    }
}

/// Body for `POST /containers/{id}/exec`.
fn exec_create_body(request: &ExecRequest) -> Value {
    let env: Vec<String> = request.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let mut body = json!({
        "AttachStdin": false,
        "AttachStdout": true,
        "AttachStderr": true,
        "Tty": false,
        "Cmd": request.command,
        "Env": env,
    });
    if let Some(dir) = &request.workdir {
        body["WorkingDir"] = json!(dir);
    }
    if let Some(user) = exec_user(&request.identity) {
        body["User"] = json!(user);
    }
    body
}

/// Docker provider.
pub struct DockerProvider {
    config: DockerConfig,
    api: DockerApi,
}

impl Default for DockerProvider {
    fn default() -> Self {
        Self::new(DockerConfig::default())
    }
}

impl DockerProvider {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            api: DockerApi::new(config.socket_path.clone()),
            config,
        }
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    /// Force-remove every container labelled with one of `sandbox_ids`.
    ///
    /// Catches containers whose sandbox never reached a registry, such as
    /// a create interrupted between the daemon call and its return.
    /// Returns how many containers were removed.
    pub async fn remove_labelled(&self, sandbox_ids: &[String]) -> Result<usize> {
        let wanted: HashSet<&str> = sandbox_ids.iter().map(String::as_str).collect();
        let containers: Vec<ContainerSummary> = self
            .api
            .json(Method::GET, &format!("/containers/json?all=true&filters={LABEL_FILTER}"), None)
            .await
            .map_err(transport_failed)?;

        let mut removed = 0;
        for container in containers {
            let owner = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_SANDBOX_ID));
            let Some(owner) = owner.filter(|id| wanted.contains(id.as_str())) else {
                continue;
            };
            match self.api.remove_container(&container.id, 0).await {
                Ok(()) => {
                    tracing::info!(sandbox_id = %owner, container = %container.id, "Removed leftover container");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %owner, container = %container.id, error = %e, "Leftover container removal failed");
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &str {
        DOCKER
    }

    async fn is_available(&self) -> bool {
        let ping = self.api.call(Method::GET, "/_ping", None);
        match tokio::time::timeout(self.config.ping_timeout, ping).await {
            Ok(Ok((status, _))) => status.is_success(),
            Ok(Err(e)) => {
                tracing::debug!(socket = %self.config.socket_path.display(), error = %e, "Docker ping failed");
                false
            }
            Err(_) => {
                tracing::debug!(socket = %self.config.socket_path.display(), "Docker ping timed out");
                false
            }
        }
    }

    async fn info(&self) -> ProviderInfo {
        let version = match self.api.json::<VersionResponse>(Method::GET, "/version", None).await {
            Ok(v) => match v.api_version {
                Some(api) => format!("{} (api {api})", v.version),
                None => v.version,
            },
            Err(e) => {
                tracing::debug!(error = %e, "Docker version query failed");
                "unknown".into()
            }
        };
        ProviderInfo::new(DOCKER, version, IsolationType::Container)
            .with_feature("host-mount")
            .with_feature("framed-exec")
            .with_feature("port-publish")
            .with_feature("native-user")
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<Sandbox> {
        let name = container_name(&spec.id);
        let body = container_create_body(spec);
        tracing::trace!(sandbox_id = %spec.id, body = %body, "Container create body");

        let created: IdResponse = self
            .api
            .json(Method::POST, &format!("/containers/create?name={name}"), Some(body))
            .await
            .map_err(create_failed)?;

        if let Err(e) = self
            .api
            .expect_ok(Method::POST, &format!("/containers/{}/start", created.id), None)
            .await
        {
            tracing::error!(sandbox_id = %spec.id, container = %created.id, error = %e, "Container start failed");
            if let Err(e) = self.api.remove_container(&created.id, 0).await {
                tracing::warn!(container = %created.id, error = %e, "Failed to remove unstarted container");
            }
            return Err(create_failed(e));
        }

        tracing::info!(
            sandbox_id = %spec.id,
            container = %created.id,
            image = %spec.image,
            "Container started"
        );

        let backend = DockerBackend {
            api: self.api.clone(),
            container_id: created.id,
            stop_timeout_secs: self.config.stop_timeout_secs,
        };
        Ok(Sandbox::new(spec, DOCKER, Box::new(backend)))
    }
}

struct DockerBackend {
    api: DockerApi,
    container_id: String,
    stop_timeout_secs: u32,
}

impl DockerBackend {
    async fn exit_code(&self, exec_id: &str) -> Result<i64> {
        let path = format!("/exec/{exec_id}/json");
        for _ in 0..EXIT_CODE_POLLS {
            let inspect: ExecInspect = self
                .api
                .json(Method::GET, &path, None)
                .await
                .map_err(transport_failed)?;
            if !inspect.running {
                return Ok(inspect.exit_code.unwrap_or(SYNTHETIC_EXIT_CODE));
            }
            tokio::time::sleep(EXIT_CODE_POLL_INTERVAL).await;
        }
        tracing::warn!(exec = %exec_id, "Exec still running after its output closed");
        Ok(SYNTHETIC_EXIT_CODE)
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn exec(
        &self,
        request: &ExecRequest,
        output: Option<&mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecOutput> {
        let created: IdResponse = self
            .api
            .json(
                Method::POST,
                &format!("/containers/{}/exec", self.container_id),
                Some(exec_create_body(request)),
            )
            .await
            .map_err(transport_failed)?;

        let response = self
            .api
            .request(
                Method::POST,
                &format!("/exec/{}/start", created.id),
                Some(json!({ "Detach": false, "Tty": false })),
            )
            .await
            .map_err(transport_failed)?;

        let status = response.status();
        if !status.is_success() {
            let bytes = hyper::body::to_bytes(response.into_body())
                .await
                .unwrap_or_default();
            return Err(transport_failed(status_error(status, &bytes)));
        }

        let mut body = response.into_body();
        let mut decoder = StreamDemultiplexer::new();
        while let Some(data) = body.data().await {
            let data = data.map_err(|e| transport_failed(e.into()))?;
            for chunk in decoder.push(&data)? {
                if let Some(tx) = output {
                    let _ = tx.send(chunk);
                }
            }
        }
        let (stdout, stderr) = decoder.finish()?;

        Ok(ExecOutput {
            exit_code: self.exit_code(&created.id).await?,
            stdout,
            stderr,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.api
            .remove_container(&self.container_id, self.stop_timeout_secs)
            .await
            .map_err(|e| {
                CoreError::Io(std::io::Error::other(format!(
                    "failed to remove container {}: {e}",
                    self.container_id
                )))
            })?;
        tracing::debug!(container = %self.container_id, "Container removed");
        Ok(())
    }

    async fn memory_bytes(&self) -> Option<u64> {
        let path = format!("/containers/{}/stats?stream=false&one-shot=true", self.container_id);
        match self.api.json::<StatsResponse>(Method::GET, &path, None).await {
            Ok(stats) => stats.memory_stats.usage,
            Err(e) => {
                tracing::debug!(container = %self.container_id, error = %e, "Container stats unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            id: "sb-1".into(),
            image: "alpine:3.20".into(),
            mount_path: PathBuf::from("/tmp/sandbench/sb-1/workspace"),
            ssh_port: 2222,
            memory_mib: Some(512),
            cpus: Some(2),
            env: BTreeMap::from([("LANG".to_string(), "C".to_string())]),
            mount_target: "/workspace".into(),
        }
    }

    #[test]
    fn test_container_create_body() {
        let body = container_create_body(&spec());

        assert_eq!(body["Image"], "alpine:3.20");
        assert_eq!(body["Cmd"], json!(["sleep", "infinity"]));
        assert_eq!(body["Env"], json!(["LANG=C"]));
        assert_eq!(body["Labels"][LABEL_SANDBOX_ID], "sb-1");
        assert_eq!(
            body["HostConfig"]["Binds"],
            json!(["/tmp/sandbench/sb-1/workspace:/workspace"])
        );
        assert_eq!(body["HostConfig"]["Memory"], 512 * 1024 * 1024);
        assert_eq!(body["HostConfig"]["NanoCpus"], 2_000_000_000u64);
        assert_eq!(
            body["HostConfig"]["PortBindings"]["22/tcp"][0]["HostPort"],
            "2222"
        );
    }

    #[test]
    fn test_unlimited_resources_are_omitted() {
        let mut spec = spec();
        spec.memory_mib = None;
        spec.cpus = None;

        let body = container_create_body(&spec);
        assert!(body["HostConfig"].get("Memory").is_none());
        assert!(body["HostConfig"].get("NanoCpus").is_none());
    }

    #[test]
    fn test_exec_create_body() {
        let request = ExecRequest::new("ls")
            .arg("-la")
            .env("HOME", "/home/agent")
            .workdir("/workspace")
            .as_user(1000, 1000);

        let body = exec_create_body(&request);
        assert_eq!(body["Cmd"], json!(["ls", "-la"]));
        assert_eq!(body["Env"], json!(["HOME=/home/agent"]));
        assert_eq!(body["WorkingDir"], "/workspace");
        assert_eq!(body["User"], "1000:1000");
        assert_eq!(body["Tty"], false);
    }

    #[test]
    fn test_exec_user() {
        assert_eq!(exec_user(&Identity::Default), None);
        assert_eq!(exec_user(&Identity::Root).as_deref(), Some("0:0"));
        assert_eq!(
            exec_user(&Identity::User { uid: 1500, gid: 1600 }).as_deref(),
            Some("1500:1600")
        );
    }

    #[test]
    fn test_status_error_message() {
        let err = status_error(
            StatusCode::NOT_FOUND,
            br#"{"message":"No such image: nope:latest"}"#,
        );
        assert_eq!(err.to_string(), "docker returned 404 Not Found: No such image: nope:latest");

        let err = status_error(StatusCode::INTERNAL_SERVER_ERROR, b"boom\n");
        assert!(err.to_string().ends_with(": boom"));
    }

    #[test]
    fn test_response_parsing() {
        let inspect: ExecInspect =
            serde_json::from_str(r#"{"ExitCode":3,"Running":false,"Pid":42}"#).unwrap();
        assert_eq!(inspect.exit_code, Some(3));
        assert!(!inspect.running);

        let stats: StatsResponse =
            serde_json::from_str(r#"{"memory_stats":{"usage":1048576,"limit":2}}"#).unwrap();
        assert_eq!(stats.memory_stats.usage, Some(1_048_576));

        let stopped: StatsResponse = serde_json::from_str(r#"{"memory_stats":{}}"#).unwrap();
        assert_eq!(stopped.memory_stats.usage, None);
    }

    #[test]
    fn test_container_name() {
        assert_eq!(container_name("bench-0"), "sandbench-bench-0");
    }
}
