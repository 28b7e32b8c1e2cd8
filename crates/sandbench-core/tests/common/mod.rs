//! Shared test doubles: an in-memory "guest OS" backend and a provider for it.

#![allow(dead_code)]

use async_trait::async_trait;
use sandbench_core::{
    encode_frame, CoreError, ExecOutput, ExecRequest, LaunchSpec, OutputChunk, ProviderInfo,
    IsolationType, Result, Sandbox, SandboxBackend, SandboxProvider, StreamDemultiplexer,
    StreamKind, UserTools,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Directory metadata: owner uid, owner gid, mode.
pub type DirMeta = (u32, u32, u32);

/// Just enough of a Linux userland to run the user bootstrap against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeOs {
    pub tools: Option<UserTools>,
    /// gid -> group name
    pub groups: BTreeMap<u32, String>,
    /// name -> (uid, gid, home)
    pub users: BTreeMap<String, (u32, u32, String)>,
    pub dirs: BTreeMap<String, DirMeta>,
}

impl FakeOs {
    pub fn new(tools: Option<UserTools>) -> Self {
        Self {
            tools,
            groups: BTreeMap::from([(0, "root".to_string())]),
            users: BTreeMap::from([("root".to_string(), (0, 0, "/root".to_string()))]),
            dirs: BTreeMap::from([
                ("/".to_string(), (0, 0, 0o755)),
                ("/workspace".to_string(), (0, 0, 0o755)),
                ("/workspace/src".to_string(), (0, 0, 0o755)),
            ]),
        }
    }

    fn run(&mut self, argv: &[String]) -> (i64, String, String) {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["echo", rest @ ..] => (0, rest.join(" "), String::new()),
            ["sh", "-c", "command -v useradd"] => {
                let found = self.tools == Some(UserTools::Shadow);
                exit(found, "/usr/sbin/useradd")
            }
            ["sh", "-c", "command -v adduser"] => {
                let found = self.tools == Some(UserTools::Busybox);
                exit(found, "/bin/adduser")
            }
            ["getent", "group", gid] => match self.groups.get(&parse(gid)) {
                Some(name) => (0, format!("{name}:x:{gid}:\n"), String::new()),
                None => (2, String::new(), String::new()),
            },
            ["groupadd", "-o", "-g", gid, name] | ["addgroup", "-g", gid, name] => {
                if self.groups.values().any(|g| g == name) {
                    return (9, String::new(), format!("group '{name}' already exists"));
                }
                self.groups.insert(parse(gid), name.to_string());
                (0, String::new(), String::new())
            }
            ["id", "-u", name] => match self.users.get(*name) {
                Some((uid, _, _)) => (0, format!("{uid}\n"), String::new()),
                None => (1, String::new(), format!("id: '{name}': no such user")),
            },
            ["useradd", rest @ ..] => {
                let name = rest.last().copied().unwrap_or_default();
                if self.users.contains_key(name) {
                    return (9, String::new(), format!("user '{name}' already exists"));
                }
                let uid = parse(flag(rest, "-u"));
                let gid = parse(flag(rest, "-g"));
                self.users
                    .insert(name.to_string(), (uid, gid, flag(rest, "-d").to_string()));
                (0, String::new(), String::new())
            }
            ["adduser", rest @ ..] => {
                let name = rest.last().copied().unwrap_or_default();
                if self.users.contains_key(name) {
                    return (1, String::new(), format!("adduser: user '{name}' in use"));
                }
                let group = flag(rest, "-G");
                let Some(gid) = self
                    .groups
                    .iter()
                    .find(|(_, g)| g.as_str() == group)
                    .map(|(gid, _)| *gid)
                else {
                    return (1, String::new(), format!("adduser: unknown group {group}"));
                };
                let uid = parse(flag(rest, "-u"));
                self.users
                    .insert(name.to_string(), (uid, gid, flag(rest, "-h").to_string()));
                (0, String::new(), String::new())
            }
            ["mkdir", "-p", paths @ ..] => {
                for path in paths {
                    self.dirs.entry(path.to_string()).or_insert((0, 0, 0o755));
                }
                (0, String::new(), String::new())
            }
            ["chmod", mode, path] => match self.dirs.get_mut(*path) {
                Some(meta) => {
                    meta.2 = u32::from_str_radix(mode, 8).unwrap_or(0);
                    (0, String::new(), String::new())
                }
                None => (1, String::new(), format!("chmod: {path}: no such file")),
            },
            ["chown", "-R", owner, path] => {
                if !self.dirs.contains_key(*path) {
                    return (1, String::new(), format!("chown: {path}: no such file"));
                }
                let (uid, gid) = owner.split_once(':').unwrap_or((*owner, *owner));
                let prefix = format!("{}/", path.trim_end_matches('/'));
                for (dir, meta) in self.dirs.iter_mut() {
                    if dir == path || dir.starts_with(&prefix) {
                        meta.0 = parse(uid);
                        meta.1 = parse(gid);
                    }
                }
                (0, String::new(), String::new())
            }
            ["test", "-d", path] => exit(self.dirs.contains_key(*path), ""),
            _ => (127, String::new(), format!("{}: not found", argv[0])),
        }
    }
}

fn exit(ok: bool, stdout: &str) -> (i64, String, String) {
    if ok {
        (0, format!("{stdout}\n"), String::new())
    } else {
        (1, String::new(), String::new())
    }
}

fn parse(s: &str) -> u32 {
    s.parse().unwrap_or(u32::MAX)
}

fn flag<'a>(args: &[&'a str], name: &str) -> &'a str {
    args.iter()
        .position(|a| *a == name)
        .and_then(|i| args.get(i + 1))
        .copied()
        .unwrap_or_default()
}

/// Backend over a [`FakeOs`], producing output as a framed stream.
pub struct FakeBackend {
    pub os: Arc<Mutex<FakeOs>>,
    pub requests: Arc<Mutex<Vec<ExecRequest>>>,
    pub shutdowns: Arc<AtomicU32>,
}

impl FakeBackend {
    pub fn new(os: FakeOs) -> Self {
        Self {
            os: Arc::new(Mutex::new(os)),
            requests: Arc::default(),
            shutdowns: Arc::default(),
        }
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    async fn exec(
        &self,
        request: &ExecRequest,
        output: Option<&mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecOutput> {
        self.requests.lock().unwrap().push(request.clone());
        let (code, stdout, stderr) = self.os.lock().unwrap().run(&request.command);

        let mut wire = encode_frame(StreamKind::Stdout, stdout.as_bytes()).to_vec();
        wire.extend_from_slice(&encode_frame(StreamKind::Stderr, stderr.as_bytes()));

        let mut decoder = StreamDemultiplexer::new();
        // feed in small pieces, like a real socket would
        for piece in wire.chunks(5) {
            for chunk in decoder.push(piece)? {
                if let Some(tx) = output {
                    let _ = tx.send(chunk);
                }
            }
        }
        let (stdout, stderr) = decoder.finish()?;
        Ok(ExecOutput {
            exit_code: code,
            stdout,
            stderr,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Provider handing out [`FakeBackend`] sandboxes.
pub struct MockProvider {
    pub name: String,
    pub available: bool,
    pub fail_create: bool,
    pub tools: Option<UserTools>,
    pub launched: Mutex<Vec<LaunchSpec>>,
    pub shutdowns: Arc<AtomicU32>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: true,
            fail_create: false,
            tools: Some(UserTools::Shadow),
            launched: Mutex::new(Vec::new()),
            shutdowns: Arc::default(),
        }
    }

    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn info(&self) -> ProviderInfo {
        ProviderInfo::new(&self.name, "0.0.0-test", IsolationType::Container)
            .with_feature("framed-exec")
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<Sandbox> {
        if self.fail_create {
            return Err(CoreError::CreateFailed("mock backend refused".into()));
        }
        // let concurrent creates interleave
        tokio::task::yield_now().await;
        self.launched.lock().unwrap().push(spec.clone());

        let mut backend = FakeBackend::new(FakeOs::new(self.tools));
        backend.shutdowns = self.shutdowns.clone();
        Ok(Sandbox::new(spec, &self.name, Box::new(backend)))
    }
}
