//! Command requests and results.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Exit code reported when a command never produced one.
pub const SYNTHETIC_EXIT_CODE: i64 = -1;

/// Who a command runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    /// The sandbox's installed user if there is one, root otherwise.
    #[default]
    Default,
    Root,
    User { uid: u32, gid: u32 },
}

/// One command, as an argument vector.
///
/// Arguments are never joined into shell text by the core. SSH backends
/// quote every token with [`shell_quote`].
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub identity: Identity,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl ExecRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            command: vec![program.into()],
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.command.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn as_root(mut self) -> Self {
        self.identity = Identity::Root;
        self
    }

    pub fn as_user(mut self, uid: u32, gid: u32) -> Self {
        self.identity = Identity::User { uid, gid };
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The program, i.e. the first argument.
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }
}

/// Raw output collected by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: f64,
}

impl ExecResult {
    pub fn from_output(output: ExecOutput, elapsed: Duration) -> Self {
        Self {
            exit_code: output.exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }

    /// A result for a command that could not run, carrying the reason in stderr.
    pub fn failed(message: impl Into<String>, started: Instant) -> Self {
        Self {
            exit_code: SYNTHETIC_EXIT_CODE,
            stdout: String::new(),
            stderr: message.into(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Race `fut` against an optional timeout and an optional cancellation token.
///
/// Losing the race drops `fut`, which aborts whatever it was awaiting.
pub async fn run_bounded<T, F>(
    fut: F,
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let expired = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = fut => result,
        _ = cancelled => Err(CoreError::ExecTransportFailed("cancelled".into())),
        _ = expired => Err(CoreError::ExecTransportFailed(format!(
            "timed out after {} ms",
            timeout.map(|t| t.as_millis()).unwrap_or_default()
        ))),
    }
}

/// Quote one token for a POSIX shell.
pub fn shell_quote(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '@' | '+'))
    {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', r"'\''"))
}

/// Render a resolved request as one remote shell line.
///
/// `cd DIR && exec [setpriv ...] env K=V... PROGRAM ARGS...`, every token
/// quoted. Used by backends that can only hand a string to a remote shell.
pub fn remote_command_line(request: &ExecRequest) -> String {
    let mut words: Vec<String> = Vec::new();

    if let Identity::User { uid, gid } = request.identity {
        words.push("setpriv".into());
        words.push(format!("--reuid={uid}"));
        words.push(format!("--regid={gid}"));
        words.push("--clear-groups".into());
    }
    if !request.env.is_empty() {
        words.push("env".into());
        for (key, value) in &request.env {
            words.push(shell_quote(&format!("{key}={value}")));
        }
    }
    words.extend(request.command.iter().map(|w| shell_quote(w)));

    let line = format!("exec {}", words.join(" "));
    match &request.workdir {
        Some(dir) => format!("cd {} && {}", shell_quote(dir), line),
        None => line,
    }
}
