//! Non-root user setup inside a running sandbox.
//!
//! Some backends refuse to run agent tooling as root, so a sandbox can get
//! a regular user installed after boot. Every step is an argument vector
//! run as root; nothing user-supplied is ever spliced into shell text.

use crate::config::SandboxUser;
use crate::error::{CoreError, Result};
use crate::exec::{ExecRequest, ExecResult};
use crate::sandbox::Sandbox;
use std::time::Instant;

/// Which user-management tools the guest ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTools {
    /// shadow-utils: `groupadd`, `useradd`
    Shadow,
    /// busybox: `addgroup`, `adduser`
    Busybox,
}

/// Install `user` in `sandbox` and make it the default identity.
///
/// Safe to run repeatedly: existing groups and users are left alone and
/// the directory steps converge on the same state.
///
/// # Errors
/// [`CoreError::UserSetupFailed`] naming the failing step. The sandbox
/// keeps running commands as root in that case.
pub async fn setup_user(sandbox: &Sandbox, user: &SandboxUser) -> Result<()> {
    user.validate()
        .map_err(|e| CoreError::UserSetupFailed(e.to_string()))?;

    let start = Instant::now();
    tracing::info!(
        sandbox_id = %sandbox.id(),
        user = %user.name,
        uid = user.uid,
        gid = user.gid,
        "Setting up sandbox user"
    );

    let tools = detect_tools(sandbox).await?;
    tracing::debug!(sandbox_id = %sandbox.id(), ?tools, "Detected user tools");

    let uid = user.uid.to_string();
    let gid = user.gid.to_string();
    let owner = format!("{}:{}", user.uid, user.gid);
    let config_dir = format!("{}/.config", user.home.trim_end_matches('/'));

    // group
    let existing = root(sandbox, &["getent", "group", &gid]).await?;
    let group_name = if existing.success() {
        existing
            .stdout
            .split(':')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(user.group_name())
            .to_string()
    } else {
        match tools {
            UserTools::Shadow => {
                step(sandbox, "groupadd", &["groupadd", "-o", "-g", &gid, user.group_name()]).await?
            }
            UserTools::Busybox => {
                step(sandbox, "addgroup", &["addgroup", "-g", &gid, user.group_name()]).await?
            }
        }
        user.group_name().to_string()
    };

    // user
    if !root(sandbox, &["id", "-u", &user.name]).await?.success() {
        match tools {
            UserTools::Shadow => {
                step(
                    sandbox,
                    "useradd",
                    &[
                        "useradd", "-o", "-u", &uid, "-g", &gid, "-d", &user.home, "-M", "-s",
                        "/bin/sh", &user.name,
                    ],
                )
                .await?
            }
            UserTools::Busybox => {
                step(
                    sandbox,
                    "adduser",
                    &[
                        "adduser", "-D", "-H", "-u", &uid, "-G", &group_name, "-h", &user.home,
                        "-s", "/bin/sh", &user.name,
                    ],
                )
                .await?
            }
        }
    }

    step(sandbox, "mkdir", &["mkdir", "-p", &user.home, &config_dir]).await?;
    step(sandbox, "chmod", &["chmod", "700", &config_dir]).await?;
    step(sandbox, "chown home", &["chown", "-R", &owner, &user.home]).await?;

    let workspace = sandbox.mount_target();
    if root(sandbox, &["test", "-d", workspace]).await?.success() {
        step(sandbox, "chown workspace", &["chown", "-R", &owner, workspace]).await?;
    }

    sandbox.install_user(user.clone()).await;
    tracing::info!(
        sandbox_id = %sandbox.id(),
        user = %user.name,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Sandbox user ready"
    );
    Ok(())
}

/// Find out which family of user tools the guest has.
pub async fn detect_tools(sandbox: &Sandbox) -> Result<UserTools> {
    if root(sandbox, &["sh", "-c", "command -v useradd"]).await?.success() {
        return Ok(UserTools::Shadow);
    }
    if root(sandbox, &["sh", "-c", "command -v adduser"]).await?.success() {
        return Ok(UserTools::Busybox);
    }
    Err(CoreError::UserSetupFailed(
        "neither useradd nor adduser found in sandbox".into(),
    ))
}

async fn root(sandbox: &Sandbox, argv: &[&str]) -> Result<ExecResult> {
    let mut request = ExecRequest::new(argv[0]).args(argv[1..].iter().copied()).as_root();
    request.workdir = Some("/".into());
    sandbox.exec(request).await
}

/// Run a step that must exit 0.
async fn step(sandbox: &Sandbox, name: &str, argv: &[&str]) -> Result<()> {
    let result = root(sandbox, argv).await?;
    if result.success() {
        return Ok(());
    }
    tracing::warn!(
        sandbox_id = %sandbox.id(),
        step = name,
        exit_code = result.exit_code,
        stderr = %result.stderr.trim(),
        "User setup step failed"
    );
    Err(CoreError::UserSetupFailed(format!(
        "{name} exited with {}: {}",
        result.exit_code,
        result.stderr.trim()
    )))
}
