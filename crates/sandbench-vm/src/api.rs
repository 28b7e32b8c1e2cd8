//! Calls to the Firecracker API socket for endpoints firepilot does not
//! wrap. Pre-boot endpoints only: Firecracker rejects them once the guest
//! has started.

use crate::error::{Result, VmError};
use firepilot_models::models::MachineConfiguration;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use serde::Serialize;
use std::path::Path;

async fn put_json<T: Serialize>(socket: &Path, endpoint: &str, payload: &T) -> Result<()> {
    let body = serde_json::to_vec(payload)
        .map_err(|e| VmError::InvalidConfig(format!("{endpoint}: {e}")))?;
    tracing::trace!(endpoint, body = %String::from_utf8_lossy(&body), "PUT");

    let request = Request::builder()
        .method(Method::PUT)
        .uri(hyper::Uri::from(Uri::new(socket, endpoint)))
        .header("Content-Type", "application/json")
        .header("Accept", "application/json")
        .body(Body::from(body))
        .map_err(|e| VmError::Transport(e.to_string()))?;

    let response = Client::unix()
        .request(request)
        .await
        .map_err(|e| VmError::Transport(format!("{}: {e}", socket.display())))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    Err(VmError::Api {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Size the guest. Must happen before `InstanceStart`.
pub(crate) async fn set_machine_config(socket: &Path, vcpus: u8, memory_mib: u32) -> Result<()> {
    let memory = i32::try_from(memory_mib)
        .map_err(|_| VmError::InvalidConfig(format!("memory_mib too large: {memory_mib}")))?;
    let config = MachineConfiguration::new(memory, i32::from(vcpus));
    put_json(socket, "/machine-config", &config).await?;
    tracing::debug!(vcpus, memory_mib, "Machine sized");
    Ok(())
}
