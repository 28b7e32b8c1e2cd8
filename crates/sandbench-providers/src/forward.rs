//! Local TCP port forwarder into a guest.
//!
//! Firecracker guests sit on a private TAP subnet, so each sandbox gets a
//! listener on `127.0.0.1:{ssh_port}` relaying to `{guest_ip}:22`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause after a failed accept, so a persistent error such as fd
/// exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Background accept loop relaying every connection to one target.
pub struct PortForwarder {
    local_addr: SocketAddr,
    target: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PortForwarder {
    /// Bind `listen` and start relaying to `target`.
    pub async fn start(listen: SocketAddr, target: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        tracing::debug!(listen = %local_addr, target = %target, "Port forwarder started");
        let task = tokio::spawn(accept_loop(listener, target, cancel.clone()));

        Ok(Self {
            local_addr,
            target,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Close the listener and every open relay. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Port forwarder task ended abnormally");
            }
            tracing::debug!(listen = %self.local_addr, "Port forwarder stopped");
        }
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, target: SocketAddr, cancel: CancellationToken) {
    let listener = &listener;
    serve(move || listener.accept(), target, cancel).await;
}

async fn serve<A, F>(mut accept: A, target: SocketAddr, cancel: CancellationToken)
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = accept() => accepted,
        };
        match accepted {
            Ok((inbound, peer)) => {
                tracing::trace!(peer = %peer, target = %target, "Forwarding connection");
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        relayed = relay(inbound, target) => {
                            if let Err(e) = relayed {
                                tracing::debug!(peer = %peer, error = %e, "Forwarded connection ended");
                            }
                        }
                    }
                });
            }
            Err(e) => {
                tracing::debug!(error = %e, "Forwarder accept failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
}

async fn relay(mut inbound: TcpStream, target: SocketAddr) -> io::Result<()> {
    let mut outbound = TcpStream::connect(target).await?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    tracing::trace!(target = %target, sent, received, "Forwarded connection closed");
    Ok(())
}
