//! SSH tunnel establishment for indirect database paths.
//!
//! The default [`SshTunneler`] shells out to the system `ssh` client with a
//! local forward (`-N -L`), because the target hosts already trust the
//! operator's ssh setup. The trait seam exists so embedders (and tests) can
//! substitute their own forwarding mechanism.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{ConnectPhase, ConnectionError};
use crate::model::TunnelSpec;

/// How long to wait for the forwarded port to start accepting.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// An established forwarding channel. `close` must run exactly once.
#[async_trait]
pub trait TunnelHandle: Send {
    /// Local port the remote database endpoint is forwarded to.
    fn local_port(&self) -> u16;

    async fn close(self: Box<Self>);
}

/// Opens forwarding channels to remote database endpoints.
#[async_trait]
pub trait Tunneler: Send + Sync {
    async fn open(
        &self,
        spec: &TunnelSpec,
        remote_host: &str,
        remote_port: u16,
        target_label: &str,
    ) -> Result<Box<dyn TunnelHandle>, ConnectionError>;
}

/// [`Tunneler`] backed by the system `ssh` client.
pub struct SshTunneler {
    ready_timeout: Duration,
}

impl SshTunneler {
    pub fn new(ready_timeout: Duration) -> Self {
        Self { ready_timeout }
    }
}

impl Default for SshTunneler {
    fn default() -> Self {
        Self::new(DEFAULT_READY_TIMEOUT)
    }
}

#[async_trait]
impl Tunneler for SshTunneler {
    async fn open(
        &self,
        spec: &TunnelSpec,
        remote_host: &str,
        remote_port: u16,
        target_label: &str,
    ) -> Result<Box<dyn TunnelHandle>, ConnectionError> {
        let tunnel_err = |message: String| ConnectionError {
            target: target_label.to_string(),
            phase: ConnectPhase::Tunnel,
            message,
        };

        let local_port = pick_local_port().map_err(|e| tunnel_err(e.to_string()))?;

        let mut command = Command::new("ssh");
        command
            .arg("-N")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-p")
            .arg(spec.port.to_string())
            .arg("-L")
            .arg(format!("{local_port}:{remote_host}:{remote_port}"))
            .arg(format!("{}@{}", spec.username, spec.host))
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        if let Some(key) = &spec.private_key_path {
            command.arg("-i").arg(key);
        }

        let mut child = command
            .spawn()
            .map_err(|e| tunnel_err(format!("failed to spawn ssh: {e}")))?;

        match wait_until_ready(&mut child, local_port, self.ready_timeout).await {
            Ok(()) => {
                debug!(
                    target = %target_label,
                    gateway = %spec.host,
                    local_port,
                    "ssh tunnel established"
                );
                Ok(Box::new(SshTunnel { child, local_port }))
            }
            Err(message) => {
                let _ = child.kill().await;
                Err(tunnel_err(message))
            }
        }
    }
}

struct SshTunnel {
    child: Child,
    local_port: u16,
}

#[async_trait]
impl TunnelHandle for SshTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn close(mut self: Box<Self>) {
        if let Err(e) = self.child.kill().await {
            warn!(local_port = self.local_port, error = %e, "failed to stop ssh tunnel");
        }
    }
}

/// Reserve a free local port by binding to port 0 and releasing it.
fn pick_local_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Poll the forwarded port until it accepts, the child exits, or the timeout
/// elapses.
async fn wait_until_ready(
    child: &mut Child,
    local_port: u16,
    timeout: Duration,
) -> Result<(), String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(format!("ssh exited before the forward came up: {status}"));
        }
        if TcpStream::connect(("127.0.0.1", local_port)).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!(
                "forwarded port {local_port} did not accept within {timeout:?}"
            ));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
