use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time::sleep;

pub mod lxd;

pub use lxd::LxdDriver;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("container or snapshot not found")]
    NotFound,
    #[error("hypervisor unreachable: {0}")]
    Unavailable(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("hypervisor protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Frozen,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub ipv4: Option<Ipv4Addr>,
}

#[derive(Clone, Debug)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The narrow seam through which the kernel talks to one container
/// hypervisor. All calls are bounded by the driver's operation timeout.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Create a new container from a template image alias.
    async fn clone_image(
        &self,
        source_alias: &str,
        new_name: &str,
        profiles: &[String],
    ) -> Result<(), DriverError>;

    async fn start(&self, name: &str) -> Result<(), DriverError>;

    async fn stop(&self, name: &str, force: bool, timeout: Duration) -> Result<(), DriverError>;

    async fn freeze(&self, name: &str) -> Result<(), DriverError>;

    async fn unfreeze(&self, name: &str) -> Result<(), DriverError>;

    async fn delete(&self, name: &str) -> Result<(), DriverError>;

    /// Current status and primary IPv4 of a container.
    async fn state(&self, name: &str) -> Result<ContainerState, DriverError>;

    /// Push a file into the container, creating parent directories if
    /// missing.
    async fn push_file(
        &self,
        name: &str,
        path: &str,
        content: &[u8],
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), DriverError>;

    /// Read a file out of the container.
    async fn pull_file(&self, name: &str, path: &str) -> Result<Vec<u8>, DriverError>;

    async fn exec(
        &self,
        name: &str,
        argv: &[&str],
        env: Option<&HashMap<String, String>>,
    ) -> Result<ExecResult, DriverError>;

    async fn snapshot_create(&self, name: &str, snap: &str) -> Result<(), DriverError>;

    async fn snapshot_restore(&self, name: &str, snap: &str) -> Result<(), DriverError>;

    async fn snapshot_delete(&self, name: &str, snap: &str) -> Result<(), DriverError>;

    async fn snapshots_list(&self, name: &str) -> Result<Vec<String>, DriverError>;

    /// Poll for the container's IPv4, up to `attempts` times with `delay`
    /// between attempts. Returns `None` when the address never appeared.
    async fn wait_ipv4(
        &self,
        name: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<Option<Ipv4Addr>, DriverError> {
        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(delay).await;
            }

            if let Some(ip) = self.state(name).await?.ipv4 {
                return Ok(Some(ip));
            }
        }

        Ok(None)
    }
}
