#[macro_use]
extern crate async_trait;

use std::error::Error as StdError;
use std::fmt::Formatter;
use std::io;

use axum::response::{IntoResponse, Response};
use skyblock_common::models::error::ApiError;

pub use skyblock_common::models::error::ErrorKind;

pub mod admission;
pub mod api;
pub mod args;
pub mod bus;
pub mod dal;
pub mod driver;
pub mod reconcile;
pub mod service;
pub mod updater;

/// Server-side errors the kernel surfaces to callers.
///
/// All [`Error`]s have an [`ErrorKind`] and an (optional) source. They are
/// safe to use as axum return types: the [`IntoResponse`] implementation
/// only exposes the kind's short message.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl Error {
    pub fn source<E: StdError + Sync + Send + 'static>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            source: Some(Box::new(err)),
        }
    }

    pub fn custom<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(io::Error::new(
                io::ErrorKind::Other,
                message.as_ref().to_string(),
            ))),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

impl From<dal::DalError> for Error {
    fn from(err: dal::DalError) -> Self {
        match err {
            dal::DalError::IslandNotFound => Self::from_kind(ErrorKind::IslandNotFound),
            dal::DalError::TeamNotFound => Self::from_kind(ErrorKind::TeamNotFound),
            dal::DalError::AlreadyQueued => Self::from_kind(ErrorKind::AlreadyExists),
            dal::DalError::Sqlx(_) => Self::source(ErrorKind::Internal, err),
        }
    }
}

impl From<driver::DriverError> for Error {
    fn from(err: driver::DriverError) -> Self {
        match err {
            driver::DriverError::NotFound => Self::from_kind(ErrorKind::IslandNotFound),
            driver::DriverError::Timeout(_) => Self::source(ErrorKind::DriverTimeout, err),
            driver::DriverError::Unavailable(_) | driver::DriverError::Protocol(_) => {
                Self::source(ErrorKind::DriverUnavailable, err)
            }
        }
    }
}

impl From<bus::BusError> for Error {
    fn from(err: bus::BusError) -> Self {
        Self::source(ErrorKind::Internal, err)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let error: ApiError = self.kind.into();

        if error.status_code >= 500 {
            tracing::error!(
                error = &self as &dyn std::error::Error,
                "control plane request error"
            );
        }

        error.into_response()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, ": ")?;
            source.fmt(f)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
pub mod tests {
    use std::collections::{HashMap, HashSet};
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use futures::stream::BoxStream;
    use futures::StreamExt;
    use skyblock_common::models::event::{Envelope, Event};
    use skyblock_common::models::island::IslandStatus;
    use tokio::sync::{broadcast, Mutex};
    use tokio::time::sleep;
    use uuid::Uuid;

    use crate::args::UpdateStrategy;
    use crate::bus::{BusError, EventBus};
    use crate::dal::Sqlite;
    use crate::driver::{
        ContainerState, ContainerStatus, DriverError, ExecResult, HypervisorDriver,
    };
    use crate::service::{FleetSettings, IslandService};

    #[derive(Clone, Debug)]
    pub struct MockContainer {
        pub status: ContainerStatus,
        pub ipv4: Option<Ipv4Addr>,
        pub files: HashMap<String, Vec<u8>>,
        pub snapshots: Vec<String>,
    }

    impl MockContainer {
        fn stopped() -> Self {
            Self {
                status: ContainerStatus::Stopped,
                ipv4: None,
                files: HashMap::new(),
                snapshots: Vec::new(),
            }
        }
    }

    /// In-memory stand-in for the hypervisor: containers are hash-map
    /// entries, and any operation can be told to fail by name.
    #[derive(Default)]
    pub struct MockDriver {
        containers: Mutex<HashMap<String, MockContainer>>,
        fail_ops: Mutex<HashSet<&'static str>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockDriver {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub async fn fail_on(&self, op: &'static str) {
            self.fail_ops.lock().await.insert(op);
        }

        pub async fn heal(&self, op: &'static str) {
            self.fail_ops.lock().await.remove(op);
        }

        pub async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }

        pub async fn called(&self, op: &str) -> bool {
            self.calls
                .lock()
                .await
                .iter()
                .any(|call| call.starts_with(op))
        }

        pub async fn insert_container(
            &self,
            name: &str,
            status: ContainerStatus,
            ipv4: Option<Ipv4Addr>,
        ) {
            let mut containers = self.containers.lock().await;
            containers.insert(
                name.to_string(),
                MockContainer {
                    status,
                    ipv4,
                    files: HashMap::new(),
                    snapshots: Vec::new(),
                },
            );
        }

        pub async fn remove_container(&self, name: &str) {
            self.containers.lock().await.remove(name);
        }

        pub async fn container(&self, name: &str) -> Option<MockContainer> {
            self.containers.lock().await.get(name).cloned()
        }

        async fn check(&self, op: &'static str, name: &str) -> Result<(), DriverError> {
            self.calls.lock().await.push(format!("{op} {name}"));
            if self.fail_ops.lock().await.contains(op) {
                return Err(DriverError::Protocol(format!("{op} failed by request")));
            }
            Ok(())
        }

        fn address_for(name: &str) -> Ipv4Addr {
            let octet = name.bytes().fold(7u8, |acc, b| acc.wrapping_add(b)) | 1;
            Ipv4Addr::new(10, 99, 0, octet)
        }
    }

    #[async_trait]
    impl HypervisorDriver for MockDriver {
        async fn clone_image(
            &self,
            _source_alias: &str,
            new_name: &str,
            _profiles: &[String],
        ) -> Result<(), DriverError> {
            self.check("clone_image", new_name).await?;
            self.containers
                .lock()
                .await
                .entry(new_name.to_string())
                .or_insert_with(MockContainer::stopped);
            Ok(())
        }

        async fn start(&self, name: &str) -> Result<(), DriverError> {
            self.check("start", name).await?;
            let mut containers = self.containers.lock().await;
            let container = containers.get_mut(name).ok_or(DriverError::NotFound)?;
            container.status = ContainerStatus::Running;
            container.ipv4 = Some(Self::address_for(name));
            Ok(())
        }

        async fn stop(
            &self,
            name: &str,
            _force: bool,
            _timeout: Duration,
        ) -> Result<(), DriverError> {
            self.check("stop", name).await?;
            let mut containers = self.containers.lock().await;
            let container = containers.get_mut(name).ok_or(DriverError::NotFound)?;
            container.status = ContainerStatus::Stopped;
            container.ipv4 = None;
            Ok(())
        }

        async fn freeze(&self, name: &str) -> Result<(), DriverError> {
            self.check("freeze", name).await?;
            let mut containers = self.containers.lock().await;
            let container = containers.get_mut(name).ok_or(DriverError::NotFound)?;
            container.status = ContainerStatus::Frozen;
            Ok(())
        }

        async fn unfreeze(&self, name: &str) -> Result<(), DriverError> {
            self.check("unfreeze", name).await?;
            let mut containers = self.containers.lock().await;
            let container = containers.get_mut(name).ok_or(DriverError::NotFound)?;
            container.status = ContainerStatus::Running;
            if container.ipv4.is_none() {
                container.ipv4 = Some(Self::address_for(name));
            }
            Ok(())
        }

        async fn delete(&self, name: &str) -> Result<(), DriverError> {
            self.check("delete", name).await?;
            self.containers
                .lock()
                .await
                .remove(name)
                .map(|_| ())
                .ok_or(DriverError::NotFound)
        }

        async fn state(&self, name: &str) -> Result<ContainerState, DriverError> {
            self.check("state", name).await?;
            let containers = self.containers.lock().await;
            let container = containers.get(name).ok_or(DriverError::NotFound)?;
            Ok(ContainerState {
                status: container.status,
                ipv4: container.ipv4,
            })
        }

        async fn push_file(
            &self,
            name: &str,
            path: &str,
            content: &[u8],
            _mode: Option<u32>,
            _uid: Option<u32>,
            _gid: Option<u32>,
        ) -> Result<(), DriverError> {
            self.check("push_file", name).await?;
            let mut containers = self.containers.lock().await;
            let container = containers.get_mut(name).ok_or(DriverError::NotFound)?;
            container.files.insert(path.to_string(), content.to_vec());
            Ok(())
        }

        async fn pull_file(&self, name: &str, path: &str) -> Result<Vec<u8>, DriverError> {
            self.check("pull_file", name).await?;
            let containers = self.containers.lock().await;
            let container = containers.get(name).ok_or(DriverError::NotFound)?;
            Ok(container
                .files
                .get(path)
                .cloned()
                .unwrap_or_else(|| b"archive".to_vec()))
        }

        async fn exec(
            &self,
            name: &str,
            argv: &[&str],
            _env: Option<&HashMap<String, String>>,
        ) -> Result<ExecResult, DriverError> {
            self.check("exec", name).await?;
            let mut containers = self.containers.lock().await;
            let container = containers.get_mut(name).ok_or(DriverError::NotFound)?;
            // `tar -czf <path> ...` leaves an archive behind for pull_file.
            if argv.first() == Some(&"tar") && argv.get(1) == Some(&"-czf") {
                if let Some(path) = argv.get(2) {
                    container
                        .files
                        .insert(path.to_string(), b"world-archive".to_vec());
                }
            }
            Ok(ExecResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        async fn snapshot_create(&self, name: &str, snap: &str) -> Result<(), DriverError> {
            self.check("snapshot_create", name).await?;
            let mut containers = self.containers.lock().await;
            let container = containers.get_mut(name).ok_or(DriverError::NotFound)?;
            container.snapshots.push(snap.to_string());
            Ok(())
        }

        async fn snapshot_restore(&self, name: &str, snap: &str) -> Result<(), DriverError> {
            self.check("snapshot_restore", name).await?;
            let containers = self.containers.lock().await;
            let container = containers.get(name).ok_or(DriverError::NotFound)?;
            if !container.snapshots.iter().any(|existing| existing == snap) {
                return Err(DriverError::NotFound);
            }
            Ok(())
        }

        async fn snapshot_delete(&self, name: &str, snap: &str) -> Result<(), DriverError> {
            self.check("snapshot_delete", name).await?;
            let mut containers = self.containers.lock().await;
            let container = containers.get_mut(name).ok_or(DriverError::NotFound)?;
            container.snapshots.retain(|existing| existing != snap);
            Ok(())
        }

        async fn snapshots_list(&self, name: &str) -> Result<Vec<String>, DriverError> {
            self.check("snapshots_list", name).await?;
            let containers = self.containers.lock().await;
            let container = containers.get(name).ok_or(DriverError::NotFound)?;
            Ok(container.snapshots.clone())
        }
    }

    /// Single-process bus over a broadcast channel, plus a key store for
    /// the leader-election tests.
    pub struct MemoryBus {
        tx: broadcast::Sender<Envelope>,
        keys: Mutex<HashMap<String, Instant>>,
    }

    impl MemoryBus {
        pub fn new() -> Arc<Self> {
            let (tx, _) = broadcast::channel(256);
            Arc::new(Self {
                tx,
                keys: Mutex::new(HashMap::new()),
            })
        }

        pub fn receiver(&self) -> broadcast::Receiver<Envelope> {
            self.tx.subscribe()
        }
    }

    #[async_trait]
    impl EventBus for MemoryBus {
        async fn publish(&self, recipient_ids: &[String], event: &Event) -> Result<(), BusError> {
            let _ = self.tx.send(Envelope {
                recipient_ids: recipient_ids.to_vec(),
                event: event.clone(),
            });
            Ok(())
        }

        async fn subscribe(&self) -> Result<BoxStream<'static, Envelope>, BusError> {
            let rx = self.tx.subscribe();
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(envelope) => return Some((envelope, rx)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            })
            .boxed();

            Ok(stream)
        }

        async fn set_if_not_exists(
            &self,
            key: &str,
            _value: &str,
            ttl: Duration,
        ) -> Result<bool, BusError> {
            let mut keys = self.keys.lock().await;
            let now = Instant::now();
            keys.retain(|_, expires| *expires > now);

            if keys.contains_key(key) {
                return Ok(false);
            }
            keys.insert(key.to_string(), now + ttl);
            Ok(true)
        }
    }

    /// Everything a kernel test needs: in-memory repository, mock driver,
    /// broadcast bus, and a service wired through them.
    pub struct World {
        pub dal: Sqlite,
        pub driver: Arc<MockDriver>,
        pub bus: Arc<MemoryBus>,
        pub service: IslandService<Sqlite>,
    }

    impl World {
        pub async fn new() -> Self {
            Self::with_cap(10).await
        }

        pub async fn with_cap(cap: u32) -> Self {
            Self::with(cap, UpdateStrategy::Files).await
        }

        pub async fn with(cap: u32, strategy: UpdateStrategy) -> Self {
            let dal = Sqlite::new_in_memory().await.unwrap();
            let driver = MockDriver::new();
            let bus = MemoryBus::new();

            let update_file = std::env::temp_dir().join("skyblock-test-update.bin");
            std::fs::write(&update_file, b"updated-mod-contents").unwrap();

            let settings = FleetSettings {
                base_image: "skyblock-template".to_string(),
                new_base_image: "skyblock-template-new".to_string(),
                profiles: vec!["default".to_string(), "skyblock".to_string()],
                operation_timeout: Duration::from_secs(5),
                ip_retry_attempts: 3,
                ip_retry_delay: Duration::ZERO,
                max_running_servers: cap,
                default_mc_port: 25565,
                update_strategy: strategy,
                update_file_source: PathBuf::from(update_file),
                update_file_target: "/opt/minecraft/mods/some_mod.jar".to_string(),
                update_max_retries: 3,
                update_poll_interval: Duration::from_secs(1),
            };

            let service = IslandService::new(
                dal.clone(),
                driver.clone() as Arc<dyn HypervisorDriver>,
                bus.clone() as Arc<dyn EventBus>,
                settings,
            );

            Self {
                dal,
                driver,
                bus,
                service,
            }
        }

        /// Wait for a background task to move the island into `status`.
        pub async fn wait_for_status(&self, island_id: i64, status: IslandStatus) {
            use crate::dal::Dal;

            for _ in 0..500 {
                if let Some(island) = self.dal.island(island_id).await.unwrap() {
                    if island.status == status {
                        return;
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }

            panic!("timed out waiting for status {status}");
        }

        /// Wait for the island row to disappear.
        pub async fn wait_for_removal(&self, island_id: i64) {
            use crate::dal::Dal;

            for _ in 0..500 {
                if self.dal.island(island_id).await.unwrap().is_none() {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }

            panic!("timed out waiting for island {island_id} removal");
        }

        pub fn player() -> Uuid {
            Uuid::new_v4()
        }
    }

    #[tokio::test]
    async fn leader_election_is_first_writer_wins() {
        let bus = MemoryBus::new();

        assert!(bus
            .set_if_not_exists("startup_lock", "1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!bus
            .set_if_not_exists("startup_lock", "1", Duration::from_secs(60))
            .await
            .unwrap());

        // An expired lock is free again.
        assert!(bus
            .set_if_not_exists("other_lock", "1", Duration::from_millis(1))
            .await
            .unwrap());
        sleep(Duration::from_millis(10)).await;
        assert!(bus
            .set_if_not_exists("other_lock", "1", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
