use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use skyblock_common::constants::ISLAND_DATA_DIR;
use skyblock_common::models::event::Event;
use skyblock_common::models::island::{Island, IslandStatus, UpdateQueueEntry};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::args::UpdateStrategy;
use crate::dal::{Dal, StatusPatch};
use crate::driver::ContainerStatus;
use crate::service::IslandService;
use crate::{Error, ErrorKind};

/// How long a restarted island gets to call MarkReady before the update is
/// treated as failed.
const READY_WAIT: Duration = Duration::from_secs(180);

/// Grace period between the shutdown notice and the forced stop of a
/// running island.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// In-container staging path for world archives.
const CONTAINER_ARCHIVE: &str = "/tmp/skyblock-world.tar.gz";

/// Single consumer of the update queue. Woken by the kernel whenever a new
/// entry lands, with a periodic rescan as a missed-signal backstop. Exactly
/// one instance may run per fleet.
pub struct UpdateWorker<D: Dal> {
    service: IslandService<D>,
    signal: Arc<Notify>,
}

impl<D: Dal> UpdateWorker<D> {
    pub fn new(service: IslandService<D>) -> Self {
        let signal = service.update_signal();
        Self { service, signal }
    }

    pub async fn start(self) {
        info!("update worker started");

        loop {
            tokio::select! {
                _ = self.signal.notified() => {}
                _ = sleep(self.service.settings().update_poll_interval) => {}
            }

            self.drain().await;
        }
    }

    /// Process queue entries one island at a time until the queue is empty.
    pub async fn drain(&self) {
        loop {
            let entry = match self.service.dal().next_pending_update().await {
                Ok(Some(entry)) => entry,
                Ok(None) => return,
                Err(error) => {
                    error!(%error, "could not read the update queue");
                    return;
                }
            };

            self.process(entry).await;
        }
    }

    async fn process(&self, entry: UpdateQueueEntry) {
        let dal = self.service.dal();

        if let Err(error) = dal.update_entry_processing(entry.id).await {
            error!(%error, entry_id = entry.id, "could not claim update entry");
            return;
        }

        let island = match dal.island(entry.island_id).await {
            Ok(Some(island)) => island,
            Ok(None) => {
                let _ = dal
                    .update_entry_failed(entry.id, "island no longer exists", entry.retry_count + 1)
                    .await;
                return;
            }
            Err(error) => {
                error!(%error, island_id = entry.island_id, "could not load island for update");
                return;
            }
        };

        info!(island_id = island.id, was_running = entry.was_running, "starting island update");

        if let Ok(Some(updated)) = dal
            .update_status(island.id, IslandStatus::Updating, StatusPatch::default())
            .await
        {
            self.service.publish_island(&updated).await;
        }

        if entry.was_running {
            let recipients = self.service.recipients(&island).await;
            if let Err(error) = self
                .service
                .bus()
                .publish(
                    &recipients,
                    &Event::GracefulShutdownForUpdate {
                        island_id: island.id,
                    },
                )
                .await
            {
                warn!(%error, island_id = island.id, "could not announce shutdown");
            }
            sleep(SHUTDOWN_GRACE).await;
        }

        let result = match self.service.settings().update_strategy {
            UpdateStrategy::Files => self.files_update(&island, entry.was_running).await,
            UpdateStrategy::Image => self.image_update(&island, entry.was_running).await,
        };

        match result {
            Ok(()) => {
                info!(island_id = island.id, "island update completed");
                if let Err(error) = dal.update_entry_completed(entry.id).await {
                    error!(%error, entry_id = entry.id, "could not complete update entry");
                }
            }
            Err(error) => {
                error!(%error, island_id = island.id, "island update failed");
                let retries = entry.retry_count + 1;
                if let Err(error) = dal
                    .update_entry_failed(entry.id, &error.to_string(), retries)
                    .await
                {
                    error!(%error, entry_id = entry.id, "could not fail update entry");
                }
                if retries >= self.service.settings().update_max_retries {
                    error!(
                        island_id = island.id,
                        retries, "update retry budget exhausted, manual re-queue required"
                    );
                }
            }
        }
    }

    /// Snapshot, swap the update file in, verify, and roll back to the
    /// snapshot when anything goes wrong.
    async fn files_update(&self, island: &Island, was_running: bool) -> Result<(), Error> {
        let driver = self.service.driver();
        let name = island.container_name.as_str();
        let snapshot = format!(
            "update-snapshot-{}-{}",
            island.id,
            Utc::now().format("%Y%m%d%H%M%S")
        );

        if let Err(err) = driver.snapshot_create(name, &snapshot).await {
            self.finish_with(island, IslandStatus::UpdateFailed).await;
            return Err(err.into());
        }

        let applied: Result<(), Error> = async {
            if was_running {
                self.synchronous_stop(island).await?;
            }

            let settings = self.service.settings();
            let content = tokio::fs::read(&settings.update_file_source)
                .await
                .map_err(|err| Error::source(ErrorKind::Internal, err))?;
            driver
                .push_file(name, &settings.update_file_target, &content, None, None, None)
                .await?;

            if was_running {
                self.start_and_wait_ready(island).await?;
            }

            Ok(())
        }
        .await;

        match applied {
            Ok(()) => {
                if let Err(err) = driver.snapshot_delete(name, &snapshot).await {
                    warn!(error = %err, island_id = island.id, "could not delete update snapshot");
                }

                // The ready wait already wrote RUNNING for restarted
                // islands.
                if !was_running {
                    self.finish_with(island, IslandStatus::Stopped).await;
                }

                Ok(())
            }
            Err(err) => {
                warn!(island_id = island.id, snapshot = %snapshot, "rolling back island update");

                match driver.snapshot_restore(name, &snapshot).await {
                    Ok(()) => {
                        if was_running {
                            if let Err(restart_err) = self.start_and_wait_ready(island).await {
                                warn!(error = %restart_err, island_id = island.id, "island did not come back after rollback");
                            }
                        }
                        self.finish_with(island, IslandStatus::UpdateFailed).await;
                    }
                    Err(restore_err) => {
                        error!(
                            error = %restore_err,
                            island_id = island.id,
                            "rollback failed, operator action required"
                        );
                        self.finish_with(island, IslandStatus::Error).await;
                    }
                }

                if let Err(cleanup_err) = driver.snapshot_delete(name, &snapshot).await {
                    warn!(error = %cleanup_err, island_id = island.id, "could not delete update snapshot");
                }

                Err(err)
            }
        }
    }

    /// Rebuild the container from the new base image, carrying the world
    /// data over through a host-side archive. The archive outlives any
    /// failure past the point of no return.
    async fn image_update(&self, island: &Island, was_running: bool) -> Result<(), Error> {
        let old_name = island.container_name.clone();

        if was_running {
            self.synchronous_stop(island).await?;
        }

        let archive = match self.archive_world(&old_name).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.finish_with(island, IslandStatus::UpdateFailed).await;
                return Err(err);
            }
        };

        let host_archive = std::env::temp_dir().join(format!(
            "skyblock-backup-{}-{}.tar.gz",
            island.id,
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        if let Err(err) = tokio::fs::write(&host_archive, &archive).await {
            self.finish_with(island, IslandStatus::UpdateFailed).await;
            return Err(Error::source(ErrorKind::Internal, err));
        }

        match self.rebuild(island, &old_name, &archive, was_running).await {
            Ok(()) => {
                if let Err(err) = tokio::fs::remove_file(&host_archive).await {
                    warn!(error = %err, "could not remove host archive");
                }
                Ok(())
            }
            Err(err) => {
                error!(
                    island_id = island.id,
                    archive = %host_archive.display(),
                    "island rebuild failed, world archive preserved"
                );
                self.finish_with(island, IslandStatus::Error).await;
                Err(Error::custom(
                    err.kind(),
                    format!(
                        "rebuild failed ({err}), world data archived at {}",
                        host_archive.display()
                    ),
                ))
            }
        }
    }

    async fn archive_world(&self, name: &str) -> Result<Vec<u8>, Error> {
        let driver = self.service.driver();

        let tar = driver
            .exec(
                name,
                &["tar", "-czf", CONTAINER_ARCHIVE, "-C", ISLAND_DATA_DIR, "."],
                None,
            )
            .await?;
        if !tar.success() {
            return Err(Error::custom(
                ErrorKind::Internal,
                format!("world archive failed: {}", tar.stderr),
            ));
        }

        let bytes = driver.pull_file(name, CONTAINER_ARCHIVE).await?;

        if let Err(err) = driver.exec(name, &["rm", CONTAINER_ARCHIVE], None).await {
            warn!(error = %err, container = name, "could not remove staging archive");
        }

        Ok(bytes)
    }

    async fn rebuild(
        &self,
        island: &Island,
        old_name: &str,
        archive: &[u8],
        was_running: bool,
    ) -> Result<(), Error> {
        let dal = self.service.dal();
        let driver = self.service.driver();
        let settings = self.service.settings();

        match driver.delete(old_name).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        // Same name stem, fresh suffix.
        let new_name = match old_name.rsplit_once('-') {
            Some((stem, _)) => format!("{stem}-{:08x}", rand::thread_rng().gen::<u32>()),
            None => format!("{old_name}-{:08x}", rand::thread_rng().gen::<u32>()),
        };

        dal.rename_container(island.id, &new_name).await?;
        let island = dal
            .island(island.id)
            .await?
            .ok_or(ErrorKind::IslandNotFound)?;

        driver
            .clone_image(&settings.new_base_image, &new_name, &settings.profiles)
            .await?;

        driver
            .push_file(&new_name, CONTAINER_ARCHIVE, archive, None, None, None)
            .await?;
        let untar = driver
            .exec(
                &new_name,
                &["tar", "-xzf", CONTAINER_ARCHIVE, "-C", ISLAND_DATA_DIR],
                None,
            )
            .await?;
        if !untar.success() {
            return Err(Error::custom(
                ErrorKind::Internal,
                format!("world restore failed: {}", untar.stderr),
            ));
        }
        if let Err(err) = driver.exec(&new_name, &["rm", CONTAINER_ARCHIVE], None).await {
            warn!(error = %err, container = %new_name, "could not remove staging archive");
        }

        let island_data = self.service.island_data_toml(&island).await?;
        driver
            .push_file(
                &new_name,
                skyblock_common::constants::ISLAND_DATA_PATH,
                island_data.as_bytes(),
                None,
                None,
                None,
            )
            .await?;

        if was_running {
            self.start_and_wait_ready(&island).await?;
        } else {
            self.finish_with(&island, IslandStatus::Stopped).await;
        }

        Ok(())
    }

    /// Stop the container and persist STOPPED, used inside the worker's
    /// owned interval.
    async fn synchronous_stop(&self, island: &Island) -> Result<(), Error> {
        let driver = self.service.driver();
        let name = island.container_name.as_str();

        match driver.state(name).await {
            Ok(state) if state.status != ContainerStatus::Stopped => {
                driver
                    .stop(name, true, self.service.settings().operation_timeout)
                    .await?;
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        self.finish_with(island, IslandStatus::Stopped).await;

        Ok(())
    }

    /// Start the container and wait for the in-container server to call
    /// MarkReady, polling the repository once per second.
    async fn start_and_wait_ready(&self, island: &Island) -> Result<(), Error> {
        let dal = self.service.dal();
        let driver = self.service.driver();
        let settings = self.service.settings();
        let name = island.container_name.as_str();

        driver.start(name).await?;
        let ip = driver
            .wait_ipv4(name, settings.ip_retry_attempts, settings.ip_retry_delay)
            .await?
            .ok_or_else(|| {
                Error::custom(ErrorKind::DriverUnavailable, "container never got an address")
            })?;

        if let Ok(Some(updated)) = dal
            .update_status(island.id, IslandStatus::Running, StatusPatch::ip(ip.to_string()))
            .await
        {
            self.service.publish_island(&updated).await;
        }

        let deadline = READY_WAIT.as_secs();
        for _ in 0..deadline {
            sleep(Duration::from_secs(1)).await;

            let ready = dal
                .island(island.id)
                .await?
                .map(|island| island.minecraft_ready)
                .unwrap_or(false);
            if ready {
                return Ok(());
            }
        }

        Err(Error::custom(
            ErrorKind::DriverTimeout,
            "island did not report ready within the deadline",
        ))
    }

    async fn finish_with(&self, island: &Island, status: IslandStatus) {
        let patch = match status {
            IslandStatus::Stopped => StatusPatch::stopped(),
            _ => StatusPatch::default(),
        };

        match self.service.dal().update_status(island.id, status, patch).await {
            Ok(Some(updated)) => self.service.publish_island(&updated).await,
            Ok(None) => {}
            Err(error) => {
                error!(%error, island_id = island.id, "could not write island status")
            }
        }
    }
}
