use std::time::Duration;

use skyblock_common::models::island::{IslandStatus, QueueItemStatus};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::dal::{AdmissionQueue, Dal};
use crate::service::IslandService;
use crate::Error;

/// How often an admission worker re-checks the cap and its queue.
pub const ADMISSION_TICK: Duration = Duration::from_secs(5);

/// Single consumer of one admission queue. Exactly one worker per queue
/// must run; the cap check below is read-then-act, so a second consumer
/// would be able to overshoot the cap.
pub struct AdmissionWorker<D: Dal> {
    service: IslandService<D>,
    queue: AdmissionQueue,
    tick: Duration,
}

impl<D: Dal> AdmissionWorker<D> {
    pub fn new(service: IslandService<D>, queue: AdmissionQueue) -> Self {
        Self {
            service,
            queue,
            tick: ADMISSION_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run forever, admitting the oldest pending entry whenever capacity
    /// allows.
    pub async fn start(self) {
        info!(queue = %self.queue, "admission worker started");

        loop {
            sleep(self.tick).await;

            if let Err(error) = self.step().await {
                error!(queue = %self.queue, %error, "admission step failed");
            }
        }
    }

    /// One tick: read the cap, pop the oldest PENDING entry, run the same
    /// routine the online path would have run.
    pub async fn step(&self) -> Result<(), Error> {
        let dal = self.service.dal();
        let running = dal.count_with_status(IslandStatus::Running).await?;
        if running >= self.service.settings().max_running_servers {
            return Ok(());
        }

        let Some(entry) = dal.next_admission(self.queue).await? else {
            return Ok(());
        };

        info!(queue = %self.queue, player = %entry.player_uuid, "admitting queued request");
        dal.set_admission_status(self.queue, &entry.player_uuid, QueueItemStatus::Processing)
            .await?;

        let admitted = match self.queue {
            AdmissionQueue::Creation => {
                self.service
                    .admit_queued_creation(entry.player_uuid, entry.player_name.as_deref())
                    .await
            }
            AdmissionQueue::Start => self.service.admit_queued_start(entry.player_uuid).await,
        };

        match admitted {
            Ok(()) => {
                dal.remove_admission(self.queue, &entry.player_uuid).await?;
            }
            Err(error) => {
                warn!(queue = %self.queue, player = %entry.player_uuid, %error, "admission failed");
                dal.set_admission_status(self.queue, &entry.player_uuid, QueueItemStatus::Failed)
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use skyblock_common::models::island::IslandStatus;

    use super::*;
    use crate::service::StartOutcome;
    use crate::tests::World;

    #[tokio::test]
    async fn oldest_pending_entry_is_admitted_first() {
        let world = World::new().await;
        let first = World::player();
        let second = World::player();

        for (player, name) in [(first, "First"), (second, "Second")] {
            let island = world.service.create_island(player, name).await.unwrap();
            world.wait_for_status(island.id, IslandStatus::Stopped).await;
        }

        let dal = world.service.dal();
        dal.enqueue_admission(AdmissionQueue::Start, &first, Some("First"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        dal.enqueue_admission(AdmissionQueue::Start, &second, Some("Second"))
            .await
            .unwrap();

        let worker = AdmissionWorker::new(world.service.clone(), AdmissionQueue::Start);
        worker.step().await.unwrap();

        // One admission per tick, and it is the older entry.
        let first_island = dal.island_for_player(&first).await.unwrap().unwrap();
        assert_ne!(first_island.status, IslandStatus::Stopped);
        let second_island = dal.island_for_player(&second).await.unwrap().unwrap();
        assert_eq!(second_island.status, IslandStatus::Stopped);

        let remaining = dal.next_admission(AdmissionQueue::Start).await.unwrap().unwrap();
        assert_eq!(remaining.player_uuid, second);

        worker.step().await.unwrap();
        assert!(dal.next_admission(AdmissionQueue::Start).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn creation_queue_drains_once_capacity_frees_up() {
        let world = World::with_cap(1).await;
        let runner = World::player();
        let waiter = World::player();

        let island = world.service.create_island(runner, "Runner").await.unwrap();
        world.wait_for_status(island.id, IslandStatus::Stopped).await;
        world.service.start_island(runner, "Runner").await.unwrap();
        world.wait_for_status(island.id, IslandStatus::Running).await;

        let outcome = world.service.start_island(waiter, "Waiter").await.unwrap();
        assert!(matches!(
            outcome,
            StartOutcome::Queued(AdmissionQueue::Creation)
        ));

        let worker = AdmissionWorker::new(world.service.clone(), AdmissionQueue::Creation);

        // At the cap: nothing happens.
        worker.step().await.unwrap();
        assert!(world
            .service
            .dal()
            .island_for_player(&waiter)
            .await
            .unwrap()
            .is_none());

        world.service.stop_island(runner).await.unwrap();
        world.wait_for_status(island.id, IslandStatus::Stopped).await;

        worker.step().await.unwrap();
        let created = world
            .service
            .dal()
            .island_for_player(&waiter)
            .await
            .unwrap()
            .unwrap();
        world.wait_for_status(created.id, IslandStatus::Stopped).await;
        assert!(world
            .service
            .dal()
            .next_admission(AdmissionQueue::Creation)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn failed_admissions_are_marked_failed() {
        let world = World::new().await;
        let player = World::player();

        let island = world.service.create_island(player, "Alice").await.unwrap();
        world.wait_for_status(island.id, IslandStatus::Stopped).await;

        // An errored island cannot be started from the queue.
        world
            .service
            .dal()
            .update_status(
                island.id,
                IslandStatus::Error,
                crate::dal::StatusPatch::default(),
            )
            .await
            .unwrap();
        world
            .service
            .dal()
            .enqueue_admission(AdmissionQueue::Start, &player, Some("Alice"))
            .await
            .unwrap();

        let worker = AdmissionWorker::new(world.service.clone(), AdmissionQueue::Start);
        worker.step().await.unwrap();

        // The entry is parked as FAILED rather than retried forever.
        assert!(world
            .service
            .dal()
            .next_admission(AdmissionQueue::Start)
            .await
            .unwrap()
            .is_none());
    }
}
