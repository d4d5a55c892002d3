use skyblock_common::models::island::{Island, IslandStatus};
use tracing::{info, warn};

use crate::dal::{Dal, StatusPatch};
use crate::driver::{ContainerState, ContainerStatus};
use crate::service::IslandService;

/// DB statuses worth checking against the hypervisor after a restart.
const STATUSES_TO_CHECK: &[IslandStatus] = &[
    IslandStatus::Running,
    IslandStatus::Frozen,
    IslandStatus::PendingStart,
    IslandStatus::PendingFreeze,
    IslandStatus::PendingStop,
    IslandStatus::ErrorStart,
];

/// What the truth table says should happen to one island.
#[derive(Debug, PartialEq)]
struct Correction {
    status: IslandStatus,
    patch: StatusPatch,
}

/// One-shot consistency pass run at startup by the elected leader: every
/// island the database believes is active or in transition is checked
/// against the hypervisor, and the database is corrected to match reality.
/// Per-island driver errors are logged and the island is skipped; the next
/// startup retries. The reconciler never creates or deletes containers.
pub async fn reconcile_island_states<D: Dal>(service: &IslandService<D>) {
    info!("starting island state reconciliation");

    let islands = match service.dal().islands_with_statuses(STATUSES_TO_CHECK).await {
        Ok(islands) => islands,
        Err(error) => {
            warn!(%error, "reconciliation aborted, could not list islands");
            return;
        }
    };

    if islands.is_empty() {
        info!("no islands need reconciliation");
        return;
    }

    info!(count = islands.len(), "reconciling islands");

    for island in islands {
        let state = match service.driver().state(&island.container_name).await {
            Ok(state) => Some(state),
            Err(error) if error.is_not_found() => None,
            Err(error) => {
                warn!(
                    %error,
                    island_id = island.id,
                    container = %island.container_name,
                    "driver unreachable for island, skipping"
                );
                continue;
            }
        };

        let Some(correction) = decide(&island, state.as_ref()) else {
            continue;
        };

        info!(
            island_id = island.id,
            from = %island.status,
            to = %correction.status,
            "correcting island state"
        );

        match service
            .dal()
            .update_status(island.id, correction.status, correction.patch)
            .await
        {
            Ok(Some(updated)) => service.publish_island(&updated).await,
            Ok(None) => {}
            Err(error) => {
                warn!(%error, island_id = island.id, "could not write corrected state")
            }
        }
    }

    info!("island state reconciliation finished");
}

/// The reconciliation truth table. `None` means the database already
/// matches reality.
fn decide(island: &Island, state: Option<&ContainerState>) -> Option<Correction> {
    use ContainerStatus::*;
    use IslandStatus as Db;

    // Container gone entirely: every checked status degrades to ERROR.
    let Some(state) = state else {
        return Some(Correction {
            status: Db::Error,
            patch: StatusPatch::stopped(),
        });
    };

    let driver_ip = state.ipv4.map(|ip| ip.to_string());

    match (island.status, state.status) {
        (Db::Running, Running) => {
            // Keep, but adopt the address the hypervisor reports.
            match &driver_ip {
                Some(ip) if island.internal_ip.as_deref() != Some(ip.as_str()) => {
                    Some(Correction {
                        status: Db::Running,
                        patch: StatusPatch::ip(ip.clone()),
                    })
                }
                _ => None,
            }
        }
        (Db::Running, Frozen) => Some(Correction {
            status: Db::Frozen,
            patch: StatusPatch::ready(false),
        }),
        (Db::Running, Stopped) => Some(Correction {
            status: Db::Stopped,
            patch: StatusPatch::stopped(),
        }),

        (Db::Frozen, Running) => Some(Correction {
            status: Db::Running,
            patch: match driver_ip {
                Some(ip) => StatusPatch::ip(ip),
                None => StatusPatch::default(),
            },
        }),
        (Db::Frozen, Frozen) => None,
        (Db::Frozen, Stopped) => Some(Correction {
            status: Db::Stopped,
            patch: StatusPatch::stopped(),
        }),

        (Db::PendingStart, Running) => match driver_ip {
            Some(ip) => Some(Correction {
                status: Db::Running,
                patch: StatusPatch::ip(ip),
            }),
            // Up but unreachable: the start never completed.
            None => Some(Correction {
                status: Db::ErrorStart,
                patch: StatusPatch::stopped(),
            }),
        },
        (Db::PendingStart, Frozen) => Some(Correction {
            status: Db::Frozen,
            patch: StatusPatch::ready(false),
        }),
        (Db::PendingStart, Stopped) => Some(Correction {
            status: Db::Stopped,
            patch: StatusPatch::stopped(),
        }),

        (Db::PendingFreeze, Running) => Some(Correction {
            status: Db::Running,
            patch: StatusPatch::default(),
        }),
        (Db::PendingFreeze, Frozen) => Some(Correction {
            status: Db::Frozen,
            patch: StatusPatch::ready(false),
        }),
        (Db::PendingFreeze, Stopped) => Some(Correction {
            status: Db::Stopped,
            patch: StatusPatch::stopped(),
        }),

        (Db::PendingStop, Running) => Some(Correction {
            status: Db::Running,
            patch: StatusPatch::default(),
        }),
        (Db::PendingStop, Frozen) => Some(Correction {
            status: Db::Frozen,
            patch: StatusPatch::ready(false),
        }),
        (Db::PendingStop, Stopped) => Some(Correction {
            status: Db::Stopped,
            patch: StatusPatch::stopped(),
        }),

        (Db::ErrorStart, Running) => Some(Correction {
            status: Db::Running,
            patch: match driver_ip {
                Some(ip) => StatusPatch::ip(ip),
                None => StatusPatch::default(),
            },
        }),
        (Db::ErrorStart, Frozen) => Some(Correction {
            status: Db::Frozen,
            patch: StatusPatch::ready(false),
        }),
        (Db::ErrorStart, Stopped) => None,

        // Statuses outside STATUSES_TO_CHECK never reach here.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn island(status: IslandStatus, ip: Option<&str>) -> Island {
        let now = Utc::now().naive_utc();
        Island {
            id: 1,
            team_id: None,
            player_uuid: Some(uuid::Uuid::new_v4()),
            container_name: "skyblock-solo-alice-0a1b2c3d".to_string(),
            status,
            internal_ip: ip.map(str::to_string),
            internal_port: Some(25565),
            minecraft_ready: false,
            created_at: now,
            updated_at: now,
            last_seen_at: None,
        }
    }

    fn state(status: ContainerStatus, ip: Option<&str>) -> ContainerState {
        ContainerState {
            status,
            ipv4: ip.map(|raw| raw.parse().unwrap()),
        }
    }

    #[test]
    fn missing_container_degrades_to_error() {
        for status in STATUSES_TO_CHECK {
            let correction = decide(&island(*status, Some("10.0.0.1")), None).unwrap();
            assert_eq!(correction.status, IslandStatus::Error);
            assert_eq!(correction.patch.internal_ip, Some(None));
        }
    }

    #[test]
    fn running_island_adopts_drifted_address() {
        let db = island(IslandStatus::Running, Some("10.0.0.1"));

        // Matching address: nothing to do.
        assert!(decide(&db, Some(&state(ContainerStatus::Running, Some("10.0.0.1")))).is_none());

        let correction = decide(&db, Some(&state(ContainerStatus::Running, Some("10.0.0.9"))))
            .unwrap();
        assert_eq!(correction.status, IslandStatus::Running);
        assert_eq!(
            correction.patch.internal_ip,
            Some(Some("10.0.0.9".to_string()))
        );
    }

    #[test]
    fn pending_start_finalises_by_driver_state() {
        let db = island(IslandStatus::PendingStart, None);

        let up = decide(&db, Some(&state(ContainerStatus::Running, Some("10.0.0.4")))).unwrap();
        assert_eq!(up.status, IslandStatus::Running);

        let no_ip = decide(&db, Some(&state(ContainerStatus::Running, None))).unwrap();
        assert_eq!(no_ip.status, IslandStatus::ErrorStart);

        let down = decide(&db, Some(&state(ContainerStatus::Stopped, None))).unwrap();
        assert_eq!(down.status, IslandStatus::Stopped);
    }

    #[tokio::test]
    async fn missing_container_is_reported_to_clients() {
        use futures::StreamExt;
        use skyblock_common::models::event::Event;

        use crate::bus::EventBus;
        use crate::dal::Dal;
        use crate::tests::World;

        let world = World::new().await;
        let player = crate::tests::World::player();

        let created = world.service.create_island(player, "Alice").await.unwrap();
        world.wait_for_status(created.id, IslandStatus::Stopped).await;

        // The database believes the island runs, the hypervisor has no
        // trace of it.
        world
            .dal
            .update_status(
                created.id,
                IslandStatus::Running,
                StatusPatch::ip("10.0.0.3".to_string()),
            )
            .await
            .unwrap();
        world.driver.remove_container(&created.container_name).await;

        let mut events = world.bus.subscribe().await.unwrap();

        reconcile_island_states(&world.service).await;

        let island = world.dal.island(created.id).await.unwrap().unwrap();
        assert_eq!(island.status, IslandStatus::Error);
        assert_eq!(island.internal_ip, None);
        assert!(!island.minecraft_ready);

        let envelope = events.next().await.unwrap();
        assert!(matches!(
            envelope.event,
            Event::IslandUpdated(updated) if updated.status == IslandStatus::Error
        ));
    }

    #[tokio::test]
    async fn frozen_rows_catch_up_with_a_running_container() {
        use crate::dal::Dal;
        use crate::driver::HypervisorDriver;
        use crate::tests::World;

        let world = World::new().await;
        let player = crate::tests::World::player();

        let created = world.service.create_island(player, "Alice").await.unwrap();
        world.wait_for_status(created.id, IslandStatus::Stopped).await;

        // Someone unfroze the container behind the control plane's back.
        world
            .dal
            .update_status(created.id, IslandStatus::Frozen, StatusPatch::default())
            .await
            .unwrap();
        world.driver.start(&created.container_name).await.unwrap();

        reconcile_island_states(&world.service).await;

        let island = world.dal.island(created.id).await.unwrap().unwrap();
        assert_eq!(island.status, IslandStatus::Running);
        assert!(island.internal_ip.is_some());
    }

    #[test]
    fn frozen_and_stopped_rows_follow_reality() {
        let frozen = island(IslandStatus::Frozen, Some("10.0.0.2"));
        let woken = decide(&frozen, Some(&state(ContainerStatus::Running, Some("10.0.0.2"))))
            .unwrap();
        assert_eq!(woken.status, IslandStatus::Running);

        let stopped = decide(&frozen, Some(&state(ContainerStatus::Stopped, None))).unwrap();
        assert_eq!(stopped.status, IslandStatus::Stopped);
        assert_eq!(stopped.patch.internal_ip, Some(None));

        // ERROR_START with a stopped container is already consistent.
        let errored = island(IslandStatus::ErrorStart, None);
        assert!(decide(&errored, Some(&state(ContainerStatus::Stopped, None))).is_none());
    }
}
