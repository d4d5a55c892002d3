use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use skyblock_common::constants::{ISLAND_DATA_PATH, PLAYERSYNC_CONFIG_PATH};
use skyblock_common::models::event::Event;
use skyblock_common::models::island::{Island, IslandStatus, UpdateQueueEntry};
use skyblock_common::models::team::{Team, TeamRole, TeamView};
use tokio::sync::Notify;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::args::{Args, UpdateStrategy};
use crate::bus::EventBus;
use crate::dal::{AdmissionQueue, Dal, NewIsland, StatusPatch};
use crate::driver::{ContainerStatus, HypervisorDriver};
use crate::{Error, ErrorKind};

const PLAYERSYNC_TEMPLATE: &str = include_str!("../templates/playersync-common.template.toml");

/// Statuses DeleteIsland may start from: everything that is not owned by a
/// background task or worker.
const DELETABLE: &[IslandStatus] = &[
    IslandStatus::Stopped,
    IslandStatus::Running,
    IslandStatus::Frozen,
    IslandStatus::ErrorCreate,
    IslandStatus::ErrorStart,
    IslandStatus::UpdateFailed,
    IslandStatus::Error,
    IslandStatus::Archived,
];

/// Everything the kernel and its workers need to know about the fleet,
/// resolved once at startup from [`Args`].
#[derive(Clone, Debug)]
pub struct FleetSettings {
    pub base_image: String,
    pub new_base_image: String,
    pub profiles: Vec<String>,
    pub operation_timeout: Duration,
    pub ip_retry_attempts: u32,
    pub ip_retry_delay: Duration,
    pub max_running_servers: u32,
    pub default_mc_port: u16,
    pub update_strategy: UpdateStrategy,
    pub update_file_source: PathBuf,
    pub update_file_target: String,
    pub update_max_retries: u32,
    pub update_poll_interval: Duration,
}

impl FleetSettings {
    pub fn from_args(args: &Args) -> Self {
        Self {
            base_image: args.lxd_base_image.clone(),
            new_base_image: args.lxd_new_base_image.clone(),
            profiles: args.lxd_default_profiles.clone(),
            operation_timeout: Duration::from_secs(args.lxd_operation_timeout),
            ip_retry_attempts: args.lxd_ip_retry_attempts,
            ip_retry_delay: Duration::from_secs(args.lxd_ip_retry_delay),
            max_running_servers: args.max_running_servers,
            default_mc_port: args.default_mc_port,
            update_strategy: args.update_strategy,
            update_file_source: args.update_file_source.clone(),
            update_file_target: args.update_file_target.clone(),
            update_max_retries: args.update_max_retries,
            update_poll_interval: Duration::from_secs(args.update_poll_interval),
        }
    }
}

/// Outcome of a start request: either the island (possibly unchanged, for
/// idempotent calls) or the admission queue the request was parked in.
#[derive(Debug)]
pub enum StartOutcome {
    Island(Island),
    Queued(AdmissionQueue),
}

#[derive(Clone, Copy, Debug)]
pub enum ReadySelector {
    Team(i64),
    Player(Uuid),
}

/// The island kernel: sole owner of island status transitions. Each public
/// operation performs one atomic transition, publishes, and hands the slow
/// hypervisor work to a background task that writes the terminal status.
pub struct IslandService<D: Dal> {
    dal: D,
    driver: Arc<dyn HypervisorDriver>,
    bus: Arc<dyn EventBus>,
    settings: FleetSettings,
    update_signal: Arc<Notify>,
}

impl<D: Dal> Clone for IslandService<D> {
    fn clone(&self) -> Self {
        Self {
            dal: self.dal.clone(),
            driver: Arc::clone(&self.driver),
            bus: Arc::clone(&self.bus),
            settings: self.settings.clone(),
            update_signal: Arc::clone(&self.update_signal),
        }
    }
}

fn sanitise(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();

    if safe.chars().all(|c| c == '-') {
        "player".to_string()
    } else {
        safe
    }
}

fn uuid_prefix(uuid: &Uuid) -> String {
    uuid.simple().to_string()[..8].to_string()
}

impl<D: Dal> IslandService<D> {
    pub fn new(
        dal: D,
        driver: Arc<dyn HypervisorDriver>,
        bus: Arc<dyn EventBus>,
        settings: FleetSettings,
    ) -> Self {
        Self {
            dal,
            driver,
            bus,
            settings,
            update_signal: Arc::new(Notify::new()),
        }
    }

    pub fn dal(&self) -> &D {
        &self.dal
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    pub(crate) fn driver(&self) -> &Arc<dyn HypervisorDriver> {
        &self.driver
    }

    pub(crate) fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// Wakes the update worker when a new queue entry lands.
    pub fn update_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.update_signal)
    }

    pub async fn island_for_player(&self, player_uuid: &Uuid) -> Result<Option<Island>, Error> {
        Ok(self.dal.island_for_player(player_uuid).await?)
    }

    /// The client ids an island's events are addressed to: every member of
    /// the owning team, or the solo player.
    pub(crate) async fn recipients(&self, island: &Island) -> Vec<String> {
        if let Some(team_id) = island.team_id {
            match self.dal.team_members(team_id).await {
                Ok(members) if !members.is_empty() => {
                    return members
                        .into_iter()
                        .map(|member| member.player_uuid.to_string())
                        .collect()
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "could not resolve event recipients"),
            }
        }

        island
            .player_uuid
            .map(|uuid| vec![uuid.to_string()])
            .unwrap_or_default()
    }

    pub(crate) async fn publish_island(&self, island: &Island) {
        let recipients = self.recipients(island).await;
        if let Err(err) = self
            .bus
            .publish(&recipients, &Event::IslandUpdated(island.clone()))
            .await
        {
            warn!(error = %err, island_id = island.id, "failed to publish island event");
        }
    }

    async fn publish_team(&self, view: &TeamView) {
        let recipients: Vec<String> = view
            .members
            .iter()
            .map(|member| member.player_uuid.to_string())
            .collect();
        if let Err(err) = self
            .bus
            .publish(&recipients, &Event::TeamUpdated(view.clone()))
            .await
        {
            warn!(error = %err, team_id = view.team.id, "failed to publish team event");
        }
    }

    async fn team_view(&self, team: Team) -> Result<TeamView, Error> {
        let members = self.dal.team_members(team.id).await?;
        let island = self.dal.island_for_team(team.id).await?;

        Ok(TeamView {
            team,
            members,
            island,
        })
    }

    pub async fn team_view_for_player(&self, player_uuid: &Uuid) -> Result<TeamView, Error> {
        let team = self
            .dal
            .team_for_player(player_uuid)
            .await?
            .ok_or(ErrorKind::TeamNotFound)?;

        self.team_view(team).await
    }

    async fn running_count(&self) -> Result<u32, Error> {
        Ok(self.dal.count_with_status(IslandStatus::Running).await?)
    }

    /// Render the island data file the in-game mod reads at boot.
    pub(crate) async fn island_data_toml(&self, island: &Island) -> Result<String, Error> {
        if let Some(team_id) = island.team_id {
            let team = self.dal.team(team_id).await?.ok_or(ErrorKind::TeamNotFound)?;
            let members = self.dal.team_members(team_id).await?;
            let member_list: Vec<String> = members
                .iter()
                .map(|member| format!("\"{}\"", member.player_uuid))
                .collect();

            Ok(format!(
                "is_island_server = true\nteam_id = {}\nowner_uuid = \"{}\"\nmember_uuids = [{}]\n",
                team.id,
                team.owner_uuid,
                member_list.join(", "),
            ))
        } else {
            let creator = island.player_uuid.ok_or(ErrorKind::Internal)?;
            Ok(format!(
                "is_island_server = true\ncreator_uuid = \"{creator}\"\n"
            ))
        }
    }

    /// Create an island for a player: bound to their team when they have
    /// one, a legacy solo island otherwise.
    #[instrument(skip(self))]
    pub async fn create_island(
        &self,
        player_uuid: Uuid,
        player_name: &str,
    ) -> Result<Island, Error> {
        if self.dal.island_for_player(&player_uuid).await?.is_some() {
            return Err(Error::from(ErrorKind::AlreadyExists));
        }

        let team = self.dal.team_for_player(&player_uuid).await?;
        let new = match &team {
            Some(team) => NewIsland {
                team_id: Some(team.id),
                player_uuid: None,
                container_name: format!(
                    "skyblock-team-{}-{:08x}",
                    sanitise(&team.name),
                    rand::thread_rng().gen::<u32>()
                ),
                internal_port: self.settings.default_mc_port,
            },
            None => NewIsland {
                team_id: None,
                player_uuid: Some(player_uuid),
                container_name: format!(
                    "skyblock-solo-{}-{}",
                    sanitise(player_name),
                    uuid_prefix(&player_uuid)
                ),
                internal_port: self.settings.default_mc_port,
            },
        };

        let island = self.dal.insert_island(new).await?;
        info!(island_id = island.id, container = %island.container_name, "island created");
        self.publish_island(&island).await;

        let service = self.clone();
        let task = island.clone();
        tokio::spawn(async move { service.perform_clone(task).await });

        Ok(island)
    }

    /// Create a team of one and its island in one request.
    #[instrument(skip(self))]
    pub async fn create_solo_island(
        &self,
        player_uuid: Uuid,
        player_name: &str,
    ) -> Result<TeamView, Error> {
        if self.dal.team_for_player(&player_uuid).await?.is_some()
            || self.dal.island_for_player(&player_uuid).await?.is_some()
        {
            return Err(Error::from(ErrorKind::AlreadyExists));
        }

        let name = sanitise(player_name);
        let team_name = if self.dal.team_by_name(&name).await?.is_some() {
            format!("{name}-{}", uuid_prefix(&player_uuid))
        } else {
            name
        };
        let team = self.dal.create_team(&team_name, &player_uuid).await?;

        let container_name = format!(
            "skyblock-team-{}-{:08x}",
            sanitise(&team.name),
            rand::thread_rng().gen::<u32>()
        );
        let island = self
            .dal
            .insert_island(NewIsland {
                team_id: Some(team.id),
                player_uuid: None,
                container_name,
                internal_port: self.settings.default_mc_port,
            })
            .await?;

        self.publish_island(&island).await;
        let service = self.clone();
        let task = island;
        tokio::spawn(async move { service.perform_clone(task).await });

        let view = self.team_view(team).await?;
        self.publish_team(&view).await;

        Ok(view)
    }

    async fn perform_clone(&self, island: Island) {
        let name = island.container_name.as_str();

        let result: Result<(), Error> = async {
            self.driver
                .clone_image(&self.settings.base_image, name, &self.settings.profiles)
                .await?;

            let island_data = self.island_data_toml(&island).await?;
            self.driver
                .push_file(name, ISLAND_DATA_PATH, island_data.as_bytes(), None, None, None)
                .await?;

            let server_id: u32 = rand::thread_rng().gen_range(100_000..=999_999);
            let playersync = PLAYERSYNC_TEMPLATE.replace("{{SERVER_ID}}", &server_id.to_string());
            self.driver
                .push_file(
                    name,
                    PLAYERSYNC_CONFIG_PATH,
                    playersync.as_bytes(),
                    None,
                    None,
                    None,
                )
                .await?;

            Ok(())
        }
        .await;

        let terminal = match result {
            Ok(()) => {
                self.dal
                    .transition_status(
                        island.id,
                        &[IslandStatus::PendingCreation],
                        IslandStatus::Stopped,
                        StatusPatch::stopped(),
                    )
                    .await
            }
            Err(err) => {
                error!(error = %err, island_id = island.id, "island creation failed");
                self.dal
                    .update_status(island.id, IslandStatus::ErrorCreate, StatusPatch::stopped())
                    .await
            }
        };

        match terminal {
            Ok(Some(updated)) => self.publish_island(&updated).await,
            Ok(None) => {}
            Err(err) => error!(error = %err, island_id = island.id, "failed to write terminal status"),
        }
    }

    /// Start a player's island, falling back to creation when they have
    /// none, and parking the request in an admission queue when the
    /// RUNNING cap is reached.
    #[instrument(skip(self))]
    pub async fn start_island(
        &self,
        player_uuid: Uuid,
        player_name: &str,
    ) -> Result<StartOutcome, Error> {
        let Some(island) = self.dal.island_for_player(&player_uuid).await? else {
            if self.running_count().await? >= self.settings.max_running_servers {
                self.dal
                    .enqueue_admission(AdmissionQueue::Creation, &player_uuid, Some(player_name))
                    .await?;
                info!(%player_uuid, "cap reached, creation queued");
                return Ok(StartOutcome::Queued(AdmissionQueue::Creation));
            }

            let island = self.create_island(player_uuid, player_name).await?;
            return Ok(StartOutcome::Island(island));
        };

        match island.status {
            // Already running or on its way there.
            IslandStatus::Running
            | IslandStatus::PendingStart
            | IslandStatus::PendingCreation => Ok(StartOutcome::Island(island)),
            IslandStatus::Stopped | IslandStatus::Frozen => {
                if self.running_count().await? >= self.settings.max_running_servers {
                    self.dal
                        .enqueue_admission(AdmissionQueue::Start, &player_uuid, Some(player_name))
                        .await?;
                    info!(%player_uuid, island_id = island.id, "cap reached, start queued");
                    return Ok(StartOutcome::Queued(AdmissionQueue::Start));
                }

                self.begin_start(island).await.map(StartOutcome::Island)
            }
            _ => Err(Error::from(ErrorKind::InvalidState)),
        }
    }

    /// The PENDING_START transition plus background bring-up, shared by the
    /// online path and the start-queue worker (which has already checked
    /// the cap).
    pub(crate) async fn begin_start(&self, island: Island) -> Result<Island, Error> {
        let was_frozen = island.status == IslandStatus::Frozen;

        let Some(updated) = self
            .dal
            .transition_status(
                island.id,
                &[IslandStatus::Stopped, IslandStatus::Frozen],
                IslandStatus::PendingStart,
                StatusPatch::ready(false),
            )
            .await?
        else {
            // A concurrent request won the transition; report what is there
            // now.
            return Ok(self
                .dal
                .island(island.id)
                .await?
                .ok_or(ErrorKind::IslandNotFound)?);
        };

        self.publish_island(&updated).await;

        let service = self.clone();
        let task = updated.clone();
        tokio::spawn(async move { service.perform_start(task, was_frozen).await });

        Ok(updated)
    }

    async fn perform_start(&self, island: Island, was_frozen: bool) {
        let name = island.container_name.as_str();

        let result = async {
            if was_frozen {
                self.driver.unfreeze(name).await?;
            } else {
                self.driver.start(name).await?;
            }

            self.driver
                .wait_ipv4(
                    name,
                    self.settings.ip_retry_attempts,
                    self.settings.ip_retry_delay,
                )
                .await
        }
        .await;

        let terminal = match result {
            Ok(Some(ip)) => {
                self.dal
                    .update_status(island.id, IslandStatus::Running, StatusPatch::ip(ip.to_string()))
                    .await
            }
            Ok(None) => {
                warn!(island_id = island.id, "container started but never got an address");
                self.dal
                    .update_status(island.id, IslandStatus::ErrorStart, StatusPatch::clear_ip())
                    .await
            }
            Err(err) => {
                error!(error = %err, island_id = island.id, "island start failed");
                self.dal
                    .update_status(island.id, IslandStatus::ErrorStart, StatusPatch::clear_ip())
                    .await
            }
        };

        match terminal {
            Ok(Some(updated)) => self.publish_island(&updated).await,
            Ok(None) => {}
            Err(err) => error!(error = %err, island_id = island.id, "failed to write terminal status"),
        }
    }

    #[instrument(skip(self))]
    pub async fn stop_island(&self, player_uuid: Uuid) -> Result<Island, Error> {
        let island = self
            .dal
            .island_for_player(&player_uuid)
            .await?
            .ok_or(ErrorKind::IslandNotFound)?;

        match island.status {
            IslandStatus::Stopped | IslandStatus::PendingStop => Ok(island),
            IslandStatus::Running | IslandStatus::Frozen | IslandStatus::ErrorStart => {
                let Some(updated) = self
                    .dal
                    .transition_status(
                        island.id,
                        &[
                            IslandStatus::Running,
                            IslandStatus::Frozen,
                            IslandStatus::ErrorStart,
                        ],
                        IslandStatus::PendingStop,
                        StatusPatch::ready(false),
                    )
                    .await?
                else {
                    return Ok(self
                        .dal
                        .island(island.id)
                        .await?
                        .ok_or(ErrorKind::IslandNotFound)?);
                };

                self.publish_island(&updated).await;

                let service = self.clone();
                let task = updated.clone();
                tokio::spawn(async move { service.perform_stop(task).await });

                Ok(updated)
            }
            _ => Err(Error::from(ErrorKind::InvalidState)),
        }
    }

    async fn perform_stop(&self, island: Island) {
        let name = island.container_name.as_str();

        let result = match self
            .driver
            .stop(name, true, self.settings.operation_timeout)
            .await
        {
            // The container being gone means the target state is reached.
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        };

        let terminal = match result {
            Ok(()) => {
                self.dal
                    .update_status(island.id, IslandStatus::Stopped, StatusPatch::stopped())
                    .await
            }
            Err(err) => {
                error!(error = %err, island_id = island.id, "island stop failed");
                self.dal
                    .update_status(island.id, IslandStatus::Error, StatusPatch::stopped())
                    .await
            }
        };

        match terminal {
            Ok(Some(updated)) => self.publish_island(&updated).await,
            Ok(None) => {}
            Err(err) => error!(error = %err, island_id = island.id, "failed to write terminal status"),
        }
    }

    #[instrument(skip(self))]
    pub async fn freeze_island(&self, player_uuid: Uuid) -> Result<Island, Error> {
        let island = self
            .dal
            .island_for_player(&player_uuid)
            .await?
            .ok_or(ErrorKind::IslandNotFound)?;

        match island.status {
            IslandStatus::Frozen | IslandStatus::PendingFreeze => Ok(island),
            IslandStatus::Running => {
                let Some(updated) = self
                    .dal
                    .transition_status(
                        island.id,
                        &[IslandStatus::Running],
                        IslandStatus::PendingFreeze,
                        StatusPatch::ready(false),
                    )
                    .await?
                else {
                    return Ok(self
                        .dal
                        .island(island.id)
                        .await?
                        .ok_or(ErrorKind::IslandNotFound)?);
                };

                self.publish_island(&updated).await;

                let service = self.clone();
                let task = updated.clone();
                tokio::spawn(async move { service.perform_freeze(task).await });

                Ok(updated)
            }
            _ => Err(Error::from(ErrorKind::InvalidState)),
        }
    }

    async fn perform_freeze(&self, island: Island) {
        let terminal = match self.driver.freeze(&island.container_name).await {
            // The address stays valid while the processes are frozen.
            Ok(()) => {
                self.dal
                    .update_status(island.id, IslandStatus::Frozen, StatusPatch::default())
                    .await
            }
            Err(err) => {
                error!(error = %err, island_id = island.id, "island freeze failed");
                self.dal
                    .update_status(island.id, IslandStatus::Error, StatusPatch::default())
                    .await
            }
        };

        match terminal {
            Ok(Some(updated)) => self.publish_island(&updated).await,
            Ok(None) => {}
            Err(err) => error!(error = %err, island_id = island.id, "failed to write terminal status"),
        }
    }

    /// The in-container server signals that the world is loaded. Only legal
    /// while RUNNING with the flag still clear.
    #[instrument(skip(self))]
    pub async fn mark_ready(&self, selector: ReadySelector) -> Result<Island, Error> {
        let island = match selector {
            ReadySelector::Team(team_id) => self.dal.island_for_team(team_id).await?,
            ReadySelector::Player(player_uuid) => {
                self.dal.island_for_player(&player_uuid).await?
            }
        }
        .ok_or(ErrorKind::IslandNotFound)?;

        if !self.dal.mark_ready(island.id).await? {
            return Err(Error::from(ErrorKind::InvalidState));
        }

        let island = self
            .dal
            .island(island.id)
            .await?
            .ok_or(ErrorKind::IslandNotFound)?;
        self.publish_island(&island).await;

        Ok(island)
    }

    /// Move a player into another team, tearing down the solo island (and
    /// team of one) they leave behind.
    #[instrument(skip(self))]
    pub async fn join_team(&self, player_uuid: Uuid, team_name: &str) -> Result<TeamView, Error> {
        let target = self
            .dal
            .team_by_name(team_name)
            .await?
            .ok_or(ErrorKind::TeamNotFound)?;

        let current = self.dal.team_for_player(&player_uuid).await?;
        if let Some(current) = &current {
            if current.id == target.id {
                return self.team_view(target).await;
            }
            let members = self.dal.team_members(current.id).await?;
            if members.len() > 1 {
                return Err(Error::custom(
                    ErrorKind::InvalidState,
                    "cannot leave a team that still has other members",
                ));
            }
        }

        // Captured before the membership changes so the lookup still sees
        // the old solo island.
        let old_island = self.dal.island_for_player(&player_uuid).await?;

        if let Some(current) = &current {
            self.dal.remove_member(current.id, &player_uuid).await?;
            self.dal.remove_team(current.id).await?;
        }
        self.dal
            .add_member(target.id, &player_uuid, TeamRole::Member)
            .await?;

        if let Some(island) = old_island {
            if island.team_id != Some(target.id) {
                self.schedule_delete(island, vec![player_uuid.to_string()])
                    .await;
            }
        }

        let view = self.team_view(target).await?;
        self.publish_team(&view).await;

        Ok(view)
    }

    /// A member leaves their team; the owner leaving disbands it.
    #[instrument(skip(self))]
    pub async fn leave_team(&self, team_id: i64, player_uuid: Uuid) -> Result<(), Error> {
        let team = self.dal.team(team_id).await?.ok_or(ErrorKind::TeamNotFound)?;
        let members = self.dal.team_members(team_id).await?;
        if !members
            .iter()
            .any(|member| member.player_uuid == player_uuid)
        {
            return Err(Error::custom(
                ErrorKind::InvalidState,
                "player is not a member of this team",
            ));
        }

        if team.owner_uuid == player_uuid {
            info!(team_id, "owner left, disbanding team");
            let recipients: Vec<String> = members
                .iter()
                .map(|member| member.player_uuid.to_string())
                .collect();
            let island = self.dal.island_for_team(team_id).await?;
            self.dal.remove_team(team_id).await?;
            if let Some(island) = island {
                self.schedule_delete(island, recipients).await;
            }
        } else {
            self.dal.remove_member(team_id, &player_uuid).await?;
            let view = self.team_view(team).await?;
            self.publish_team(&view).await;
        }

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn rename_team(
        &self,
        team_id: i64,
        player_uuid: Uuid,
        new_name: &str,
    ) -> Result<TeamView, Error> {
        let team = self.dal.team(team_id).await?.ok_or(ErrorKind::TeamNotFound)?;
        if team.owner_uuid != player_uuid {
            return Err(Error::custom(
                ErrorKind::InvalidState,
                "only the team owner can rename the team",
            ));
        }

        if let Some(existing) = self.dal.team_by_name(new_name).await? {
            if existing.id != team_id {
                return Err(Error::from(ErrorKind::AlreadyExists));
            }
        }

        let team = self.dal.rename_team(team_id, new_name).await?;
        let view = self.team_view(team).await?;
        self.publish_team(&view).await;

        Ok(view)
    }

    /// Tear an island down: stop if needed, delete the container, drop the
    /// row.
    #[instrument(skip(self))]
    pub async fn delete_island(&self, island_id: i64) -> Result<Island, Error> {
        let island = self
            .dal
            .island(island_id)
            .await?
            .ok_or(ErrorKind::IslandNotFound)?;

        if island.status == IslandStatus::Deleting {
            return Ok(island);
        }

        let recipients = self.recipients(&island).await;
        let Some(updated) = self
            .dal
            .transition_status(
                island_id,
                DELETABLE,
                IslandStatus::Deleting,
                StatusPatch::ready(false),
            )
            .await?
        else {
            return Err(Error::from(ErrorKind::InvalidState));
        };

        self.publish_island(&updated).await;
        self.schedule_delete(updated.clone(), recipients).await;

        Ok(updated)
    }

    async fn schedule_delete(&self, island: Island, recipients: Vec<String>) {
        // Mark the row before the container work starts; redundant when the
        // caller already did the transition.
        if island.status != IslandStatus::Deleting {
            if let Err(err) = self
                .dal
                .update_status(island.id, IslandStatus::Deleting, StatusPatch::ready(false))
                .await
            {
                error!(error = %err, island_id = island.id, "could not mark island for deletion");
                return;
            }
        }

        let service = self.clone();
        tokio::spawn(async move { service.perform_delete(island, recipients).await });
    }

    async fn perform_delete(&self, island: Island, recipients: Vec<String>) {
        let name = island.container_name.as_str();

        let result = async {
            match self.driver.state(name).await {
                Ok(state) if state.status != ContainerStatus::Stopped => {
                    match self
                        .driver
                        .stop(name, true, self.settings.operation_timeout)
                        .await
                    {
                        Ok(()) => {}
                        Err(err) if err.is_not_found() => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(_) => {}
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
            }

            match self.driver.delete(name).await {
                Ok(()) => Ok(()),
                Err(err) if err.is_not_found() => Ok(()),
                Err(err) => Err(err),
            }
        }
        .await;

        match result {
            Ok(()) => {
                let cleanup: Result<(), Error> = async {
                    self.dal.remove_update_entry(island.id).await?;
                    self.dal
                        .update_status(island.id, IslandStatus::Archived, StatusPatch::stopped())
                        .await?;
                    self.dal.remove_island(island.id).await?;
                    Ok(())
                }
                .await;

                if let Err(err) = cleanup {
                    error!(error = %err, island_id = island.id, "island row cleanup failed");
                    return;
                }

                info!(island_id = island.id, container = name, "island deleted");
                if let Err(err) = self
                    .bus
                    .publish(
                        &recipients,
                        &Event::IslandDeleted {
                            island_id: island.id,
                        },
                    )
                    .await
                {
                    warn!(error = %err, island_id = island.id, "failed to publish deletion");
                }
            }
            Err(err) => {
                error!(error = %err, island_id = island.id, "island deletion failed");
                if let Ok(Some(updated)) = self
                    .dal
                    .update_status(island.id, IslandStatus::Error, StatusPatch::default())
                    .await
                {
                    self.publish_island(&updated).await;
                }
            }
        }
    }

    /// Queue an island for a fleet update and wake the update worker.
    #[instrument(skip(self))]
    pub async fn queue_update(&self, island_id: i64) -> Result<UpdateQueueEntry, Error> {
        let island = self
            .dal
            .island(island_id)
            .await?
            .ok_or(ErrorKind::IslandNotFound)?;

        // Re-queueing a failed update is always allowed; that is how an
        // operator revives an island whose retry budget ran out.
        if !matches!(
            island.status,
            IslandStatus::Stopped | IslandStatus::Running | IslandStatus::UpdateFailed
        ) {
            return Err(Error::from(ErrorKind::InvalidState));
        }
        let was_running = island.status == IslandStatus::Running;

        let entry = self.dal.enqueue_update(island.id, was_running).await?;

        if let Some(updated) = self
            .dal
            .transition_status(
                island_id,
                &[
                    IslandStatus::Stopped,
                    IslandStatus::Running,
                    IslandStatus::UpdateFailed,
                ],
                IslandStatus::PendingUpdate,
                StatusPatch::default(),
            )
            .await?
        {
            self.publish_island(&updated).await;
        }

        self.update_signal.notify_one();

        Ok(entry)
    }

    /// Snapshots currently held for an island's container.
    pub async fn list_snapshots(&self, island_id: i64) -> Result<Vec<String>, Error> {
        let island = self
            .dal
            .island(island_id)
            .await?
            .ok_or(ErrorKind::IslandNotFound)?;

        Ok(self.driver.snapshots_list(&island.container_name).await?)
    }

    /// Bulk-enqueue the whole fleet; islands already queued or in an
    /// illegal state are skipped.
    pub async fn queue_all_updates(&self) -> Result<u32, Error> {
        let islands = self
            .dal
            .islands_with_statuses(&[IslandStatus::Stopped, IslandStatus::Running])
            .await?;

        let mut queued = 0;
        for island in islands {
            match self.queue_update(island.id).await {
                Ok(_) => queued += 1,
                Err(err) => {
                    warn!(error = %err, island_id = island.id, "island not queued for update")
                }
            }
        }

        Ok(queued)
    }

    /// Creation-queue admission: the same routine the online path uses,
    /// invoked by the single queue worker once capacity frees up.
    pub(crate) async fn admit_queued_creation(
        &self,
        player_uuid: Uuid,
        player_name: Option<&str>,
    ) -> Result<(), Error> {
        match self
            .create_island(player_uuid, player_name.unwrap_or("player"))
            .await
        {
            Ok(_) => Ok(()),
            // The island appeared some other way; the entry is stale.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub(crate) async fn admit_queued_start(&self, player_uuid: Uuid) -> Result<(), Error> {
        let island = self
            .dal
            .island_for_player(&player_uuid)
            .await?
            .ok_or(ErrorKind::IslandNotFound)?;

        match island.status {
            IslandStatus::Stopped | IslandStatus::Frozen => {
                self.begin_start(island).await.map(|_| ())
            }
            // Stale entry: the island is already on its way up.
            IslandStatus::Running
            | IslandStatus::PendingStart
            | IslandStatus::PendingCreation => Ok(()),
            _ => Err(Error::from(ErrorKind::InvalidState)),
        }
    }
}
