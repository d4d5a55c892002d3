use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{NaiveDateTime, Utc};
use skyblock_common::models::island::{
    AdmissionEntry, Island, IslandStatus, QueueItemStatus, UpdateEntryStatus, UpdateQueueEntry,
};
use skyblock_common::models::team::{Team, TeamMember, TeamRole};
use sqlx::migrate::{MigrateDatabase, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{query, query_as, QueryBuilder, Row, SqlitePool};
use tracing::{error, info};
use uuid::Uuid;

pub static MIGRATIONS: Migrator = sqlx::migrate!("./migrations");

#[derive(thiserror::Error, Debug)]
pub enum DalError {
    Sqlx(#[from] sqlx::Error),
    IslandNotFound,
    TeamNotFound,
    AlreadyQueued,
}

// Not using `thiserror`'s `#[error]` syntax so database details never bubble
// up to users; the raw error is logged here instead.
impl fmt::Display for DalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DalError::Sqlx(error) => {
                error!(error = error.to_string(), "database request failed");
                "failed to interact with the fleet database"
            }
            DalError::IslandNotFound => "island not found",
            DalError::TeamNotFound => "team not found",
            DalError::AlreadyQueued => "island is already queued for update",
        };

        write!(f, "{msg}")
    }
}

/// Which admission queue a player is waiting in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionQueue {
    Creation,
    Start,
}

impl AdmissionQueue {
    fn table(&self) -> &'static str {
        match self {
            Self::Creation => "creation_queue",
            Self::Start => "start_queue",
        }
    }
}

impl fmt::Display for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creation => write!(f, "creation"),
            Self::Start => write!(f, "start"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewIsland {
    pub team_id: Option<i64>,
    pub player_uuid: Option<Uuid>,
    pub container_name: String,
    pub internal_port: u16,
}

/// Optional column updates carried along with a status write. The outer
/// `Option` means "leave as is"; the inner value is written verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusPatch {
    pub internal_ip: Option<Option<String>>,
    pub minecraft_ready: Option<bool>,
}

impl StatusPatch {
    pub fn clear_ip() -> Self {
        Self {
            internal_ip: Some(None),
            ..Default::default()
        }
    }

    pub fn ip(ip: String) -> Self {
        Self {
            internal_ip: Some(Some(ip)),
            ..Default::default()
        }
    }

    pub fn ready(ready: bool) -> Self {
        Self {
            minecraft_ready: Some(ready),
            ..Default::default()
        }
    }

    pub fn stopped() -> Self {
        Self {
            internal_ip: Some(None),
            minecraft_ready: Some(false),
        }
    }
}

#[async_trait]
pub trait Dal: Clone + Send + Sync + 'static {
    // Islands
    async fn island(&self, island_id: i64) -> Result<Option<Island>, DalError>;
    /// Find the island a player owns, either directly (legacy solo) or
    /// through their team membership.
    async fn island_for_player(&self, player_uuid: &Uuid) -> Result<Option<Island>, DalError>;
    async fn island_for_team(&self, team_id: i64) -> Result<Option<Island>, DalError>;
    async fn islands_with_statuses(
        &self,
        statuses: &[IslandStatus],
    ) -> Result<Vec<Island>, DalError>;
    async fn insert_island(&self, new: NewIsland) -> Result<Island, DalError>;
    /// Single-row compare-and-swap: the write happens only when the current
    /// status is one of `from`. Returns the updated island, or `None` when
    /// the precondition did not hold.
    async fn transition_status(
        &self,
        island_id: i64,
        from: &[IslandStatus],
        to: IslandStatus,
        patch: StatusPatch,
    ) -> Result<Option<Island>, DalError>;
    /// Unconditional status write, used by the reconciler and the update
    /// worker inside their owned intervals.
    async fn update_status(
        &self,
        island_id: i64,
        to: IslandStatus,
        patch: StatusPatch,
    ) -> Result<Option<Island>, DalError>;
    /// Flip `minecraft_ready` to true iff the island is RUNNING and the
    /// flag is currently false.
    async fn mark_ready(&self, island_id: i64) -> Result<bool, DalError>;
    /// Point the island at a new container, used when the image update
    /// strategy rebuilds it from a fresh base.
    async fn rename_container(
        &self,
        island_id: i64,
        container_name: &str,
    ) -> Result<(), DalError>;
    async fn remove_island(&self, island_id: i64) -> Result<(), DalError>;
    async fn count_with_status(&self, status: IslandStatus) -> Result<u32, DalError>;

    // Teams
    async fn team(&self, team_id: i64) -> Result<Option<Team>, DalError>;
    async fn team_by_name(&self, name: &str) -> Result<Option<Team>, DalError>;
    async fn team_for_player(&self, player_uuid: &Uuid) -> Result<Option<Team>, DalError>;
    async fn create_team(&self, name: &str, owner_uuid: &Uuid) -> Result<Team, DalError>;
    async fn team_members(&self, team_id: i64) -> Result<Vec<TeamMember>, DalError>;
    async fn add_member(
        &self,
        team_id: i64,
        player_uuid: &Uuid,
        role: TeamRole,
    ) -> Result<(), DalError>;
    async fn remove_member(&self, team_id: i64, player_uuid: &Uuid) -> Result<(), DalError>;
    async fn remove_team(&self, team_id: i64) -> Result<(), DalError>;
    async fn rename_team(&self, team_id: i64, new_name: &str) -> Result<Team, DalError>;

    // Admission queues
    async fn enqueue_admission(
        &self,
        queue: AdmissionQueue,
        player_uuid: &Uuid,
        player_name: Option<&str>,
    ) -> Result<(), DalError>;
    /// Oldest PENDING entry, FIFO by `requested_at`.
    async fn next_admission(
        &self,
        queue: AdmissionQueue,
    ) -> Result<Option<AdmissionEntry>, DalError>;
    async fn set_admission_status(
        &self,
        queue: AdmissionQueue,
        player_uuid: &Uuid,
        status: QueueItemStatus,
    ) -> Result<(), DalError>;
    async fn remove_admission(
        &self,
        queue: AdmissionQueue,
        player_uuid: &Uuid,
    ) -> Result<(), DalError>;

    // Update queue
    /// Queue an island for update. Re-queueing a FAILED entry resets it to
    /// PENDING with a fresh retry budget; this is how a past-cap entry is
    /// manually revived.
    async fn enqueue_update(
        &self,
        island_id: i64,
        was_running: bool,
    ) -> Result<UpdateQueueEntry, DalError>;
    async fn update_entry(&self, island_id: i64) -> Result<Option<UpdateQueueEntry>, DalError>;
    async fn next_pending_update(&self) -> Result<Option<UpdateQueueEntry>, DalError>;
    async fn update_entry_processing(&self, entry_id: i64) -> Result<(), DalError>;
    async fn update_entry_completed(&self, entry_id: i64) -> Result<(), DalError>;
    async fn update_entry_failed(
        &self,
        entry_id: i64,
        error_message: &str,
        retry_count: u32,
    ) -> Result<(), DalError>;
    async fn remove_update_entry(&self, island_id: i64) -> Result<(), DalError>;
}

#[derive(Clone)]
pub struct Sqlite {
    pool: SqlitePool,
}

impl Sqlite {
    /// Create the database if missing, run migrations, and return a pool.
    pub async fn new(url: &str) -> Result<Self, DalError> {
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        if path != ":memory:" && !Path::new(path).exists() {
            sqlx::Sqlite::create_database(url).await?;
        }

        info!(db = url, "opening fleet database");

        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;

        Self::from_pool(pool).await
    }

    pub async fn new_in_memory() -> Result<Self, DalError> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, DalError> {
        MIGRATIONS
            .run(&pool)
            .await
            .map_err(|err| DalError::Sqlx(err.into()))?;

        Ok(Self { pool })
    }

    fn now() -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

#[async_trait]
impl Dal for Sqlite {
    async fn island(&self, island_id: i64) -> Result<Option<Island>, DalError> {
        let island = query_as("SELECT * FROM islands WHERE id = ?1")
            .bind(island_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(island)
    }

    async fn island_for_player(&self, player_uuid: &Uuid) -> Result<Option<Island>, DalError> {
        let island = query_as(
            "SELECT * FROM islands WHERE player_uuid = ?1 \
             UNION \
             SELECT i.* FROM islands i \
             JOIN team_members m ON m.team_id = i.team_id \
             WHERE m.player_uuid = ?1 \
             LIMIT 1",
        )
        .bind(player_uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(island)
    }

    async fn island_for_team(&self, team_id: i64) -> Result<Option<Island>, DalError> {
        let island = query_as("SELECT * FROM islands WHERE team_id = ?1")
            .bind(team_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(island)
    }

    async fn islands_with_statuses(
        &self,
        statuses: &[IslandStatus],
    ) -> Result<Vec<Island>, DalError> {
        let mut builder = QueryBuilder::new("SELECT * FROM islands WHERE status IN (");
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(status.to_string());
        }
        builder.push(") ORDER BY updated_at");

        let islands = builder.build_query_as().fetch_all(&self.pool).await?;

        Ok(islands)
    }

    async fn insert_island(&self, new: NewIsland) -> Result<Island, DalError> {
        let now = Self::now();
        let island = query_as(
            "INSERT INTO islands \
             (team_id, player_uuid, container_name, status, internal_port, minecraft_ready, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, FALSE, ?6, ?6) \
             RETURNING *",
        )
        .bind(new.team_id)
        .bind(new.player_uuid.map(|uuid| uuid.to_string()))
        .bind(&new.container_name)
        .bind(IslandStatus::PendingCreation.to_string())
        .bind(new.internal_port as i64)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(island)
    }

    async fn transition_status(
        &self,
        island_id: i64,
        from: &[IslandStatus],
        to: IslandStatus,
        patch: StatusPatch,
    ) -> Result<Option<Island>, DalError> {
        let mut builder = QueryBuilder::new("UPDATE islands SET status = ");
        builder.push_bind(to.to_string());
        builder.push(", updated_at = ");
        builder.push_bind(Self::now());
        if let Some(ip) = &patch.internal_ip {
            builder.push(", internal_ip = ");
            builder.push_bind(ip.clone());
        }
        if let Some(ready) = patch.minecraft_ready {
            builder.push(", minecraft_ready = ");
            builder.push_bind(ready);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(island_id);
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in from {
            separated.push_bind(status.to_string());
        }
        builder.push(")");

        let updated = builder.build().execute(&self.pool).await?.rows_affected();
        if updated == 0 {
            return Ok(None);
        }

        self.island(island_id).await
    }

    async fn update_status(
        &self,
        island_id: i64,
        to: IslandStatus,
        patch: StatusPatch,
    ) -> Result<Option<Island>, DalError> {
        let mut builder = QueryBuilder::new("UPDATE islands SET status = ");
        builder.push_bind(to.to_string());
        builder.push(", updated_at = ");
        builder.push_bind(Self::now());
        if let Some(ip) = &patch.internal_ip {
            builder.push(", internal_ip = ");
            builder.push_bind(ip.clone());
        }
        if let Some(ready) = patch.minecraft_ready {
            builder.push(", minecraft_ready = ");
            builder.push_bind(ready);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(island_id);

        builder.build().execute(&self.pool).await?;

        self.island(island_id).await
    }

    async fn mark_ready(&self, island_id: i64) -> Result<bool, DalError> {
        let now = Self::now();
        let updated = query(
            "UPDATE islands SET minecraft_ready = TRUE, last_seen_at = ?2, updated_at = ?2 \
             WHERE id = ?1 AND status = ?3 AND minecraft_ready = FALSE",
        )
        .bind(island_id)
        .bind(now)
        .bind(IslandStatus::Running.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn rename_container(
        &self,
        island_id: i64,
        container_name: &str,
    ) -> Result<(), DalError> {
        query("UPDATE islands SET container_name = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(island_id)
            .bind(container_name)
            .bind(Self::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn remove_island(&self, island_id: i64) -> Result<(), DalError> {
        query("DELETE FROM islands WHERE id = ?1")
            .bind(island_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn count_with_status(&self, status: IslandStatus) -> Result<u32, DalError> {
        let count: i64 = query("SELECT COUNT(*) AS n FROM islands WHERE status = ?1")
            .bind(status.to_string())
            .fetch_one(&self.pool)
            .await?
            .get("n");

        Ok(count as u32)
    }

    async fn team(&self, team_id: i64) -> Result<Option<Team>, DalError> {
        let team = query_as("SELECT * FROM teams WHERE id = ?1")
            .bind(team_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(team)
    }

    async fn team_by_name(&self, name: &str) -> Result<Option<Team>, DalError> {
        let team = query_as("SELECT * FROM teams WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(team)
    }

    async fn team_for_player(&self, player_uuid: &Uuid) -> Result<Option<Team>, DalError> {
        let team = query_as(
            "SELECT t.* FROM teams t \
             JOIN team_members m ON m.team_id = t.id \
             WHERE m.player_uuid = ?1",
        )
        .bind(player_uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(team)
    }

    async fn create_team(&self, name: &str, owner_uuid: &Uuid) -> Result<Team, DalError> {
        let mut tx = self.pool.begin().await?;

        let team: Team = query_as(
            "INSERT INTO teams (name, owner_uuid, created_at) VALUES (?1, ?2, ?3) RETURNING *",
        )
        .bind(name)
        .bind(owner_uuid.to_string())
        .bind(Self::now())
        .fetch_one(&mut *tx)
        .await?;

        query("INSERT INTO team_members (team_id, player_uuid, role) VALUES (?1, ?2, ?3)")
            .bind(team.id)
            .bind(owner_uuid.to_string())
            .bind(TeamRole::Owner.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(team)
    }

    async fn team_members(&self, team_id: i64) -> Result<Vec<TeamMember>, DalError> {
        let members = query_as("SELECT * FROM team_members WHERE team_id = ?1")
            .bind(team_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(members)
    }

    async fn add_member(
        &self,
        team_id: i64,
        player_uuid: &Uuid,
        role: TeamRole,
    ) -> Result<(), DalError> {
        query("INSERT OR REPLACE INTO team_members (team_id, player_uuid, role) VALUES (?1, ?2, ?3)")
            .bind(team_id)
            .bind(player_uuid.to_string())
            .bind(role.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn remove_member(&self, team_id: i64, player_uuid: &Uuid) -> Result<(), DalError> {
        query("DELETE FROM team_members WHERE team_id = ?1 AND player_uuid = ?2")
            .bind(team_id)
            .bind(player_uuid.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn remove_team(&self, team_id: i64) -> Result<(), DalError> {
        query("DELETE FROM teams WHERE id = ?1")
            .bind(team_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn rename_team(&self, team_id: i64, new_name: &str) -> Result<Team, DalError> {
        let team = query_as("UPDATE teams SET name = ?2 WHERE id = ?1 RETURNING *")
            .bind(team_id)
            .bind(new_name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DalError::TeamNotFound)?;

        Ok(team)
    }

    async fn enqueue_admission(
        &self,
        queue: AdmissionQueue,
        player_uuid: &Uuid,
        player_name: Option<&str>,
    ) -> Result<(), DalError> {
        let sql = format!(
            "INSERT INTO {} (player_uuid, player_name, status, requested_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (player_uuid) DO UPDATE SET status = ?3",
            queue.table()
        );

        query(&sql)
            .bind(player_uuid.to_string())
            .bind(player_name)
            .bind(QueueItemStatus::Pending.to_string())
            .bind(Self::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn next_admission(
        &self,
        queue: AdmissionQueue,
    ) -> Result<Option<AdmissionEntry>, DalError> {
        let sql = format!(
            "SELECT * FROM {} WHERE status = ?1 ORDER BY requested_at LIMIT 1",
            queue.table()
        );

        let entry = query_as(&sql)
            .bind(QueueItemStatus::Pending.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(entry)
    }

    async fn set_admission_status(
        &self,
        queue: AdmissionQueue,
        player_uuid: &Uuid,
        status: QueueItemStatus,
    ) -> Result<(), DalError> {
        let sql = format!("UPDATE {} SET status = ?2 WHERE player_uuid = ?1", queue.table());

        query(&sql)
            .bind(player_uuid.to_string())
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn remove_admission(
        &self,
        queue: AdmissionQueue,
        player_uuid: &Uuid,
    ) -> Result<(), DalError> {
        let sql = format!("DELETE FROM {} WHERE player_uuid = ?1", queue.table());

        query(&sql)
            .bind(player_uuid.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn enqueue_update(
        &self,
        island_id: i64,
        was_running: bool,
    ) -> Result<UpdateQueueEntry, DalError> {
        let existing = self.update_entry(island_id).await?;

        match existing {
            Some(entry)
                if matches!(
                    entry.status,
                    UpdateEntryStatus::Pending | UpdateEntryStatus::Processing
                ) =>
            {
                Err(DalError::AlreadyQueued)
            }
            Some(_) => {
                let entry = query_as(
                    "UPDATE update_queue SET status = ?2, was_running = ?3, added_at = ?4, \
                     started_at = NULL, completed_at = NULL, retry_count = 0, \
                     error_message = NULL \
                     WHERE island_id = ?1 RETURNING *",
                )
                .bind(island_id)
                .bind(UpdateEntryStatus::Pending.to_string())
                .bind(was_running)
                .bind(Self::now())
                .fetch_one(&self.pool)
                .await?;

                Ok(entry)
            }
            None => {
                let entry = query_as(
                    "INSERT INTO update_queue (island_id, status, was_running, added_at) \
                     VALUES (?1, ?2, ?3, ?4) RETURNING *",
                )
                .bind(island_id)
                .bind(UpdateEntryStatus::Pending.to_string())
                .bind(was_running)
                .bind(Self::now())
                .fetch_one(&self.pool)
                .await?;

                Ok(entry)
            }
        }
    }

    async fn update_entry(&self, island_id: i64) -> Result<Option<UpdateQueueEntry>, DalError> {
        let entry = query_as("SELECT * FROM update_queue WHERE island_id = ?1")
            .bind(island_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(entry)
    }

    async fn next_pending_update(&self) -> Result<Option<UpdateQueueEntry>, DalError> {
        let entry = query_as(
            "SELECT * FROM update_queue WHERE status = ?1 ORDER BY added_at LIMIT 1",
        )
        .bind(UpdateEntryStatus::Pending.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    async fn update_entry_processing(&self, entry_id: i64) -> Result<(), DalError> {
        query("UPDATE update_queue SET status = ?2, started_at = ?3 WHERE id = ?1")
            .bind(entry_id)
            .bind(UpdateEntryStatus::Processing.to_string())
            .bind(Self::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_entry_completed(&self, entry_id: i64) -> Result<(), DalError> {
        query("UPDATE update_queue SET status = ?2, completed_at = ?3 WHERE id = ?1")
            .bind(entry_id)
            .bind(UpdateEntryStatus::Completed.to_string())
            .bind(Self::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_entry_failed(
        &self,
        entry_id: i64,
        error_message: &str,
        retry_count: u32,
    ) -> Result<(), DalError> {
        query(
            "UPDATE update_queue SET status = ?2, error_message = ?3, retry_count = ?4 \
             WHERE id = ?1",
        )
        .bind(entry_id)
        .bind(UpdateEntryStatus::Failed.to_string())
        .bind(error_message)
        .bind(retry_count as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_update_entry(&self, island_id: i64) -> Result<(), DalError> {
        query("DELETE FROM update_queue WHERE island_id = ?1")
            .bind(island_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
