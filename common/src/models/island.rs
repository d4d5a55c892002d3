use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle status of an island. Transitions between these are owned by
/// the gateway kernel; see the transition rules next to the kernel.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IslandStatus {
    PendingCreation,
    Stopped,
    PendingStart,
    Running,
    PendingFreeze,
    Frozen,
    PendingStop,
    PendingUpdate,
    Updating,
    ErrorCreate,
    ErrorStart,
    UpdateFailed,
    Error,
    Deleting,
    Archived,
}

impl IslandStatus {
    pub const ALL: &'static [IslandStatus] = &[
        Self::PendingCreation,
        Self::Stopped,
        Self::PendingStart,
        Self::Running,
        Self::PendingFreeze,
        Self::Frozen,
        Self::PendingStop,
        Self::PendingUpdate,
        Self::Updating,
        Self::ErrorCreate,
        Self::ErrorStart,
        Self::UpdateFailed,
        Self::Error,
        Self::Deleting,
        Self::Archived,
    ];

    /// A transient status owned by a background task or worker.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingCreation
                | Self::PendingStart
                | Self::PendingFreeze
                | Self::PendingStop
                | Self::PendingUpdate
                | Self::Updating
                | Self::Deleting
        )
    }

    pub fn is_errored(&self) -> bool {
        matches!(
            self,
            Self::ErrorCreate | Self::ErrorStart | Self::UpdateFailed | Self::Error
        )
    }
}

/// One containerised game-server instance, owned by a team or (legacy) a
/// single player. Exactly one of `team_id` and `player_uuid` is populated
/// for newly created islands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Island {
    pub id: i64,
    pub team_id: Option<i64>,
    pub player_uuid: Option<Uuid>,
    pub container_name: String,
    pub status: IslandStatus,
    pub internal_ip: Option<String>,
    pub internal_port: Option<u16>,
    pub minecraft_ready: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub last_seen_at: Option<NaiveDateTime>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Failed,
}

/// Entry in one of the two admission queues (creation, start), ordered by
/// `requested_at`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionEntry {
    pub player_uuid: Uuid,
    pub player_name: Option<String>,
    pub status: QueueItemStatus,
    pub requested_at: NaiveDateTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateEntryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateQueueEntry {
    pub id: i64,
    pub island_id: i64,
    pub status: UpdateEntryStatus,
    pub was_running: bool,
    pub added_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

#[cfg(feature = "persist")]
mod persist {
    use sqlx::sqlite::SqliteRow;
    use sqlx::{FromRow, Row};

    use super::*;

    fn decode<T: std::str::FromStr>(raw: &str, index: &str) -> Result<T, sqlx::Error>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        raw.parse().map_err(|err: T::Err| sqlx::Error::ColumnDecode {
            index: index.to_string(),
            source: Box::new(err),
        })
    }

    impl FromRow<'_, SqliteRow> for Island {
        fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
            let status: String = row.try_get("status")?;
            let player_uuid: Option<String> = row.try_get("player_uuid")?;

            Ok(Self {
                id: row.try_get("id")?,
                team_id: row.try_get("team_id")?,
                player_uuid: player_uuid
                    .map(|raw| decode(&raw, "player_uuid"))
                    .transpose()?,
                container_name: row.try_get("container_name")?,
                status: decode(&status, "status")?,
                internal_ip: row.try_get("internal_ip")?,
                internal_port: row
                    .try_get::<Option<i64>, _>("internal_port")?
                    .map(|port| port as u16),
                minecraft_ready: row.try_get("minecraft_ready")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
                last_seen_at: row.try_get("last_seen_at")?,
            })
        }
    }

    impl FromRow<'_, SqliteRow> for AdmissionEntry {
        fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
            let player_uuid: String = row.try_get("player_uuid")?;
            let status: String = row.try_get("status")?;

            Ok(Self {
                player_uuid: decode(&player_uuid, "player_uuid")?,
                player_name: row.try_get("player_name")?,
                status: decode(&status, "status")?,
                requested_at: row.try_get("requested_at")?,
            })
        }
    }

    impl FromRow<'_, SqliteRow> for UpdateQueueEntry {
        fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
            let status: String = row.try_get("status")?;

            Ok(Self {
                id: row.try_get("id")?,
                island_id: row.try_get("island_id")?,
                status: decode(&status, "status")?,
                was_running: row.try_get("was_running")?,
                added_at: row.try_get("added_at")?,
                started_at: row.try_get("started_at")?,
                completed_at: row.try_get("completed_at")?,
                retry_count: row.try_get::<i64, _>("retry_count")? as u32,
                error_message: row.try_get("error_message")?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            IslandStatus::PendingCreation,
            IslandStatus::Running,
            IslandStatus::ErrorStart,
            IslandStatus::UpdateFailed,
            IslandStatus::Archived,
        ] {
            let raw = status.to_string();
            assert_eq!(raw.parse::<IslandStatus>().unwrap(), status);
        }

        assert_eq!(
            "PENDING_CREATION".parse::<IslandStatus>().unwrap(),
            IslandStatus::PendingCreation
        );
        assert!("pending_creation".parse::<IslandStatus>().is_err());
    }

    #[test]
    fn pending_statuses_are_transient() {
        assert!(IslandStatus::PendingStart.is_pending());
        assert!(IslandStatus::Updating.is_pending());
        assert!(!IslandStatus::Stopped.is_pending());
        assert!(!IslandStatus::ErrorStart.is_pending());
        assert!(IslandStatus::ErrorStart.is_errored());
    }
}
