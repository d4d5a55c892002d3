use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::island::Island;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TeamRole {
    Owner,
    Moderator,
    Member,
}

/// A named group of players sharing one island.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub owner_uuid: Uuid,
    pub created_at: NaiveDateTime,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TeamMember {
    pub team_id: i64,
    pub player_uuid: Uuid,
    pub role: TeamRole,
}

/// A team with its members and island, as sent to clients in
/// `team_updated` events and team queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TeamView {
    #[serde(flatten)]
    pub team: Team,
    pub members: Vec<TeamMember>,
    pub island: Option<Island>,
}

#[cfg(feature = "persist")]
mod persist {
    use sqlx::sqlite::SqliteRow;
    use sqlx::{FromRow, Row};

    use super::*;

    impl FromRow<'_, SqliteRow> for Team {
        fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
            let owner_uuid: String = row.try_get("owner_uuid")?;

            Ok(Self {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                owner_uuid: owner_uuid
                    .parse()
                    .map_err(|err: uuid::Error| sqlx::Error::ColumnDecode {
                        index: "owner_uuid".to_string(),
                        source: Box::new(err),
                    })?,
                created_at: row.try_get("created_at")?,
            })
        }
    }

    impl FromRow<'_, SqliteRow> for TeamMember {
        fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
            let player_uuid: String = row.try_get("player_uuid")?;
            let role: String = row.try_get("role")?;

            Ok(Self {
                team_id: row.try_get("team_id")?,
                player_uuid: player_uuid.parse().map_err(|err: uuid::Error| {
                    sqlx::Error::ColumnDecode {
                        index: "player_uuid".to_string(),
                        source: Box::new(err),
                    }
                })?,
                role: role
                    .parse()
                    .map_err(|err: strum::ParseError| sqlx::Error::ColumnDecode {
                        index: "role".to_string(),
                        source: Box::new(err),
                    })?,
            })
        }
    }
}
