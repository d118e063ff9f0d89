//! SQLite implementation of per-login portal state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::database::DatabaseConnection;
use crate::error::BridgeError;
use crate::ids::{MatrixUserId, NetworkChatId, PortalKey, UserLoginId};
use crate::storage::{UserPortalRecord, UserPortalStore, parse_receiver, parse_timestamp};

const USER_PORTAL_COLUMNS: &str = r"
login_id, user_mxid, chat_id, receiver, in_portal, in_space, preference, last_read
";

const UPSERT_USER_PORTAL: &str = r"
INSERT OR REPLACE INTO user_portals (
    login_id, user_mxid, chat_id, receiver, in_portal, in_space, preference, last_read
) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
";

pub struct SqliteUserPortalStore {
    connection: DatabaseConnection,
}

impl SqliteUserPortalStore {
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn parse_row(row: &SqliteRow) -> UserPortalRecord {
        let chat_id: String = row.get("chat_id");
        let receiver: String = row.get("receiver");
        UserPortalRecord {
            login_id: UserLoginId::from(row.get::<String, _>("login_id").as_str()),
            user_mxid: MatrixUserId::from(row.get::<String, _>("user_mxid").as_str()),
            portal: PortalKey::new(NetworkChatId::from(chat_id.as_str()), parse_receiver(&receiver)),
            in_portal: row.get("in_portal"),
            in_space: row.get("in_space"),
            preference: row.get("preference"),
            last_read: row.get::<Option<i64>, _>("last_read").map(parse_timestamp),
        }
    }
}

#[async_trait]
impl UserPortalStore for SqliteUserPortalStore {
    async fn get(
        &self,
        login_id: &UserLoginId,
        portal: &PortalKey,
    ) -> Result<Option<UserPortalRecord>, BridgeError> {
        let query = format!(
            "SELECT {USER_PORTAL_COLUMNS} FROM user_portals
             WHERE login_id = ? AND chat_id = ? AND receiver = ?"
        );
        let row = sqlx::query(&query)
            .bind(login_id.as_str())
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .fetch_optional(self.connection.pool())
            .await?;
        Ok(row.as_ref().map(Self::parse_row))
    }

    async fn get_all_in_portal(
        &self,
        portal: &PortalKey,
    ) -> Result<Vec<UserPortalRecord>, BridgeError> {
        let query = format!(
            "SELECT {USER_PORTAL_COLUMNS} FROM user_portals
             WHERE chat_id = ? AND receiver = ?
             ORDER BY preference, login_id"
        );
        let rows = sqlx::query(&query)
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .fetch_all(self.connection.pool())
            .await?;
        Ok(rows.iter().map(Self::parse_row).collect())
    }

    async fn get_all_for_user(
        &self,
        user: &MatrixUserId,
        portal: &PortalKey,
    ) -> Result<Vec<UserPortalRecord>, BridgeError> {
        let query = format!(
            "SELECT {USER_PORTAL_COLUMNS} FROM user_portals
             WHERE user_mxid = ? AND chat_id = ? AND receiver = ?
             ORDER BY preference, login_id"
        );
        let rows = sqlx::query(&query)
            .bind(user.as_str())
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .fetch_all(self.connection.pool())
            .await?;
        Ok(rows.iter().map(Self::parse_row).collect())
    }

    async fn save(&self, record: &UserPortalRecord) -> Result<(), BridgeError> {
        sqlx::query(UPSERT_USER_PORTAL)
            .bind(record.login_id.as_str())
            .bind(record.user_mxid.as_str())
            .bind(record.portal.chat_id.as_str())
            .bind(record.portal.receiver_str())
            .bind(record.in_portal)
            .bind(record.in_space)
            .bind(record.preference)
            .bind(record.last_read.map(|t| t.timestamp_millis()))
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn set_last_read(
        &self,
        login_id: &UserLoginId,
        portal: &PortalKey,
        last_read: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        sqlx::query(
            "UPDATE user_portals SET last_read = ?
             WHERE login_id = ? AND chat_id = ? AND receiver = ?
               AND (last_read IS NULL OR last_read < ?)",
        )
        .bind(last_read.timestamp_millis())
        .bind(login_id.as_str())
        .bind(portal.chat_id.as_str())
        .bind(portal.receiver_str())
        .bind(last_read.timestamp_millis())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn delete_all_in_portal(&self, portal: &PortalKey) -> Result<(), BridgeError> {
        sqlx::query("DELETE FROM user_portals WHERE chat_id = ? AND receiver = ?")
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }
}
