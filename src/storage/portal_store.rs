//! SQLite implementation of portal persistence.

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::database::DatabaseConnection;
use crate::disappearing::{DisappearingSetting, DisappearingType};
use crate::error::BridgeError;
use crate::ids::{MatrixRoomId, NetworkChatId, NetworkUserId, PortalKey, UserLoginId};
use crate::storage::{PortalRecord, PortalStore, RoomType, parse_metadata, parse_receiver};

const PORTAL_COLUMNS: &str = r"
chat_id, receiver, room_id, room_type,
name, name_set, name_is_custom,
topic, topic_set,
avatar_id, avatar_hash, avatar_mxc, avatar_set,
parent_chat_id, parent_receiver, in_space,
other_user_id, relay_login_id,
disappear_type, disappear_timer, metadata
";

const UPSERT_PORTAL: &str = r"
INSERT OR REPLACE INTO portals (
    chat_id, receiver, room_id, room_type,
    name, name_set, name_is_custom,
    topic, topic_set,
    avatar_id, avatar_hash, avatar_mxc, avatar_set,
    parent_chat_id, parent_receiver, in_space,
    other_user_id, relay_login_id,
    disappear_type, disappear_timer, metadata
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
";

pub struct SqlitePortalStore {
    connection: DatabaseConnection,
}

impl SqlitePortalStore {
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn parse_row(row: &SqliteRow) -> PortalRecord {
        let chat_id: String = row.get("chat_id");
        let receiver: String = row.get("receiver");
        let parent_chat_id: Option<String> = row.get("parent_chat_id");
        let parent_receiver: Option<String> = row.get("parent_receiver");
        let disappear_type: String = row.get("disappear_type");
        let disappear_timer: Option<i64> = row.get("disappear_timer");
        let metadata: String = row.get("metadata");

        PortalRecord {
            key: PortalKey::new(NetworkChatId::from(chat_id.as_str()), parse_receiver(&receiver)),
            room_id: row
                .get::<Option<String>, _>("room_id")
                .map(|r| MatrixRoomId::from(r.as_str())),
            room_type: RoomType::parse(row.get::<String, _>("room_type").as_str()),
            name: row.get("name"),
            name_set: row.get("name_set"),
            name_is_custom: row.get("name_is_custom"),
            topic: row.get("topic"),
            topic_set: row.get("topic_set"),
            avatar_id: row.get("avatar_id"),
            avatar_hash: row.get("avatar_hash"),
            avatar_mxc: row.get("avatar_mxc"),
            avatar_set: row.get("avatar_set"),
            parent_key: parent_chat_id.map(|chat| {
                PortalKey::new(
                    NetworkChatId::from(chat.as_str()),
                    parent_receiver.as_deref().and_then(parse_receiver),
                )
            }),
            in_space: row.get("in_space"),
            other_user_id: row
                .get::<Option<String>, _>("other_user_id")
                .map(|u| NetworkUserId::from(u.as_str())),
            relay_login_id: row
                .get::<Option<String>, _>("relay_login_id")
                .map(|l| UserLoginId::from(l.as_str())),
            disappear: DisappearingSetting {
                disappear_type: DisappearingType::parse(&disappear_type),
                timer: disappear_timer
                    .and_then(|t| u64::try_from(t).ok())
                    .map(std::time::Duration::from_secs),
            },
            metadata: parse_metadata(&metadata),
        }
    }
}

#[async_trait]
impl PortalStore for SqlitePortalStore {
    async fn get(&self, key: &PortalKey) -> Result<Option<PortalRecord>, BridgeError> {
        let query = format!("SELECT {PORTAL_COLUMNS} FROM portals WHERE chat_id = ? AND receiver = ?");
        let row = sqlx::query(&query)
            .bind(key.chat_id.as_str())
            .bind(key.receiver_str())
            .fetch_optional(self.connection.pool())
            .await?;
        Ok(row.as_ref().map(Self::parse_row))
    }

    async fn get_by_room_id(
        &self,
        room_id: &MatrixRoomId,
    ) -> Result<Option<PortalRecord>, BridgeError> {
        let query = format!("SELECT {PORTAL_COLUMNS} FROM portals WHERE room_id = ?");
        let row = sqlx::query(&query)
            .bind(room_id.as_str())
            .fetch_optional(self.connection.pool())
            .await?;
        Ok(row.as_ref().map(Self::parse_row))
    }

    async fn find_any_receiver(
        &self,
        chat_id: &NetworkChatId,
    ) -> Result<Option<PortalRecord>, BridgeError> {
        let query = format!(
            "SELECT {PORTAL_COLUMNS} FROM portals WHERE chat_id = ? ORDER BY receiver LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(chat_id.as_str())
            .fetch_optional(self.connection.pool())
            .await?;
        Ok(row.as_ref().map(Self::parse_row))
    }

    async fn save(&self, portal: &PortalRecord) -> Result<(), BridgeError> {
        sqlx::query(UPSERT_PORTAL)
            .bind(portal.key.chat_id.as_str())
            .bind(portal.key.receiver_str())
            .bind(portal.room_id.as_ref().map(|r| r.as_str()))
            .bind(portal.room_type.as_str())
            .bind(portal.name.as_deref())
            .bind(portal.name_set)
            .bind(portal.name_is_custom)
            .bind(portal.topic.as_deref())
            .bind(portal.topic_set)
            .bind(portal.avatar_id.as_deref())
            .bind(portal.avatar_hash.as_deref())
            .bind(portal.avatar_mxc.as_deref())
            .bind(portal.avatar_set)
            .bind(portal.parent_key.as_ref().map(|p| p.chat_id.as_str()))
            .bind(portal.parent_key.as_ref().map(PortalKey::receiver_str))
            .bind(portal.in_space)
            .bind(portal.other_user_id.as_ref().map(|u| u.as_str()))
            .bind(portal.relay_login_id.as_ref().map(|l| l.as_str()))
            .bind(portal.disappear.disappear_type.as_str())
            .bind(
                portal
                    .disappear
                    .timer
                    .and_then(|t| i64::try_from(t.as_secs()).ok()),
            )
            .bind(portal.metadata.to_string())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &PortalKey) -> Result<(), BridgeError> {
        sqlx::query("DELETE FROM portals WHERE chat_id = ? AND receiver = ?")
            .bind(key.chat_id.as_str())
            .bind(key.receiver_str())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }
}
