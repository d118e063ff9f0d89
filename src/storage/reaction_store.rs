//! SQLite implementation of reaction persistence.

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::database::DatabaseConnection;
use crate::error::BridgeError;
use crate::ids::{
    EmojiId, MatrixEventId, NetworkChatId, NetworkMessageId, NetworkUserId, PartId, PortalKey,
};
use crate::storage::{ReactionRecord, ReactionStore, parse_metadata, parse_receiver, parse_timestamp};

const REACTION_COLUMNS: &str = r"
chat_id, receiver, message_id, message_part_id,
sender_id, emoji_id, emoji, mxid, timestamp, metadata
";

const UPSERT_REACTION: &str = r"
INSERT OR REPLACE INTO reactions (
    chat_id, receiver, message_id, message_part_id,
    sender_id, emoji_id, emoji, mxid, timestamp, metadata
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
";

pub struct SqliteReactionStore {
    connection: DatabaseConnection,
}

impl SqliteReactionStore {
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn parse_row(row: &SqliteRow) -> ReactionRecord {
        let chat_id: String = row.get("chat_id");
        let receiver: String = row.get("receiver");
        let metadata: String = row.get("metadata");
        ReactionRecord {
            portal: PortalKey::new(NetworkChatId::from(chat_id.as_str()), parse_receiver(&receiver)),
            message_id: NetworkMessageId::from(row.get::<String, _>("message_id").as_str()),
            message_part_id: PartId::from(row.get::<String, _>("message_part_id").as_str()),
            sender_id: NetworkUserId::from(row.get::<String, _>("sender_id").as_str()),
            emoji_id: EmojiId::from(row.get::<String, _>("emoji_id").as_str()),
            emoji: row.get("emoji"),
            mxid: MatrixEventId::from(row.get::<String, _>("mxid").as_str()),
            timestamp: parse_timestamp(row.get("timestamp")),
            metadata: parse_metadata(&metadata),
        }
    }
}

#[async_trait]
impl ReactionStore for SqliteReactionStore {
    async fn save(&self, reaction: &ReactionRecord) -> Result<(), BridgeError> {
        sqlx::query(UPSERT_REACTION)
            .bind(reaction.portal.chat_id.as_str())
            .bind(reaction.portal.receiver_str())
            .bind(reaction.message_id.as_str())
            .bind(reaction.message_part_id.as_str())
            .bind(reaction.sender_id.as_str())
            .bind(reaction.emoji_id.as_str())
            .bind(reaction.emoji.as_str())
            .bind(reaction.mxid.as_str())
            .bind(reaction.timestamp.timestamp_millis())
            .bind(reaction.metadata.to_string())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn get(
        &self,
        portal: &PortalKey,
        message_id: &NetworkMessageId,
        part_id: &PartId,
        sender_id: &NetworkUserId,
        emoji_id: &EmojiId,
    ) -> Result<Option<ReactionRecord>, BridgeError> {
        let query = format!(
            "SELECT {REACTION_COLUMNS} FROM reactions
             WHERE chat_id = ? AND receiver = ? AND message_id = ? AND message_part_id = ?
               AND sender_id = ? AND emoji_id = ?"
        );
        let row = sqlx::query(&query)
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .bind(message_id.as_str())
            .bind(part_id.as_str())
            .bind(sender_id.as_str())
            .bind(emoji_id.as_str())
            .fetch_optional(self.connection.pool())
            .await?;
        Ok(row.as_ref().map(Self::parse_row))
    }

    async fn get_by_mxid(
        &self,
        portal: &PortalKey,
        mxid: &MatrixEventId,
    ) -> Result<Option<ReactionRecord>, BridgeError> {
        let query = format!(
            "SELECT {REACTION_COLUMNS} FROM reactions
             WHERE chat_id = ? AND receiver = ? AND mxid = ?"
        );
        let row = sqlx::query(&query)
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .bind(mxid.as_str())
            .fetch_optional(self.connection.pool())
            .await?;
        Ok(row.as_ref().map(Self::parse_row))
    }

    async fn get_by_sender(
        &self,
        portal: &PortalKey,
        message_id: &NetworkMessageId,
        sender_id: &NetworkUserId,
    ) -> Result<Vec<ReactionRecord>, BridgeError> {
        let query = format!(
            "SELECT {REACTION_COLUMNS} FROM reactions
             WHERE chat_id = ? AND receiver = ? AND message_id = ? AND sender_id = ?
             ORDER BY timestamp, emoji_id"
        );
        let rows = sqlx::query(&query)
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .bind(message_id.as_str())
            .bind(sender_id.as_str())
            .fetch_all(self.connection.pool())
            .await?;
        Ok(rows.iter().map(Self::parse_row).collect())
    }

    async fn get_all_by_message(
        &self,
        portal: &PortalKey,
        message_id: &NetworkMessageId,
    ) -> Result<Vec<ReactionRecord>, BridgeError> {
        let query = format!(
            "SELECT {REACTION_COLUMNS} FROM reactions
             WHERE chat_id = ? AND receiver = ? AND message_id = ?
             ORDER BY timestamp, emoji_id"
        );
        let rows = sqlx::query(&query)
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .bind(message_id.as_str())
            .fetch_all(self.connection.pool())
            .await?;
        Ok(rows.iter().map(Self::parse_row).collect())
    }

    async fn delete(&self, reaction: &ReactionRecord) -> Result<(), BridgeError> {
        sqlx::query(
            "DELETE FROM reactions
             WHERE chat_id = ? AND receiver = ? AND message_id = ? AND message_part_id = ?
               AND sender_id = ? AND emoji_id = ?",
        )
        .bind(reaction.portal.chat_id.as_str())
        .bind(reaction.portal.receiver_str())
        .bind(reaction.message_id.as_str())
        .bind(reaction.message_part_id.as_str())
        .bind(reaction.sender_id.as_str())
        .bind(reaction.emoji_id.as_str())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn delete_all_in_portal(&self, portal: &PortalKey) -> Result<(), BridgeError> {
        sqlx::query("DELETE FROM reactions WHERE chat_id = ? AND receiver = ?")
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConfig;
    use crate::storage::{PortalRecord, PortalStore, SqlitePortalStore};
    use serde_json::Value;
    use tempfile::tempdir;

    async fn setup() -> (tempfile::TempDir, SqliteReactionStore, PortalKey) {
        let dir = tempdir().unwrap();
        let conn = DatabaseConnection::initialize(DatabaseConfig::for_testing(
            dir.path().join("test.db"),
        ))
        .await
        .unwrap();
        let key = PortalKey::shared(NetworkChatId::from("chat-1"));
        SqlitePortalStore::new(conn.clone())
            .save(&PortalRecord::new(key.clone()))
            .await
            .unwrap();
        (dir, SqliteReactionStore::new(conn), key)
    }

    fn reaction(portal: &PortalKey, sender: &str, emoji_id: &str, ts_millis: i64) -> ReactionRecord {
        ReactionRecord {
            portal: portal.clone(),
            message_id: NetworkMessageId::from("msg-1"),
            message_part_id: PartId::first(),
            sender_id: NetworkUserId::from(sender),
            emoji_id: EmojiId::from(emoji_id),
            emoji: emoji_id.to_owned(),
            mxid: MatrixEventId::from(format!("${sender}-{emoji_id}").as_str()),
            timestamp: parse_timestamp(ts_millis),
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_existing_identity() {
        let (_dir, store, key) = setup().await;
        let mut first = reaction(&key, "u1", "thumbs", 1000);
        store.save(&first).await.unwrap();
        first.emoji = "👍".to_owned();
        store.save(&first).await.unwrap();

        let loaded = store
            .get(
                &key,
                &NetworkMessageId::from("msg-1"),
                &PartId::first(),
                &NetworkUserId::from("u1"),
                &EmojiId::from("thumbs"),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.emoji, "👍");
    }

    #[tokio::test]
    async fn get_by_sender_orders_oldest_first() {
        let (_dir, store, key) = setup().await;
        store.save(&reaction(&key, "u1", "c", 3000)).await.unwrap();
        store.save(&reaction(&key, "u1", "a", 1000)).await.unwrap();
        store.save(&reaction(&key, "u1", "b", 2000)).await.unwrap();
        store.save(&reaction(&key, "u2", "d", 500)).await.unwrap();

        let rows = store
            .get_by_sender(&key, &NetworkMessageId::from("msg-1"), &NetworkUserId::from("u1"))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.emoji_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn delete_removes_only_target_row() {
        let (_dir, store, key) = setup().await;
        let victim = reaction(&key, "u1", "a", 1000);
        store.save(&victim).await.unwrap();
        store.save(&reaction(&key, "u1", "b", 2000)).await.unwrap();
        store.delete(&victim).await.unwrap();

        let remaining = store
            .get_all_by_message(&key, &NetworkMessageId::from("msg-1"))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].emoji_id.as_str(), "b");
    }
}
