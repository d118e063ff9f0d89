//! SQLite implementation of message-part persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::database::DatabaseConnection;
use crate::error::BridgeError;
use crate::ids::{
    MatrixEventId, MatrixUserId, MessageRef, NetworkChatId, NetworkMessageId, NetworkUserId,
    PartId, PortalKey,
};
use crate::storage::{MessageRecord, MessageStore, parse_metadata, parse_receiver, parse_timestamp};

const MESSAGE_COLUMNS: &str = r"
chat_id, receiver, message_id, part_id, mxid, fake_mxid,
sender_id, sender_mxid, timestamp, thread_root,
reply_to_id, reply_to_part, edit_count, metadata
";

const UPSERT_MESSAGE: &str = r"
INSERT OR REPLACE INTO messages (
    chat_id, receiver, message_id, part_id, mxid, fake_mxid,
    sender_id, sender_mxid, timestamp, thread_root,
    reply_to_id, reply_to_part, edit_count, metadata
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
";

pub struct SqliteMessageStore {
    connection: DatabaseConnection,
}

impl SqliteMessageStore {
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn parse_row(row: &SqliteRow) -> MessageRecord {
        let chat_id: String = row.get("chat_id");
        let receiver: String = row.get("receiver");
        let reply_to_id: Option<String> = row.get("reply_to_id");
        let reply_to_part: Option<String> = row.get("reply_to_part");
        let metadata: String = row.get("metadata");

        MessageRecord {
            portal: PortalKey::new(NetworkChatId::from(chat_id.as_str()), parse_receiver(&receiver)),
            id: NetworkMessageId::from(row.get::<String, _>("message_id").as_str()),
            part_id: PartId::from(row.get::<String, _>("part_id").as_str()),
            mxid: MatrixEventId::from(row.get::<String, _>("mxid").as_str()),
            fake_mxid: row.get("fake_mxid"),
            sender_id: NetworkUserId::from(row.get::<String, _>("sender_id").as_str()),
            sender_mxid: MatrixUserId::from(row.get::<String, _>("sender_mxid").as_str()),
            timestamp: parse_timestamp(row.get("timestamp")),
            thread_root: row
                .get::<Option<String>, _>("thread_root")
                .map(|t| NetworkMessageId::from(t.as_str())),
            reply_to: reply_to_id.map(|id| {
                MessageRef::new(
                    NetworkMessageId::from(id.as_str()),
                    reply_to_part.map(|p| PartId::from(p.as_str())),
                )
            }),
            edit_count: row.get("edit_count"),
            metadata: parse_metadata(&metadata),
        }
    }

    async fn fetch_one(
        &self,
        query: &str,
        portal: &PortalKey,
        extra: &[&str],
    ) -> Result<Option<MessageRecord>, BridgeError> {
        let mut q = sqlx::query(query)
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str());
        for arg in extra {
            q = q.bind(*arg);
        }
        let row = q.fetch_optional(self.connection.pool()).await?;
        Ok(row.as_ref().map(Self::parse_row))
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn save(&self, message: &MessageRecord) -> Result<(), BridgeError> {
        sqlx::query(UPSERT_MESSAGE)
            .bind(message.portal.chat_id.as_str())
            .bind(message.portal.receiver_str())
            .bind(message.id.as_str())
            .bind(message.part_id.as_str())
            .bind(message.mxid.as_str())
            .bind(message.fake_mxid)
            .bind(message.sender_id.as_str())
            .bind(message.sender_mxid.as_str())
            .bind(message.timestamp.timestamp_millis())
            .bind(message.thread_root.as_ref().map(|t| t.as_str()))
            .bind(message.reply_to.as_ref().map(|r| r.message_id.as_str()))
            .bind(
                message
                    .reply_to
                    .as_ref()
                    .and_then(|r| r.part_id.as_ref())
                    .map(|p| p.as_str()),
            )
            .bind(message.edit_count)
            .bind(message.metadata.to_string())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn get_first_part(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
    ) -> Result<Option<MessageRecord>, BridgeError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ? AND receiver = ? AND message_id = ?
             ORDER BY part_id LIMIT 1"
        );
        self.fetch_one(&query, portal, &[id.as_str()]).await
    }

    async fn get_last_part(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
    ) -> Result<Option<MessageRecord>, BridgeError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ? AND receiver = ? AND message_id = ?
             ORDER BY part_id DESC LIMIT 1"
        );
        self.fetch_one(&query, portal, &[id.as_str()]).await
    }

    async fn get_part(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
        part_id: &PartId,
    ) -> Result<Option<MessageRecord>, BridgeError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ? AND receiver = ? AND message_id = ? AND part_id = ?"
        );
        self.fetch_one(&query, portal, &[id.as_str(), part_id.as_str()])
            .await
    }

    async fn get_all_parts(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
    ) -> Result<Vec<MessageRecord>, BridgeError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ? AND receiver = ? AND message_id = ?
             ORDER BY part_id"
        );
        let rows = sqlx::query(&query)
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .bind(id.as_str())
            .fetch_all(self.connection.pool())
            .await?;
        Ok(rows.iter().map(Self::parse_row).collect())
    }

    async fn get_by_mxid(
        &self,
        portal: &PortalKey,
        mxid: &MatrixEventId,
    ) -> Result<Option<MessageRecord>, BridgeError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ? AND receiver = ? AND mxid = ?"
        );
        self.fetch_one(&query, portal, &[mxid.as_str()]).await
    }

    async fn get_last_in_thread(
        &self,
        portal: &PortalKey,
        thread_root: &NetworkMessageId,
    ) -> Result<Option<MessageRecord>, BridgeError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ? AND receiver = ? AND thread_root = ?
             ORDER BY timestamp DESC, part_id DESC LIMIT 1"
        );
        self.fetch_one(&query, portal, &[thread_root.as_str()]).await
    }

    async fn get_last_before(
        &self,
        portal: &PortalKey,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>, BridgeError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ? AND receiver = ? AND timestamp <= ?
             ORDER BY timestamp DESC, part_id DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .bind(timestamp.timestamp_millis())
            .fetch_optional(self.connection.pool())
            .await?;
        Ok(row.as_ref().map(Self::parse_row))
    }

    async fn get_last(&self, portal: &PortalKey) -> Result<Option<MessageRecord>, BridgeError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ? AND receiver = ?
             ORDER BY timestamp DESC, part_id DESC LIMIT 1"
        );
        self.fetch_one(&query, portal, &[]).await
    }

    async fn delete_part(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
        part_id: &PartId,
    ) -> Result<(), BridgeError> {
        sqlx::query(
            "DELETE FROM messages
             WHERE chat_id = ? AND receiver = ? AND message_id = ? AND part_id = ?",
        )
        .bind(portal.chat_id.as_str())
        .bind(portal.receiver_str())
        .bind(id.as_str())
        .bind(part_id.as_str())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn delete_all_parts(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
    ) -> Result<(), BridgeError> {
        sqlx::query("DELETE FROM messages WHERE chat_id = ? AND receiver = ? AND message_id = ?")
            .bind(portal.chat_id.as_str())
            .bind(portal.receiver_str())
            .bind(id.as_str())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn delete_all_in_portal(&self, portal: &PortalKey) -> Result<(), BridgeError> {
        sqlx::query("DELETE FROM messages WHERE chat_id = ? AND receiver = ?")
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

    async fn setup() -> (tempfile::TempDir, SqliteMessageStore, PortalKey) {
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
        (dir, SqliteMessageStore::new(conn), key)
    }

    fn message(portal: &PortalKey, id: &str, part: &str, ts_millis: i64) -> MessageRecord {
        MessageRecord {
            portal: portal.clone(),
            id: NetworkMessageId::from(id),
            part_id: PartId::from(part),
            mxid: MatrixEventId::from(format!("${id}-{part}").as_str()),
            fake_mxid: false,
            sender_id: NetworkUserId::from("remote-user"),
            sender_mxid: MatrixUserId::from("@ghost:hs"),
            timestamp: parse_timestamp(ts_millis),
            thread_root: None,
            reply_to: None,
            edit_count: 0,
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn part_ordering_selects_first_and_last() {
        let (_dir, store, key) = setup().await;
        store.save(&message(&key, "msg-1", "", 1000)).await.unwrap();
        store.save(&message(&key, "msg-1", "att-1", 1000)).await.unwrap();

        let first = store.get_first_part(&key, &NetworkMessageId::from("msg-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.part_id, PartId::first());

        let last = store.get_last_part(&key, &NetworkMessageId::from("msg-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.part_id, PartId::from("att-1"));

        let all = store.get_all_parts(&key, &NetworkMessageId::from("msg-1"))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn thread_queries_return_latest_by_timestamp() {
        let (_dir, store, key) = setup().await;
        let mut root = message(&key, "root", "", 1000);
        root.thread_root = None;
        store.save(&root).await.unwrap();
        for (id, ts) in [("t-1", 2000), ("t-2", 3000)] {
            let mut msg = message(&key, id, "", ts);
            msg.thread_root = Some(NetworkMessageId::from("root"));
            store.save(&msg).await.unwrap();
        }

        let last = store
            .get_last_in_thread(&key, &NetworkMessageId::from("root"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.id, NetworkMessageId::from("t-2"));

        let before = store
            .get_last_before(&key, parse_timestamp(2500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.id, NetworkMessageId::from("t-1"));
    }

    #[tokio::test]
    async fn reply_reference_roundtrips() {
        let (_dir, store, key) = setup().await;
        let mut msg = message(&key, "msg-2", "", 5000);
        msg.reply_to = Some(MessageRef::new(
            NetworkMessageId::from("msg-1"),
            Some(PartId::from("att-1")),
        ));
        store.save(&msg).await.unwrap();

        let loaded = store
            .get_part(&key, &NetworkMessageId::from("msg-2"), &PartId::first())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.reply_to, msg.reply_to);
    }

    #[tokio::test]
    async fn delete_all_parts_removes_message() {
        let (_dir, store, key) = setup().await;
        store.save(&message(&key, "msg-1", "", 1000)).await.unwrap();
        store.save(&message(&key, "msg-1", "att-1", 1000)).await.unwrap();
        store
            .delete_all_parts(&key, &NetworkMessageId::from("msg-1"))
            .await
            .unwrap();
        assert!(
            store
                .get_first_part(&key, &NetworkMessageId::from("msg-1"))
                .await
                .unwrap()
                .is_none()
        );
    }
}
