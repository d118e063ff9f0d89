//! SQLite implementation of the forward-backfill task queue.

use async_trait::async_trait;
use chrono::Utc;

use crate::database::DatabaseConnection;
use crate::error::BridgeError;
use crate::ids::{PortalKey, UserLoginId};
use crate::storage::BackfillStore;

pub struct SqliteBackfillStore {
    connection: DatabaseConnection,
}

impl SqliteBackfillStore {
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl BackfillStore for SqliteBackfillStore {
    async fn ensure_task(
        &self,
        portal: &PortalKey,
        login_id: &UserLoginId,
    ) -> Result<(), BridgeError> {
        sqlx::query(
            "INSERT OR IGNORE INTO backfill_tasks (chat_id, receiver, login_id, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(portal.chat_id.as_str())
        .bind(portal.receiver_str())
        .bind(login_id.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }
}
