//! Persistence layer: entity records, store traits and SQLite
//! implementations.
//!
//! Store traits keep the portal testable against fakes while the `Sqlite*`
//! implementations back the real bridge. All operations are single
//! statements (or short statement sequences); no cross-handler transaction
//! is ever held.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::database::DatabaseConnection;
use crate::disappearing::DisappearingSetting;
use crate::error::BridgeError;
use crate::ids::{
    EmojiId, MatrixEventId, MatrixRoomId, MatrixUserId, MessageRef, NetworkChatId,
    NetworkMessageId, NetworkUserId, PartId, PortalKey, UserLoginId,
};

pub mod backfill_store;
pub mod message_store;
pub mod portal_store;
pub mod reaction_store;
pub mod user_portal_store;

pub use backfill_store::SqliteBackfillStore;
pub use message_store::SqliteMessageStore;
pub use portal_store::SqlitePortalStore;
pub use reaction_store::SqliteReactionStore;
pub use user_portal_store::SqliteUserPortalStore;

/// Kind of Matrix room a portal bridges into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoomType {
    Dm,
    GroupDm,
    #[default]
    Default,
    Space,
}

impl RoomType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dm => "dm",
            Self::GroupDm => "group_dm",
            Self::Default => "default",
            Self::Space => "space",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "dm" => Self::Dm,
            "group_dm" => Self::GroupDm,
            "space" => Self::Space,
            _ => Self::Default,
        }
    }
}

/// Persisted portal state.
#[derive(Debug, Clone, PartialEq)]
pub struct PortalRecord {
    pub key: PortalKey,
    pub room_id: Option<MatrixRoomId>,
    pub room_type: RoomType,
    pub name: Option<String>,
    pub name_set: bool,
    pub name_is_custom: bool,
    pub topic: Option<String>,
    pub topic_set: bool,
    pub avatar_id: Option<String>,
    pub avatar_hash: Option<String>,
    pub avatar_mxc: Option<String>,
    pub avatar_set: bool,
    pub parent_key: Option<PortalKey>,
    pub in_space: bool,
    pub other_user_id: Option<NetworkUserId>,
    pub relay_login_id: Option<UserLoginId>,
    pub disappear: DisappearingSetting,
    pub metadata: Value,
}

impl PortalRecord {
    /// Fresh placeholder row for a portal that has just been discovered.
    #[must_use]
    pub fn new(key: PortalKey) -> Self {
        Self {
            key,
            room_id: None,
            room_type: RoomType::default(),
            name: None,
            name_set: false,
            name_is_custom: false,
            topic: None,
            topic_set: false,
            avatar_id: None,
            avatar_hash: None,
            avatar_mxc: None,
            avatar_set: false,
            parent_key: None,
            in_space: false,
            other_user_id: None,
            relay_login_id: None,
            disappear: DisappearingSetting::disabled(),
            metadata: Value::Null,
        }
    }
}

/// One Matrix event produced from a remote message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub portal: PortalKey,
    pub id: NetworkMessageId,
    pub part_id: PartId,
    pub mxid: MatrixEventId,
    /// Set when the part is tracked but was never actually sent to Matrix.
    pub fake_mxid: bool,
    pub sender_id: NetworkUserId,
    pub sender_mxid: MatrixUserId,
    pub timestamp: DateTime<Utc>,
    pub thread_root: Option<NetworkMessageId>,
    pub reply_to: Option<MessageRef>,
    pub edit_count: i64,
    pub metadata: Value,
}

/// A single reaction on a message part.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionRecord {
    pub portal: PortalKey,
    pub message_id: NetworkMessageId,
    pub message_part_id: PartId,
    pub sender_id: NetworkUserId,
    pub emoji_id: EmojiId,
    pub emoji: String,
    pub mxid: MatrixEventId,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

/// Per-login portal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPortalRecord {
    pub login_id: UserLoginId,
    pub user_mxid: MatrixUserId,
    pub portal: PortalKey,
    pub in_portal: bool,
    pub in_space: bool,
    pub preference: i64,
    pub last_read: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PortalStore: Send + Sync {
    async fn get(&self, key: &PortalKey) -> Result<Option<PortalRecord>, BridgeError>;
    async fn get_by_room_id(
        &self,
        room_id: &MatrixRoomId,
    ) -> Result<Option<PortalRecord>, BridgeError>;
    /// Finds a portal for the chat regardless of receiver, preferring the
    /// shared one.
    async fn find_any_receiver(
        &self,
        chat_id: &NetworkChatId,
    ) -> Result<Option<PortalRecord>, BridgeError>;
    /// Inserts or updates the row.
    async fn save(&self, portal: &PortalRecord) -> Result<(), BridgeError>;
    async fn delete(&self, key: &PortalKey) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Inserts or updates the part row identified by `(portal, id, part)`.
    async fn save(&self, message: &MessageRecord) -> Result<(), BridgeError>;
    async fn get_first_part(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
    ) -> Result<Option<MessageRecord>, BridgeError>;
    async fn get_last_part(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
    ) -> Result<Option<MessageRecord>, BridgeError>;
    async fn get_part(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
        part_id: &PartId,
    ) -> Result<Option<MessageRecord>, BridgeError>;
    async fn get_all_parts(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
    ) -> Result<Vec<MessageRecord>, BridgeError>;
    async fn get_by_mxid(
        &self,
        portal: &PortalKey,
        mxid: &MatrixEventId,
    ) -> Result<Option<MessageRecord>, BridgeError>;
    /// Latest message in a thread by timestamp.
    async fn get_last_in_thread(
        &self,
        portal: &PortalKey,
        thread_root: &NetworkMessageId,
    ) -> Result<Option<MessageRecord>, BridgeError>;
    /// Latest message at or before the given timestamp.
    async fn get_last_before(
        &self,
        portal: &PortalKey,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>, BridgeError>;
    /// Latest message in the portal.
    async fn get_last(&self, portal: &PortalKey) -> Result<Option<MessageRecord>, BridgeError>;
    async fn delete_part(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
        part_id: &PartId,
    ) -> Result<(), BridgeError>;
    async fn delete_all_parts(
        &self,
        portal: &PortalKey,
        id: &NetworkMessageId,
    ) -> Result<(), BridgeError>;
    async fn delete_all_in_portal(&self, portal: &PortalKey) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait ReactionStore: Send + Sync {
    /// Inserts or updates the reaction identified by
    /// `(portal, message, part, sender, emoji id)`.
    async fn save(&self, reaction: &ReactionRecord) -> Result<(), BridgeError>;
    async fn get(
        &self,
        portal: &PortalKey,
        message_id: &NetworkMessageId,
        part_id: &PartId,
        sender_id: &NetworkUserId,
        emoji_id: &EmojiId,
    ) -> Result<Option<ReactionRecord>, BridgeError>;
    async fn get_by_mxid(
        &self,
        portal: &PortalKey,
        mxid: &MatrixEventId,
    ) -> Result<Option<ReactionRecord>, BridgeError>;
    /// All reactions by one sender on a message, oldest first.
    async fn get_by_sender(
        &self,
        portal: &PortalKey,
        message_id: &NetworkMessageId,
        sender_id: &NetworkUserId,
    ) -> Result<Vec<ReactionRecord>, BridgeError>;
    async fn get_all_by_message(
        &self,
        portal: &PortalKey,
        message_id: &NetworkMessageId,
    ) -> Result<Vec<ReactionRecord>, BridgeError>;
    async fn delete(&self, reaction: &ReactionRecord) -> Result<(), BridgeError>;
    async fn delete_all_in_portal(&self, portal: &PortalKey) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait UserPortalStore: Send + Sync {
    async fn get(
        &self,
        login_id: &UserLoginId,
        portal: &PortalKey,
    ) -> Result<Option<UserPortalRecord>, BridgeError>;
    /// Rows for every login in the portal, in preference order.
    async fn get_all_in_portal(
        &self,
        portal: &PortalKey,
    ) -> Result<Vec<UserPortalRecord>, BridgeError>;
    /// Rows of one Matrix user's logins in the portal, in preference order.
    async fn get_all_for_user(
        &self,
        user: &MatrixUserId,
        portal: &PortalKey,
    ) -> Result<Vec<UserPortalRecord>, BridgeError>;
    async fn save(&self, row: &UserPortalRecord) -> Result<(), BridgeError>;
    async fn set_last_read(
        &self,
        login_id: &UserLoginId,
        portal: &PortalKey,
        last_read: DateTime<Utc>,
    ) -> Result<(), BridgeError>;
    async fn delete_all_in_portal(&self, portal: &PortalKey) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait BackfillStore: Send + Sync {
    /// Makes sure a forward-backfill task row exists for the portal/login
    /// pair. Idempotent.
    async fn ensure_task(
        &self,
        portal: &PortalKey,
        login_id: &UserLoginId,
    ) -> Result<(), BridgeError>;
}

/// Bundle of all stores used by the portal core.
#[derive(Clone)]
pub struct Database {
    pub portals: Arc<dyn PortalStore>,
    pub messages: Arc<dyn MessageStore>,
    pub reactions: Arc<dyn ReactionStore>,
    pub user_portals: Arc<dyn UserPortalStore>,
    pub backfill: Arc<dyn BackfillStore>,
}

impl Database {
    /// Wires every store to the same SQLite pool.
    #[must_use]
    pub fn sqlite(connection: DatabaseConnection) -> Self {
        Self {
            portals: Arc::new(SqlitePortalStore::new(connection.clone())),
            messages: Arc::new(SqliteMessageStore::new(connection.clone())),
            reactions: Arc::new(SqliteReactionStore::new(connection.clone())),
            user_portals: Arc::new(SqliteUserPortalStore::new(connection.clone())),
            backfill: Arc::new(SqliteBackfillStore::new(connection)),
        }
    }
}

pub(crate) fn parse_receiver(receiver: &str) -> Option<UserLoginId> {
    if receiver.is_empty() {
        None
    } else {
        Some(UserLoginId::from(receiver))
    }
}

pub(crate) fn parse_timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

pub(crate) fn parse_metadata(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}
