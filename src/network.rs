//! Network connector contract: what the portal expects from the foreign
//! side of the bridge.
//!
//! A connector supplies a [`NetworkClient`] per login. The client must
//! handle plain messages; everything else is an optional capability exposed
//! through an accessor returning `Option<&dyn …Handler>`. The portal probes
//! the accessor and rejects the event with a typed error when the
//! capability is absent, before any remote call is made.
//!
//! Remote events arriving from the network implement [`RemoteEvent`] plus
//! whichever facet traits apply; the dispatcher probes each facet the same
//! way.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::disappearing::DisappearingSetting;
use crate::error::BridgeError;
use crate::ids::{
    EmojiId, MatrixUserId, MessageRef, NetworkChatId, NetworkMessageId, NetworkUserId, PartId,
    PortalKey, TransactionId, UserLoginId,
};
use crate::matrix::{
    Intent, MatrixEvent, Membership, MessageContent, OrigSender, PowerLevelChanges, TypingType,
};
use crate::storage::{MessageRecord, PortalRecord, RoomType};

/// Who sent a remote event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSender {
    pub sender_id: NetworkUserId,
    /// Login the event came from, when the network tells us.
    pub sender_login: Option<UserLoginId>,
    /// The event was sent by the receiving login itself (own echo, other
    /// device, etc).
    pub is_from_me: bool,
    /// In DM portals, rewrite the sender to the DM peer if it disagrees.
    pub force_dm_user: bool,
}

impl EventSender {
    #[must_use]
    pub fn remote(sender_id: NetworkUserId) -> Self {
        Self {
            sender_id,
            sender_login: None,
            is_from_me: false,
            force_dm_user: false,
        }
    }
}

/// Per-room feature flags reported by the connector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomCapabilities {
    pub threads: bool,
    pub replies: bool,
    pub edits: bool,
    /// Oldest message age that may still be edited.
    pub edit_max_age: Option<Duration>,
    /// How many times a single message may be edited.
    pub edit_max_count: Option<u32>,
    pub reactions: bool,
    /// Rolling cap on reactions per user per message; 0 = unlimited.
    pub max_reactions_per_user: u32,
    pub captions: bool,
    pub location_messages: bool,
}

/// Ghost profile information supplied by the connector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub name: Option<String>,
    pub avatar_mxc: Option<String>,
    pub is_bot: Option<bool>,
}

/// Chat avatar; the connector resolves the remote image to an mxc URI
/// before handing it over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Avatar {
    pub id: String,
    pub mxc: Option<String>,
    pub hash: Option<String>,
}

/// Link from a portal to its parent space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub chat_id: NetworkChatId,
    /// Create the parent portal row when it does not exist yet.
    pub create: bool,
}

/// One member in a snapshot or diff.
#[derive(Debug)]
pub struct ChatMember {
    pub sender: EventSender,
    pub membership: Membership,
    /// When set and it disagrees with the current Matrix state, the
    /// transition is skipped.
    pub prev_membership: Option<Membership>,
    pub power_level: Option<i64>,
    pub user_info: Option<UserInfo>,
}

/// Member list snapshot (`is_full`) or diff.
#[derive(Debug, Default)]
pub struct ChatMemberList {
    pub is_full: bool,
    /// Ask every login in the portal whether an unrecognized member is them.
    pub check_all_logins: bool,
    pub total_member_count: Option<usize>,
    pub other_user_id: Option<NetworkUserId>,
    pub members: Vec<ChatMember>,
    pub power_levels: Option<PowerLevelChanges>,
}

/// Chat metadata, used both as a full snapshot and as a partial diff:
/// `None` fields are left untouched.
#[derive(Debug, Default)]
pub struct ChatInfo {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub avatar: Option<Avatar>,
    pub members: Option<ChatMemberList>,
    pub room_type: Option<RoomType>,
    pub parent: Option<ParentRef>,
    /// Raw `m.room.join_rules` content.
    pub join_rule: Option<Value>,
    pub disappear: Option<DisappearingSetting>,
}

/// One Matrix event to be produced from a remote message.
#[derive(Debug)]
pub struct ConvertedPart {
    pub id: PartId,
    pub event_type: String,
    pub content: MessageContent,
    /// Extra raw fields merged into the serialized content.
    pub extra: Option<Value>,
    /// Track the part in the database without sending it to Matrix.
    pub dont_bridge: bool,
    pub metadata: Value,
}

impl ConvertedPart {
    #[must_use]
    pub fn new(id: PartId, event_type: impl Into<String>, content: MessageContent) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            content,
            extra: None,
            dont_bridge: false,
            metadata: Value::Null,
        }
    }
}

/// Result of converting a remote message.
#[derive(Debug)]
pub struct ConvertedMessage {
    pub parts: Vec<ConvertedPart>,
    pub thread_root: Option<NetworkMessageId>,
    pub reply_to: Option<MessageRef>,
    pub disappear: Option<DisappearingSetting>,
}

impl ConvertedMessage {
    #[must_use]
    pub fn new(parts: Vec<ConvertedPart>) -> Self {
        Self {
            parts,
            thread_root: None,
            reply_to: None,
            disappear: None,
        }
    }
}

/// An existing part with its replacement content.
#[derive(Debug)]
pub struct EditedPart {
    /// Updated row; the portal bumps the edit count and persists it.
    pub record: MessageRecord,
    pub event_type: String,
    pub content: MessageContent,
    pub extra: Option<Value>,
}

/// Result of converting a remote edit.
#[derive(Debug, Default)]
pub struct ConvertedEdit {
    pub modified: Vec<EditedPart>,
    pub deleted: Vec<MessageRecord>,
    pub added: Vec<ConvertedPart>,
}

/// Finalizer invoked when the remote echo for a pending send arrives.
/// Returns whether the finalized row should be persisted.
pub type EchoHandler =
    Box<dyn FnOnce(&dyn RemoteEvent, &mut MessageRecord) -> Result<bool, BridgeError> + Send>;

/// Deferred confirmation of an outgoing message.
pub struct PendingMatrixMessage {
    pub transaction_id: TransactionId,
    pub on_echo: Option<EchoHandler>,
}

impl std::fmt::Debug for PendingMatrixMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMatrixMessage")
            .field("transaction_id", &self.transaction_id)
            .field("on_echo", &self.on_echo.is_some())
            .finish()
    }
}

/// Outcome of sending a Matrix message to the network.
#[derive(Debug, Default)]
pub struct MatrixMessageResponse {
    /// Draft row; the portal fills in unset fields before persisting.
    pub db_message: Option<MessageRecord>,
    /// When set, persistence and the status report wait for the echo.
    pub pending: Option<PendingMatrixMessage>,
}

/// A Matrix message handed to the connector.
pub struct MatrixMessageRequest<'a> {
    pub portal: &'a PortalRecord,
    pub event: &'a MatrixEvent,
    pub event_type: &'a str,
    pub content: &'a MessageContent,
    /// Present when the message is relayed for a login-less user.
    pub orig_sender: Option<&'a OrigSender>,
    pub thread_root: Option<&'a MessageRecord>,
    pub reply_to: Option<&'a MessageRecord>,
}

/// A Matrix edit handed to the connector.
pub struct MatrixEditRequest<'a> {
    pub portal: &'a PortalRecord,
    pub event: &'a MatrixEvent,
    pub content: &'a MessageContent,
    pub orig_sender: Option<&'a OrigSender>,
}

/// A Matrix reaction handed to the connector.
pub struct MatrixReactionRequest<'a> {
    pub portal: &'a PortalRecord,
    pub event: &'a MatrixEvent,
    pub target: &'a MessageRecord,
    pub key: &'a str,
}

/// Normalized reaction identity produced by
/// [`ReactionHandler::pre_handle_matrix_reaction`].
#[derive(Debug, Clone)]
pub struct PreHandledReaction {
    pub sender_id: NetworkUserId,
    pub emoji_id: EmojiId,
    pub emoji: String,
    /// Rolling cap for this user on this message; 0 = unlimited.
    pub max_reactions: u32,
}

/// A Matrix redaction of a bridged message.
pub struct MatrixRedactionRequest<'a> {
    pub portal: &'a PortalRecord,
    pub event: &'a MatrixEvent,
    pub reason: Option<&'a str>,
}

/// A Matrix read receipt handed to the connector.
pub struct MatrixReadReceiptRequest<'a> {
    pub portal: &'a PortalRecord,
    pub user: &'a MatrixUserId,
    pub event_id: &'a crate::ids::MatrixEventId,
    pub receipt_ts: DateTime<Utc>,
    /// The message the receipt lands on, when it is a bridged one.
    pub target: Option<&'a MessageRecord>,
}

/// A Matrix membership change handed to the connector.
pub struct MatrixMembershipRequest<'a> {
    pub portal: &'a PortalRecord,
    pub event: &'a MatrixEvent,
    pub target: &'a MatrixUserId,
    pub prev: Membership,
    pub next: Membership,
    /// The acting user changed their own membership.
    pub is_self: bool,
}

#[async_trait]
pub trait EditHandler: Send + Sync {
    /// Sends the edit to the network and updates `target` in place; the
    /// portal persists the row afterwards.
    async fn handle_matrix_edit(
        &self,
        req: MatrixEditRequest<'_>,
        target: &mut MessageRecord,
    ) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait ReactionHandler: Send + Sync {
    /// Resolves the reaction identity without side effects.
    async fn pre_handle_matrix_reaction(
        &self,
        req: &MatrixReactionRequest<'_>,
    ) -> Result<PreHandledReaction, BridgeError>;

    /// Sends the reaction to the network, returning connector metadata for
    /// the stored row.
    async fn handle_matrix_reaction(
        &self,
        req: &MatrixReactionRequest<'_>,
        pre: &PreHandledReaction,
    ) -> Result<Value, BridgeError>;

    /// Removes a previously bridged reaction.
    async fn handle_matrix_reaction_remove(
        &self,
        req: &MatrixRedactionRequest<'_>,
        target: &crate::storage::ReactionRecord,
    ) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait RedactionHandler: Send + Sync {
    /// Removes a message on the network.
    async fn handle_matrix_message_remove(
        &self,
        req: &MatrixRedactionRequest<'_>,
        target: &MessageRecord,
    ) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait ReadReceiptHandler: Send + Sync {
    async fn handle_matrix_read_receipt(
        &self,
        req: &MatrixReadReceiptRequest<'_>,
    ) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait TypingHandler: Send + Sync {
    async fn handle_matrix_typing(
        &self,
        portal: &PortalRecord,
        typing: bool,
    ) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait RoomNameHandler: Send + Sync {
    /// Returns whether the name actually changed on the network.
    async fn handle_matrix_room_name(
        &self,
        portal: &PortalRecord,
        name: &str,
    ) -> Result<bool, BridgeError>;
}

#[async_trait]
pub trait RoomTopicHandler: Send + Sync {
    async fn handle_matrix_room_topic(
        &self,
        portal: &PortalRecord,
        topic: &str,
    ) -> Result<bool, BridgeError>;
}

#[async_trait]
pub trait RoomAvatarHandler: Send + Sync {
    async fn handle_matrix_room_avatar(
        &self,
        portal: &PortalRecord,
        avatar_mxc: &str,
    ) -> Result<bool, BridgeError>;
}

#[async_trait]
pub trait MarkedUnreadHandler: Send + Sync {
    async fn handle_matrix_marked_unread(
        &self,
        portal: &PortalRecord,
        unread: bool,
    ) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait RoomTagHandler: Send + Sync {
    async fn handle_matrix_room_tag(
        &self,
        portal: &PortalRecord,
        tag: Option<&crate::matrix::RoomTag>,
    ) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait MuteHandler: Send + Sync {
    async fn handle_matrix_mute(
        &self,
        portal: &PortalRecord,
        muted_until: Option<DateTime<Utc>>,
    ) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait MembershipHandler: Send + Sync {
    async fn handle_matrix_membership(
        &self,
        req: &MatrixMembershipRequest<'_>,
    ) -> Result<(), BridgeError>;
}

/// A login's connection to the remote network.
///
/// Message handling is mandatory; every other operation is an optional
/// capability probed through its accessor.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    fn is_logged_in(&self) -> bool;

    /// Whether the given remote user id is the user behind this client.
    async fn is_this_user(&self, user: &NetworkUserId) -> bool;

    async fn room_capabilities(&self, portal: &PortalKey) -> RoomCapabilities;

    async fn get_chat_info(&self, portal: &PortalKey) -> Result<ChatInfo, BridgeError>;

    /// Sends a Matrix message to the network.
    async fn handle_matrix_message(
        &self,
        req: MatrixMessageRequest<'_>,
    ) -> Result<MatrixMessageResponse, BridgeError>;

    fn edit_handler(&self) -> Option<&dyn EditHandler> {
        None
    }
    fn reaction_handler(&self) -> Option<&dyn ReactionHandler> {
        None
    }
    fn redaction_handler(&self) -> Option<&dyn RedactionHandler> {
        None
    }
    fn read_receipt_handler(&self) -> Option<&dyn ReadReceiptHandler> {
        None
    }
    fn typing_handler(&self) -> Option<&dyn TypingHandler> {
        None
    }
    fn room_name_handler(&self) -> Option<&dyn RoomNameHandler> {
        None
    }
    fn room_topic_handler(&self) -> Option<&dyn RoomTopicHandler> {
        None
    }
    fn room_avatar_handler(&self) -> Option<&dyn RoomAvatarHandler> {
        None
    }
    fn marked_unread_handler(&self) -> Option<&dyn MarkedUnreadHandler> {
        None
    }
    fn room_tag_handler(&self) -> Option<&dyn RoomTagHandler> {
        None
    }
    fn mute_handler(&self) -> Option<&dyn MuteHandler> {
        None
    }
    fn membership_handler(&self) -> Option<&dyn MembershipHandler> {
        None
    }
}

/// Kinds of events the remote side can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteEventType {
    Message,
    Edit,
    Reaction,
    ReactionSync,
    ReactionRemove,
    MessageRemove,
    ReadReceipt,
    MarkUnread,
    DeliveryReceipt,
    Typing,
    ChatInfoChange,
    ChatResync,
    ChatDelete,
}

impl std::fmt::Display for RemoteEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Message => "message",
            Self::Edit => "edit",
            Self::Reaction => "reaction",
            Self::ReactionSync => "reaction sync",
            Self::ReactionRemove => "reaction remove",
            Self::MessageRemove => "message remove",
            Self::ReadReceipt => "read receipt",
            Self::MarkUnread => "mark unread",
            Self::DeliveryReceipt => "delivery receipt",
            Self::Typing => "typing",
            Self::ChatInfoChange => "chat info change",
            Self::ChatResync => "chat resync",
            Self::ChatDelete => "chat delete",
        };
        f.write_str(name)
    }
}

/// An event delivered by the remote network.
///
/// `event_type()` and the base accessors are mandatory; everything else is
/// a facet probed by the dispatcher.
pub trait RemoteEvent: Send + Sync {
    fn event_type(&self) -> RemoteEventType;
    fn portal_key(&self) -> PortalKey;
    fn sender(&self) -> EventSender;

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        None
    }
    fn transaction_id(&self) -> Option<TransactionId> {
        None
    }
    /// Whether a missing portal room should be created for this event.
    fn should_create_portal(&self) -> bool {
        false
    }
    /// Chat metadata bundled with the event (resyncs, portal creation).
    fn get_chat_info(&self) -> Option<ChatInfo> {
        None
    }
    /// Structured fields appended to this event's log context.
    fn log_context(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn as_pre_handler(&self) -> Option<&dyn RemotePreHandler> {
        None
    }
    fn as_message(&self) -> Option<&dyn RemoteMessage> {
        None
    }
    fn as_upsert(&self) -> Option<&dyn RemoteUpsert> {
        None
    }
    fn as_edit(&self) -> Option<&dyn RemoteEdit> {
        None
    }
    fn as_reaction(&self) -> Option<&dyn RemoteReaction> {
        None
    }
    fn as_reaction_sync(&self) -> Option<&dyn RemoteReactionSync> {
        None
    }
    fn as_reaction_remove(&self) -> Option<&dyn RemoteReactionRemove> {
        None
    }
    fn as_message_remove(&self) -> Option<&dyn RemoteMessageRemove> {
        None
    }
    fn as_read_receipt(&self) -> Option<&dyn RemoteReadReceipt> {
        None
    }
    fn as_mark_unread(&self) -> Option<&dyn RemoteMarkUnread> {
        None
    }
    fn as_delivery_receipt(&self) -> Option<&dyn RemoteDeliveryReceipt> {
        None
    }
    fn as_typing(&self) -> Option<&dyn RemoteTyping> {
        None
    }
    fn as_chat_info_change(&self) -> Option<&dyn RemoteChatInfoChange> {
        None
    }
    fn as_resync(&self) -> Option<&dyn RemoteResync> {
        None
    }
}

/// Hook executed before the regular dispatch of any remote event.
#[async_trait]
pub trait RemotePreHandler: Send + Sync {
    async fn pre_handle(&self, portal: &PortalRecord);
}

#[async_trait]
pub trait RemoteMessage: Send + Sync {
    fn id(&self) -> NetworkMessageId;

    /// Converts the remote payload into Matrix events. Returning
    /// [`BridgeError::IgnoringRemoteEvent`] drops the event silently.
    async fn convert(
        &self,
        portal: &PortalRecord,
        intent: &Intent,
    ) -> Result<ConvertedMessage, BridgeError>;
}

/// Result of [`RemoteUpsert::handle_existing`].
pub struct UpsertResult {
    /// Updated rows to persist.
    pub save_parts: Vec<MessageRecord>,
    /// Derived events fed back into the dispatcher.
    pub sub_events: Vec<Box<dyn RemoteEvent>>,
    /// Whether to continue with the normal message flow afterwards.
    pub continue_message_handling: bool,
}

impl Default for UpsertResult {
    fn default() -> Self {
        Self {
            save_parts: Vec::new(),
            sub_events: Vec::new(),
            continue_message_handling: false,
        }
    }
}

impl std::fmt::Debug for UpsertResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpsertResult")
            .field("save_parts", &self.save_parts.len())
            .field("sub_events", &self.sub_events.len())
            .field("continue_message_handling", &self.continue_message_handling)
            .finish()
    }
}

/// Message facet for events that may update an already-bridged message.
#[async_trait]
pub trait RemoteUpsert: Send + Sync {
    async fn handle_existing(
        &self,
        portal: &PortalRecord,
        existing: &[MessageRecord],
    ) -> Result<UpsertResult, BridgeError>;
}

#[async_trait]
pub trait RemoteEdit: Send + Sync {
    fn target_message(&self) -> NetworkMessageId;

    /// Target parts bundled with the event; when absent, the portal looks
    /// them up by id.
    fn target_parts(&self) -> Option<Vec<MessageRecord>> {
        None
    }

    async fn convert_edit(
        &self,
        portal: &PortalRecord,
        intent: &Intent,
        existing: &[MessageRecord],
    ) -> Result<ConvertedEdit, BridgeError>;
}

pub trait RemoteReaction: Send + Sync {
    fn target_message(&self) -> MessageRef;
    fn emoji_id(&self) -> EmojiId;
    fn emoji(&self) -> String;
    fn reaction_metadata(&self) -> Value {
        Value::Null
    }
}

pub trait RemoteReactionRemove: Send + Sync {
    fn target_message(&self) -> MessageRef;
    fn emoji_id(&self) -> EmojiId;
}

/// A single reaction inside a sync snapshot.
#[derive(Debug, Clone)]
pub struct SyncedReaction {
    pub emoji_id: EmojiId,
    pub emoji: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: Value,
}

/// Per-user slice of a reaction sync.
#[derive(Debug, Clone, Default)]
pub struct ReactionSyncUser {
    pub reactions: Vec<SyncedReaction>,
    /// The snapshot contains every reaction of this user; anything else is
    /// removed.
    pub has_all_reactions: bool,
    /// When not exhaustive, evict oldest existing reactions beyond this
    /// count (0 = unlimited).
    pub max_count: u32,
}

/// Full reaction state snapshot for one message.
#[derive(Debug, Clone, Default)]
pub struct ReactionSyncData {
    pub users: HashMap<NetworkUserId, ReactionSyncUser>,
    /// The snapshot covers every user; reactions of absent users are
    /// removed.
    pub has_all_users: bool,
}

pub trait RemoteReactionSync: Send + Sync {
    fn target_message(&self) -> NetworkMessageId;
    fn reactions(&self) -> ReactionSyncData;
}

pub trait RemoteMessageRemove: Send + Sync {
    fn target_message(&self) -> NetworkMessageId;
}

pub trait RemoteReadReceipt: Send + Sync {
    /// Explicit single target of the receipt.
    fn last_target(&self) -> Option<NetworkMessageId> {
        None
    }
    /// Multiple candidate targets; the latest by timestamp wins.
    fn targets(&self) -> Vec<NetworkMessageId> {
        Vec::new()
    }
    /// Fallback: everything at or before this timestamp is read.
    fn read_up_to(&self) -> Option<DateTime<Utc>> {
        None
    }
}

pub trait RemoteMarkUnread: Send + Sync {
    fn unread(&self) -> bool;
}

pub trait RemoteDeliveryReceipt: Send + Sync {
    fn target_messages(&self) -> Vec<NetworkMessageId>;
}

pub trait RemoteTyping: Send + Sync {
    fn typing_type(&self) -> TypingType {
        TypingType::Text
    }
    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }
}

pub trait RemoteChatInfoChange: Send + Sync {
    fn chat_info_change(&self) -> ChatInfo;
}

pub trait RemoteResync: Send + Sync {
    /// Whether forward backfill should run, given the latest bridged
    /// message.
    fn check_needs_backfill(&self, latest_bridged: Option<&MessageRecord>) -> bool {
        let _ = latest_bridged;
        false
    }
}
