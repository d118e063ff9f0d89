//! Shared test harness: in-memory Matrix façade, mock network connector
//! and remote-event builders, wired to a real SQLite database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use bridge_core::bridge::{BridgeContext, Ghost, GhostDirectory, UserLogin, UserLoginRegistry};
use bridge_core::config::BridgeConfig;
use bridge_core::database::{DatabaseConfig, DatabaseConnection};
use bridge_core::disappearing::{
    DisappearingMessage, DisappearingScheduler, DisappearingSetting,
};
use bridge_core::error::{BridgeError, MessageStatus};
use bridge_core::ids::{
    EmojiId, MatrixEventId, MatrixRoomId, MatrixUserId, MessageRef, NetworkChatId,
    NetworkMessageId, NetworkUserId, PartId, PortalKey, TransactionId, UserLoginId,
};
use bridge_core::matrix::{
    MatrixApi, MatrixEvent, MatrixEventKind, MemberInfo, Membership, MessageContent,
    PowerLevelContent, RoomCreateRequest, RoomTag, TypingType, event_type,
};
use bridge_core::network::{
    ChatInfo, ChatMember, ChatMemberList, ConvertedMessage, ConvertedPart, EditHandler,
    EventSender, MarkedUnreadHandler, MatrixEditRequest, MatrixMembershipRequest,
    MatrixMessageRequest, MatrixMessageResponse, MatrixReactionRequest, MatrixReadReceiptRequest,
    MatrixRedactionRequest, MembershipHandler, MuteHandler, NetworkClient, PendingMatrixMessage,
    PreHandledReaction, ReactionHandler, ReactionSyncData, RedactionHandler, RemoteEvent,
    RemoteEventType, RemoteMessage, RemoteMessageRemove, RemoteReaction, RemoteReactionRemove,
    RemoteReactionSync, RemoteReadReceipt, RemoteTyping, RoomAvatarHandler, RoomCapabilities,
    RoomNameHandler, RoomTagHandler, RoomTopicHandler, TypingHandler, UserInfo,
};
use bridge_core::portal::{Portal, PortalRegistry};
use bridge_core::storage::{
    Database, MessageRecord, PortalRecord, ReactionRecord, UserPortalRecord,
};

pub const BOT_MXID: &str = "@bot:hs";
pub const USER_MXID: &str = "@alice:hs";
pub const LOGIN_ID: &str = "login-alice";
pub const REMOTE_SELF: &str = "alice-remote";
pub const ROOM_ID: &str = "!room:hs";

// ---------------------------------------------------------------------------
// Matrix façade mock

#[derive(Debug, Clone)]
pub enum MatrixCall {
    CreateRoom {
        invites: Vec<String>,
        name: Option<String>,
    },
    SendMessage {
        sender: String,
        room: String,
        event_type: String,
        content: Value,
        event_id: String,
    },
    SendState {
        sender: String,
        room: String,
        event_type: String,
        state_key: String,
        content: Value,
    },
    Redact {
        sender: String,
        room: String,
        target: String,
    },
    Status {
        room: String,
        event_id: String,
        status: MessageStatus,
    },
    MarkRead {
        sender: String,
        room: String,
        event_id: String,
    },
    MarkTyping {
        sender: String,
        timeout_secs: u64,
    },
    SetMembership {
        actor: String,
        target: String,
        membership: Membership,
    },
    EnsureJoined {
        user: String,
    },
    MarkAsDm,
    MarkUnread {
        user: String,
        unread: bool,
    },
    DeleteRoom {
        room: String,
    },
}

#[derive(Default)]
pub struct MockMatrix {
    calls: Mutex<Vec<MatrixCall>>,
    counter: AtomicU64,
    pub auto_join_invites: AtomicBool,
    pub members: Mutex<HashMap<MatrixRoomId, HashMap<MatrixUserId, Membership>>>,
    pub power_levels: Mutex<HashMap<MatrixRoomId, PowerLevelContent>>,
    pub displaynames: Mutex<HashMap<MatrixUserId, String>>,
    pub confusable: Mutex<Option<bool>>,
}

impl MockMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("${prefix}-{n}")
    }

    fn record(&self, call: MatrixCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<MatrixCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent_messages(&self) -> Vec<(String, String, Value, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MatrixCall::SendMessage {
                    sender,
                    event_type,
                    content,
                    event_id,
                    ..
                } => Some((sender, event_type, content, event_id)),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<(String, MessageStatus)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MatrixCall::Status {
                    event_id, status, ..
                } => Some((event_id, status)),
                _ => None,
            })
            .collect()
    }

    pub fn redactions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MatrixCall::Redact { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn create_room_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MatrixCall::CreateRoom { .. }))
            .count()
    }
}

#[async_trait]
impl MatrixApi for MockMatrix {
    fn bot_user_id(&self) -> MatrixUserId {
        MatrixUserId::from(BOT_MXID)
    }

    fn server_name(&self) -> &str {
        "hs"
    }

    fn server_supports_auto_join_invites(&self) -> bool {
        self.auto_join_invites.load(Ordering::SeqCst)
    }

    async fn create_room(&self, req: &RoomCreateRequest) -> Result<MatrixRoomId, BridgeError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let room_id = MatrixRoomId::from(format!("!created-{n}:hs").as_str());
        self.record(MatrixCall::CreateRoom {
            invites: req.invite.iter().map(ToString::to_string).collect(),
            name: req.name.clone(),
        });
        let mut members = HashMap::new();
        members.insert(self.bot_user_id(), Membership::Join);
        for invitee in &req.invite {
            members.insert(invitee.clone(), Membership::Invite);
        }
        self.members.lock().unwrap().insert(room_id.clone(), members);
        self.power_levels
            .lock()
            .unwrap()
            .insert(room_id.clone(), req.power_levels.clone());
        Ok(room_id)
    }

    async fn delete_room(&self, room: &MatrixRoomId) -> Result<(), BridgeError> {
        self.record(MatrixCall::DeleteRoom {
            room: room.to_string(),
        });
        self.members.lock().unwrap().remove(room);
        Ok(())
    }

    async fn send_message(
        &self,
        sender: &MatrixUserId,
        room: &MatrixRoomId,
        event_type: &str,
        content: &Value,
        _timestamp: Option<DateTime<Utc>>,
    ) -> Result<MatrixEventId, BridgeError> {
        let event_id = self.next_id("evt");
        self.record(MatrixCall::SendMessage {
            sender: sender.to_string(),
            room: room.to_string(),
            event_type: event_type.to_owned(),
            content: content.clone(),
            event_id: event_id.clone(),
        });
        Ok(MatrixEventId::from(event_id.as_str()))
    }

    async fn send_state(
        &self,
        sender: &MatrixUserId,
        room: &MatrixRoomId,
        event_type: &str,
        state_key: &str,
        content: &Value,
        _timestamp: Option<DateTime<Utc>>,
    ) -> Result<MatrixEventId, BridgeError> {
        let event_id = self.next_id("state");
        self.record(MatrixCall::SendState {
            sender: sender.to_string(),
            room: room.to_string(),
            event_type: event_type.to_owned(),
            state_key: state_key.to_owned(),
            content: content.clone(),
        });
        Ok(MatrixEventId::from(event_id.as_str()))
    }

    async fn redact(
        &self,
        sender: &MatrixUserId,
        room: &MatrixRoomId,
        target: &MatrixEventId,
        _reason: Option<&str>,
    ) -> Result<MatrixEventId, BridgeError> {
        let event_id = self.next_id("redact");
        self.record(MatrixCall::Redact {
            sender: sender.to_string(),
            room: room.to_string(),
            target: target.to_string(),
        });
        Ok(MatrixEventId::from(event_id.as_str()))
    }

    async fn mark_read(
        &self,
        sender: &MatrixUserId,
        room: &MatrixRoomId,
        event_id: &MatrixEventId,
        _timestamp: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        self.record(MatrixCall::MarkRead {
            sender: sender.to_string(),
            room: room.to_string(),
            event_id: event_id.to_string(),
        });
        Ok(())
    }

    async fn mark_typing(
        &self,
        sender: &MatrixUserId,
        _room: &MatrixRoomId,
        _typing_type: TypingType,
        timeout: Duration,
    ) -> Result<(), BridgeError> {
        self.record(MatrixCall::MarkTyping {
            sender: sender.to_string(),
            timeout_secs: timeout.as_secs(),
        });
        Ok(())
    }

    async fn mark_as_dm(
        &self,
        _user: &MatrixUserId,
        _room: &MatrixRoomId,
        _peer: &MatrixUserId,
    ) -> Result<(), BridgeError> {
        self.record(MatrixCall::MarkAsDm);
        Ok(())
    }

    async fn mark_unread(
        &self,
        user: &MatrixUserId,
        _room: &MatrixRoomId,
        unread: bool,
    ) -> Result<(), BridgeError> {
        self.record(MatrixCall::MarkUnread {
            user: user.to_string(),
            unread,
        });
        Ok(())
    }

    async fn mute_room(
        &self,
        _user: &MatrixUserId,
        _room: &MatrixRoomId,
        _until: Option<DateTime<Utc>>,
    ) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn tag_room(
        &self,
        _user: &MatrixUserId,
        _room: &MatrixRoomId,
        _tag: Option<&RoomTag>,
    ) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn get_member_info(
        &self,
        room: &MatrixRoomId,
        user: &MatrixUserId,
    ) -> Result<Option<MemberInfo>, BridgeError> {
        let membership = self
            .members
            .lock()
            .unwrap()
            .get(room)
            .and_then(|m| m.get(user))
            .copied();
        Ok(membership.map(|membership| MemberInfo {
            membership,
            displayname: self.displaynames.lock().unwrap().get(user).cloned(),
            avatar_url: None,
        }))
    }

    async fn get_members(
        &self,
        room: &MatrixRoomId,
    ) -> Result<HashMap<MatrixUserId, Membership>, BridgeError> {
        Ok(self
            .members
            .lock()
            .unwrap()
            .get(room)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_power_levels(
        &self,
        room: &MatrixRoomId,
    ) -> Result<PowerLevelContent, BridgeError> {
        Ok(self
            .power_levels
            .lock()
            .unwrap()
            .get(room)
            .cloned()
            .unwrap_or_default())
    }

    async fn ensure_joined(
        &self,
        room: &MatrixRoomId,
        user: &MatrixUserId,
    ) -> Result<(), BridgeError> {
        self.record(MatrixCall::EnsureJoined {
            user: user.to_string(),
        });
        self.members
            .lock()
            .unwrap()
            .entry(room.clone())
            .or_default()
            .insert(user.clone(), Membership::Join);
        Ok(())
    }

    async fn set_membership(
        &self,
        actor: &MatrixUserId,
        room: &MatrixRoomId,
        target: &MatrixUserId,
        membership: Membership,
        _reason: Option<&str>,
    ) -> Result<(), BridgeError> {
        self.record(MatrixCall::SetMembership {
            actor: actor.to_string(),
            target: target.to_string(),
            membership,
        });
        self.members
            .lock()
            .unwrap()
            .entry(room.clone())
            .or_default()
            .insert(target.clone(), membership);
        Ok(())
    }

    async fn send_message_status(
        &self,
        room: &MatrixRoomId,
        event_id: &MatrixEventId,
        status: &MessageStatus,
    ) {
        self.record(MatrixCall::Status {
            room: room.to_string(),
            event_id: event_id.to_string(),
            status: status.clone(),
        });
    }

    fn generate_deterministic_event_id(
        &self,
        _room: &MatrixRoomId,
        portal: &PortalKey,
        message: &NetworkMessageId,
        part: &PartId,
    ) -> MatrixEventId {
        MatrixEventId::from(format!("$det-{portal}-{message}-{part}").as_str())
    }

    fn parse_ghost_user_id(&self, user: &MatrixUserId) -> Option<NetworkUserId> {
        user.strip_prefix("@net_")
            .and_then(|rest| rest.strip_suffix(":hs"))
            .map(NetworkUserId::from)
    }

    async fn is_confusable_name(
        &self,
        _room: &MatrixRoomId,
        _user: &MatrixUserId,
        _name: &str,
    ) -> Option<bool> {
        *self.confusable.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Network connector mock

#[derive(Debug, Clone, Default)]
pub struct HandlerFlags {
    pub edit: bool,
    pub reaction: bool,
    pub redaction: bool,
    pub read_receipt: bool,
    pub typing: bool,
    pub room_name: bool,
    pub room_topic: bool,
    pub room_avatar: bool,
    pub marked_unread: bool,
    pub room_tag: bool,
    pub mute: bool,
    pub membership: bool,
}

impl HandlerFlags {
    pub fn all() -> Self {
        Self {
            edit: true,
            reaction: true,
            redaction: true,
            read_receipt: true,
            typing: true,
            room_name: true,
            room_topic: true,
            room_avatar: true,
            marked_unread: true,
            room_tag: true,
            mute: true,
            membership: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedMatrixMessage {
    pub event_type: String,
    pub body: String,
    pub thread_root: Option<String>,
    pub reply_to: Option<String>,
    pub orig_sender_name: Option<String>,
}

pub struct MockClient {
    pub remote_user_id: NetworkUserId,
    pub logged_in: AtomicBool,
    pub caps: Mutex<RoomCapabilities>,
    pub handlers: HandlerFlags,
    counter: AtomicU64,
    /// When set, the next Matrix message returns a pending transaction
    /// instead of a finished row.
    pub pending_txn: Mutex<Option<TransactionId>>,
    pub chat_name: Mutex<Option<String>>,
    pub handled_messages: Mutex<Vec<RecordedMatrixMessage>>,
    pub handled_edits: Mutex<Vec<String>>,
    pub handled_reactions: Mutex<Vec<(String, String)>>,
    pub handled_message_removals: Mutex<Vec<String>>,
    pub handled_reaction_removals: Mutex<Vec<String>>,
    pub handled_read_receipts: Mutex<Vec<String>>,
    pub handled_typing: Mutex<Vec<bool>>,
    pub handled_memberships: Mutex<Vec<(String, Membership)>>,
    pub handled_name_changes: Mutex<Vec<String>>,
}

impl MockClient {
    pub fn new(remote_user_id: &str, handlers: HandlerFlags) -> Self {
        Self {
            remote_user_id: NetworkUserId::from(remote_user_id),
            logged_in: AtomicBool::new(true),
            caps: Mutex::new(RoomCapabilities {
                threads: true,
                replies: true,
                edits: true,
                reactions: true,
                captions: true,
                location_messages: true,
                ..RoomCapabilities::default()
            }),
            handlers,
            counter: AtomicU64::new(0),
            pending_txn: Mutex::new(None),
            chat_name: Mutex::new(Some("Test Chat".to_owned())),
            handled_messages: Mutex::new(Vec::new()),
            handled_edits: Mutex::new(Vec::new()),
            handled_reactions: Mutex::new(Vec::new()),
            handled_message_removals: Mutex::new(Vec::new()),
            handled_reaction_removals: Mutex::new(Vec::new()),
            handled_read_receipts: Mutex::new(Vec::new()),
            handled_typing: Mutex::new(Vec::new()),
            handled_memberships: Mutex::new(Vec::new()),
            handled_name_changes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_caps(&self, caps: RoomCapabilities) {
        *self.caps.lock().unwrap() = caps;
    }
}

#[async_trait]
impl NetworkClient for MockClient {
    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn is_this_user(&self, user: &NetworkUserId) -> bool {
        *user == self.remote_user_id
    }

    async fn room_capabilities(&self, _portal: &PortalKey) -> RoomCapabilities {
        self.caps.lock().unwrap().clone()
    }

    async fn get_chat_info(&self, _portal: &PortalKey) -> Result<ChatInfo, BridgeError> {
        Ok(ChatInfo {
            name: self.chat_name.lock().unwrap().clone(),
            members: Some(ChatMemberList {
                is_full: false,
                members: vec![ChatMember {
                    sender: EventSender {
                        sender_id: self.remote_user_id.clone(),
                        sender_login: None,
                        is_from_me: true,
                        force_dm_user: false,
                    },
                    membership: Membership::Join,
                    prev_membership: None,
                    power_level: None,
                    user_info: None,
                }],
                ..ChatMemberList::default()
            }),
            ..ChatInfo::default()
        })
    }

    async fn handle_matrix_message(
        &self,
        req: MatrixMessageRequest<'_>,
    ) -> Result<MatrixMessageResponse, BridgeError> {
        self.handled_messages
            .lock()
            .unwrap()
            .push(RecordedMatrixMessage {
                event_type: req.event_type.to_owned(),
                body: req.content.body.clone(),
                thread_root: req.thread_root.map(|t| t.id.to_string()),
                reply_to: req.reply_to.map(|r| r.id.to_string()),
                orig_sender_name: req.orig_sender.map(|o| o.formatted_name.clone()),
            });

        if let Some(txn) = self.pending_txn.lock().unwrap().take() {
            return Ok(MatrixMessageResponse {
                db_message: None,
                pending: Some(PendingMatrixMessage {
                    transaction_id: txn,
                    on_echo: None,
                }),
            });
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut draft = MessageRecord {
            portal: req.portal.key.clone(),
            id: NetworkMessageId::from(format!("rm-{n}").as_str()),
            part_id: PartId::first(),
            mxid: MatrixEventId::from(""),
            fake_mxid: false,
            sender_id: NetworkUserId::from(""),
            sender_mxid: MatrixUserId::from(""),
            timestamp: DateTime::<Utc>::default(),
            thread_root: None,
            reply_to: None,
            edit_count: 0,
            metadata: Value::Null,
        };
        draft.thread_root = req.thread_root.map(|t| t.id.clone());
        Ok(MatrixMessageResponse {
            db_message: Some(draft),
            pending: None,
        })
    }

    fn edit_handler(&self) -> Option<&dyn EditHandler> {
        self.handlers.edit.then_some(self as &dyn EditHandler)
    }
    fn reaction_handler(&self) -> Option<&dyn ReactionHandler> {
        self.handlers.reaction.then_some(self as &dyn ReactionHandler)
    }
    fn redaction_handler(&self) -> Option<&dyn RedactionHandler> {
        self.handlers
            .redaction
            .then_some(self as &dyn RedactionHandler)
    }
    fn read_receipt_handler(&self) -> Option<&dyn bridge_core::network::ReadReceiptHandler> {
        self.handlers
            .read_receipt
            .then_some(self as &dyn bridge_core::network::ReadReceiptHandler)
    }
    fn typing_handler(&self) -> Option<&dyn TypingHandler> {
        self.handlers.typing.then_some(self as &dyn TypingHandler)
    }
    fn room_name_handler(&self) -> Option<&dyn RoomNameHandler> {
        self.handlers
            .room_name
            .then_some(self as &dyn RoomNameHandler)
    }
    fn room_topic_handler(&self) -> Option<&dyn RoomTopicHandler> {
        self.handlers
            .room_topic
            .then_some(self as &dyn RoomTopicHandler)
    }
    fn room_avatar_handler(&self) -> Option<&dyn RoomAvatarHandler> {
        self.handlers
            .room_avatar
            .then_some(self as &dyn RoomAvatarHandler)
    }
    fn marked_unread_handler(&self) -> Option<&dyn MarkedUnreadHandler> {
        self.handlers
            .marked_unread
            .then_some(self as &dyn MarkedUnreadHandler)
    }
    fn room_tag_handler(&self) -> Option<&dyn RoomTagHandler> {
        self.handlers.room_tag.then_some(self as &dyn RoomTagHandler)
    }
    fn mute_handler(&self) -> Option<&dyn MuteHandler> {
        self.handlers.mute.then_some(self as &dyn MuteHandler)
    }
    fn membership_handler(&self) -> Option<&dyn MembershipHandler> {
        self.handlers
            .membership
            .then_some(self as &dyn MembershipHandler)
    }
}

#[async_trait]
impl EditHandler for MockClient {
    async fn handle_matrix_edit(
        &self,
        _req: MatrixEditRequest<'_>,
        target: &mut MessageRecord,
    ) -> Result<(), BridgeError> {
        self.handled_edits.lock().unwrap().push(target.id.to_string());
        Ok(())
    }
}

#[async_trait]
impl ReactionHandler for MockClient {
    async fn pre_handle_matrix_reaction(
        &self,
        req: &MatrixReactionRequest<'_>,
    ) -> Result<PreHandledReaction, BridgeError> {
        Ok(PreHandledReaction {
            sender_id: self.remote_user_id.clone(),
            emoji_id: EmojiId::from(""),
            emoji: req.key.to_owned(),
            max_reactions: self.caps.lock().unwrap().max_reactions_per_user,
        })
    }

    async fn handle_matrix_reaction(
        &self,
        req: &MatrixReactionRequest<'_>,
        pre: &PreHandledReaction,
    ) -> Result<Value, BridgeError> {
        self.handled_reactions
            .lock()
            .unwrap()
            .push((req.target.id.to_string(), pre.emoji.clone()));
        Ok(Value::Null)
    }

    async fn handle_matrix_reaction_remove(
        &self,
        _req: &MatrixRedactionRequest<'_>,
        target: &ReactionRecord,
    ) -> Result<(), BridgeError> {
        self.handled_reaction_removals
            .lock()
            .unwrap()
            .push(target.emoji.clone());
        Ok(())
    }
}

#[async_trait]
impl RedactionHandler for MockClient {
    async fn handle_matrix_message_remove(
        &self,
        _req: &MatrixRedactionRequest<'_>,
        target: &MessageRecord,
    ) -> Result<(), BridgeError> {
        self.handled_message_removals
            .lock()
            .unwrap()
            .push(target.id.to_string());
        Ok(())
    }
}

#[async_trait]
impl bridge_core::network::ReadReceiptHandler for MockClient {
    async fn handle_matrix_read_receipt(
        &self,
        req: &MatrixReadReceiptRequest<'_>,
    ) -> Result<(), BridgeError> {
        self.handled_read_receipts
            .lock()
            .unwrap()
            .push(req.event_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl TypingHandler for MockClient {
    async fn handle_matrix_typing(
        &self,
        _portal: &PortalRecord,
        typing: bool,
    ) -> Result<(), BridgeError> {
        self.handled_typing.lock().unwrap().push(typing);
        Ok(())
    }
}

#[async_trait]
impl RoomNameHandler for MockClient {
    async fn handle_matrix_room_name(
        &self,
        _portal: &PortalRecord,
        name: &str,
    ) -> Result<bool, BridgeError> {
        self.handled_name_changes.lock().unwrap().push(name.to_owned());
        Ok(true)
    }
}

#[async_trait]
impl RoomTopicHandler for MockClient {
    async fn handle_matrix_room_topic(
        &self,
        _portal: &PortalRecord,
        _topic: &str,
    ) -> Result<bool, BridgeError> {
        Ok(true)
    }
}

#[async_trait]
impl RoomAvatarHandler for MockClient {
    async fn handle_matrix_room_avatar(
        &self,
        _portal: &PortalRecord,
        _avatar_mxc: &str,
    ) -> Result<bool, BridgeError> {
        Ok(true)
    }
}

#[async_trait]
impl MarkedUnreadHandler for MockClient {
    async fn handle_matrix_marked_unread(
        &self,
        _portal: &PortalRecord,
        _unread: bool,
    ) -> Result<(), BridgeError> {
        Ok(())
    }
}

#[async_trait]
impl RoomTagHandler for MockClient {
    async fn handle_matrix_room_tag(
        &self,
        _portal: &PortalRecord,
        _tag: Option<&RoomTag>,
    ) -> Result<(), BridgeError> {
        Ok(())
    }
}

#[async_trait]
impl MuteHandler for MockClient {
    async fn handle_matrix_mute(
        &self,
        _portal: &PortalRecord,
        _muted_until: Option<DateTime<Utc>>,
    ) -> Result<(), BridgeError> {
        Ok(())
    }
}

#[async_trait]
impl MembershipHandler for MockClient {
    async fn handle_matrix_membership(
        &self,
        req: &MatrixMembershipRequest<'_>,
    ) -> Result<(), BridgeError> {
        self.handled_memberships
            .lock()
            .unwrap()
            .push((req.target.to_string(), req.next));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bridge service mocks

pub struct StaticLogins {
    logins: Mutex<HashMap<UserLoginId, Arc<UserLogin>>>,
}

impl StaticLogins {
    pub fn new(logins: Vec<Arc<UserLogin>>) -> Self {
        Self {
            logins: Mutex::new(
                logins
                    .into_iter()
                    .map(|login| (login.id.clone(), login))
                    .collect(),
            ),
        }
    }

    pub fn add(&self, login: Arc<UserLogin>) {
        self.logins.lock().unwrap().insert(login.id.clone(), login);
    }
}

#[async_trait]
impl UserLoginRegistry for StaticLogins {
    async fn get(&self, id: &UserLoginId) -> Option<Arc<UserLogin>> {
        self.logins.lock().unwrap().get(id).cloned()
    }
}

#[derive(Default)]
pub struct StaticGhosts {
    pub profile_updates: Mutex<Vec<(NetworkUserId, UserInfo)>>,
}

pub fn ghost_mxid(remote: &NetworkUserId) -> MatrixUserId {
    MatrixUserId::from(format!("@net_{remote}:hs").as_str())
}

#[async_trait]
impl GhostDirectory for StaticGhosts {
    async fn get(&self, id: &NetworkUserId) -> Result<Arc<Ghost>, BridgeError> {
        Ok(Arc::new(Ghost {
            id: id.clone(),
            mxid: ghost_mxid(id),
            name: None,
        }))
    }

    async fn update_info(&self, id: &NetworkUserId, info: &UserInfo) -> Result<(), BridgeError> {
        self.profile_updates
            .lock()
            .unwrap()
            .push((id.clone(), info.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockScheduler {
    pub enqueued: Mutex<Vec<DisappearingMessage>>,
    pub sweeps: Mutex<Vec<MatrixRoomId>>,
}

#[async_trait]
impl DisappearingScheduler for MockScheduler {
    async fn enqueue(&self, message: DisappearingMessage) {
        self.enqueued.lock().unwrap().push(message);
    }

    async fn sweep(&self, room: &MatrixRoomId) {
        self.sweeps.lock().unwrap().push(room.clone());
    }
}

// ---------------------------------------------------------------------------
// Remote event builders

pub struct TestRemoteMessage {
    pub portal: PortalKey,
    pub id: NetworkMessageId,
    pub sender: EventSender,
    pub txn: Option<TransactionId>,
    pub ts: Option<DateTime<Utc>>,
    /// `(part id, body, dont_bridge)` triples.
    pub parts: Vec<(PartId, String, bool)>,
    pub thread_root: Option<NetworkMessageId>,
    pub reply_to: Option<MessageRef>,
    pub disappear: Option<DisappearingSetting>,
    pub create_portal: bool,
}

impl TestRemoteMessage {
    pub fn text(portal: &PortalKey, id: &str, sender: &str, body: &str) -> Self {
        Self {
            portal: portal.clone(),
            id: NetworkMessageId::from(id),
            sender: EventSender::remote(NetworkUserId::from(sender)),
            txn: None,
            ts: None,
            parts: vec![(PartId::first(), body.to_owned(), false)],
            thread_root: None,
            reply_to: None,
            disappear: None,
            create_portal: false,
        }
    }
}

impl RemoteEvent for TestRemoteMessage {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::Message
    }
    fn portal_key(&self) -> PortalKey {
        self.portal.clone()
    }
    fn sender(&self) -> EventSender {
        self.sender.clone()
    }
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.ts
    }
    fn transaction_id(&self) -> Option<TransactionId> {
        self.txn.clone()
    }
    fn should_create_portal(&self) -> bool {
        self.create_portal
    }
    fn as_message(&self) -> Option<&dyn RemoteMessage> {
        Some(self)
    }
}

#[async_trait]
impl RemoteMessage for TestRemoteMessage {
    fn id(&self) -> NetworkMessageId {
        self.id.clone()
    }

    async fn convert(
        &self,
        _portal: &PortalRecord,
        _intent: &bridge_core::matrix::Intent,
    ) -> Result<ConvertedMessage, BridgeError> {
        let parts = self
            .parts
            .iter()
            .map(|(part_id, body, dont_bridge)| {
                let mut part = ConvertedPart::new(
                    part_id.clone(),
                    event_type::MESSAGE,
                    MessageContent::text(body.clone()),
                );
                part.dont_bridge = *dont_bridge;
                part
            })
            .collect();
        Ok(ConvertedMessage {
            parts,
            thread_root: self.thread_root.clone(),
            reply_to: self.reply_to.clone(),
            disappear: self.disappear,
        })
    }
}

pub struct TestRemoteReaction {
    pub portal: PortalKey,
    pub sender: EventSender,
    pub target: MessageRef,
    pub emoji_id: EmojiId,
    pub emoji: String,
}

impl RemoteEvent for TestRemoteReaction {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::Reaction
    }
    fn portal_key(&self) -> PortalKey {
        self.portal.clone()
    }
    fn sender(&self) -> EventSender {
        self.sender.clone()
    }
    fn as_reaction(&self) -> Option<&dyn RemoteReaction> {
        Some(self)
    }
}

impl RemoteReaction for TestRemoteReaction {
    fn target_message(&self) -> MessageRef {
        self.target.clone()
    }
    fn emoji_id(&self) -> EmojiId {
        self.emoji_id.clone()
    }
    fn emoji(&self) -> String {
        self.emoji.clone()
    }
}

pub struct TestReactionSync {
    pub portal: PortalKey,
    pub sender: EventSender,
    pub target: NetworkMessageId,
    pub data: ReactionSyncData,
}

impl RemoteEvent for TestReactionSync {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::ReactionSync
    }
    fn portal_key(&self) -> PortalKey {
        self.portal.clone()
    }
    fn sender(&self) -> EventSender {
        self.sender.clone()
    }
    fn as_reaction_sync(&self) -> Option<&dyn RemoteReactionSync> {
        Some(self)
    }
}

impl RemoteReactionSync for TestReactionSync {
    fn target_message(&self) -> NetworkMessageId {
        self.target.clone()
    }
    fn reactions(&self) -> ReactionSyncData {
        self.data.clone()
    }
}

pub struct TestReactionRemove {
    pub portal: PortalKey,
    pub sender: EventSender,
    pub target: MessageRef,
    pub emoji_id: EmojiId,
}

impl RemoteEvent for TestReactionRemove {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::ReactionRemove
    }
    fn portal_key(&self) -> PortalKey {
        self.portal.clone()
    }
    fn sender(&self) -> EventSender {
        self.sender.clone()
    }
    fn as_reaction_remove(&self) -> Option<&dyn RemoteReactionRemove> {
        Some(self)
    }
}

impl RemoteReactionRemove for TestReactionRemove {
    fn target_message(&self) -> MessageRef {
        self.target.clone()
    }
    fn emoji_id(&self) -> EmojiId {
        self.emoji_id.clone()
    }
}

pub struct TestMessageRemove {
    pub portal: PortalKey,
    pub sender: EventSender,
    pub target: NetworkMessageId,
}

impl RemoteEvent for TestMessageRemove {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::MessageRemove
    }
    fn portal_key(&self) -> PortalKey {
        self.portal.clone()
    }
    fn sender(&self) -> EventSender {
        self.sender.clone()
    }
    fn as_message_remove(&self) -> Option<&dyn RemoteMessageRemove> {
        Some(self)
    }
}

impl RemoteMessageRemove for TestMessageRemove {
    fn target_message(&self) -> NetworkMessageId {
        self.target.clone()
    }
}

pub struct TestReadReceipt {
    pub portal: PortalKey,
    pub sender: EventSender,
    pub last_target: Option<NetworkMessageId>,
    pub targets: Vec<NetworkMessageId>,
    pub read_up_to: Option<DateTime<Utc>>,
    pub ts: Option<DateTime<Utc>>,
}

impl RemoteEvent for TestReadReceipt {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::ReadReceipt
    }
    fn portal_key(&self) -> PortalKey {
        self.portal.clone()
    }
    fn sender(&self) -> EventSender {
        self.sender.clone()
    }
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.ts
    }
    fn as_read_receipt(&self) -> Option<&dyn RemoteReadReceipt> {
        Some(self)
    }
}

impl RemoteReadReceipt for TestReadReceipt {
    fn last_target(&self) -> Option<NetworkMessageId> {
        self.last_target.clone()
    }
    fn targets(&self) -> Vec<NetworkMessageId> {
        self.targets.clone()
    }
    fn read_up_to(&self) -> Option<DateTime<Utc>> {
        self.read_up_to
    }
}

pub struct TestRemoteTyping {
    pub portal: PortalKey,
    pub sender: EventSender,
}

impl RemoteEvent for TestRemoteTyping {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::Typing
    }
    fn portal_key(&self) -> PortalKey {
        self.portal.clone()
    }
    fn sender(&self) -> EventSender {
        self.sender.clone()
    }
    fn as_typing(&self) -> Option<&dyn RemoteTyping> {
        Some(self)
    }
}

impl RemoteTyping for TestRemoteTyping {}

pub struct TestChatDelete {
    pub portal: PortalKey,
    pub sender: EventSender,
}

impl RemoteEvent for TestChatDelete {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::ChatDelete
    }
    fn portal_key(&self) -> PortalKey {
        self.portal.clone()
    }
    fn sender(&self) -> EventSender {
        self.sender.clone()
    }
}

// ---------------------------------------------------------------------------
// Harness

pub struct TestHarness {
    pub ctx: Arc<BridgeContext>,
    pub registry: PortalRegistry,
    pub matrix: Arc<MockMatrix>,
    pub client: Arc<MockClient>,
    pub login: Arc<UserLogin>,
    pub logins: Arc<StaticLogins>,
    pub ghosts: Arc<StaticGhosts>,
    pub scheduler: Arc<MockScheduler>,
    pub db_connection: DatabaseConnection,
    _dir: tempfile::TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(BridgeConfig::default()).await
    }

    pub async fn with_config(config: BridgeConfig) -> Self {
        Self::with_config_and_flags(config, HandlerFlags::all()).await
    }

    pub async fn with_flags(flags: HandlerFlags) -> Self {
        Self::with_config_and_flags(BridgeConfig::default(), flags).await
    }

    pub async fn with_config_and_flags(config: BridgeConfig, flags: HandlerFlags) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let connection = DatabaseConnection::initialize(DatabaseConfig::for_testing(
            dir.path().join("bridge.db"),
        ))
        .await
        .expect("failed to initialize database");
        let db = Database::sqlite(connection.clone());

        let matrix = Arc::new(MockMatrix::new());
        let client = Arc::new(MockClient::new(REMOTE_SELF, flags));
        let login = Arc::new(UserLogin {
            id: UserLoginId::from(LOGIN_ID),
            user_mxid: MatrixUserId::from(USER_MXID),
            remote_user_id: NetworkUserId::from(REMOTE_SELF),
            remote_name: None,
            double_puppet: None,
            client: client.clone(),
        });
        let logins = Arc::new(StaticLogins::new(vec![login.clone()]));
        let ghosts = Arc::new(StaticGhosts::default());
        let scheduler = Arc::new(MockScheduler::default());

        let ctx = Arc::new(BridgeContext {
            config,
            matrix: matrix.clone(),
            db,
            logins: logins.clone(),
            ghosts: ghosts.clone(),
            disappearing: scheduler.clone(),
        });
        let registry = PortalRegistry::new(Arc::clone(&ctx));

        Self {
            ctx,
            registry,
            matrix,
            client,
            login,
            logins,
            ghosts,
            scheduler,
            db_connection: connection,
            _dir: dir,
        }
    }

    pub fn key(chat: &str) -> PortalKey {
        PortalKey::shared(NetworkChatId::from(chat))
    }

    /// Creates a portal that already has a Matrix room and the default
    /// login registered in it.
    pub async fn portal_with_room(&self, chat: &str) -> Arc<Portal> {
        let key = Self::key(chat);
        let mut record = PortalRecord::new(key.clone());
        record.room_id = Some(MatrixRoomId::from(ROOM_ID));
        self.ctx.db.portals.save(&record).await.unwrap();
        self.ctx
            .db
            .user_portals
            .save(&UserPortalRecord {
                login_id: self.login.id.clone(),
                user_mxid: self.login.user_mxid.clone(),
                portal: key.clone(),
                in_portal: true,
                in_space: false,
                preference: 0,
                last_read: None,
            })
            .await
            .unwrap();
        let room = MatrixRoomId::from(ROOM_ID);
        let mut members = HashMap::new();
        members.insert(MatrixUserId::from(BOT_MXID), Membership::Join);
        members.insert(MatrixUserId::from(USER_MXID), Membership::Join);
        self.matrix.members.lock().unwrap().insert(room, members);
        self.registry.get(&key, false).await.unwrap().unwrap()
    }

    /// Stores a bridged message row.
    pub async fn seed_message(
        &self,
        key: &PortalKey,
        id: &str,
        part: &str,
        mxid: &str,
        sender_remote: &str,
        ts_millis: i64,
    ) -> MessageRecord {
        let record = MessageRecord {
            portal: key.clone(),
            id: NetworkMessageId::from(id),
            part_id: PartId::from(part),
            mxid: MatrixEventId::from(mxid),
            fake_mxid: false,
            sender_id: NetworkUserId::from(sender_remote),
            sender_mxid: ghost_mxid(&NetworkUserId::from(sender_remote)),
            timestamp: DateTime::from_timestamp_millis(ts_millis).unwrap(),
            thread_root: None,
            reply_to: None,
            edit_count: 0,
            metadata: Value::Null,
        };
        self.ctx.db.messages.save(&record).await.unwrap();
        record
    }

    pub async fn seed_reaction(
        &self,
        key: &PortalKey,
        message_id: &str,
        sender: &str,
        emoji_id: &str,
        emoji: &str,
        mxid: &str,
        ts_millis: i64,
    ) -> ReactionRecord {
        let record = ReactionRecord {
            portal: key.clone(),
            message_id: NetworkMessageId::from(message_id),
            message_part_id: PartId::first(),
            sender_id: NetworkUserId::from(sender),
            emoji_id: EmojiId::from(emoji_id),
            emoji: emoji.to_owned(),
            mxid: MatrixEventId::from(mxid),
            timestamp: DateTime::from_timestamp_millis(ts_millis).unwrap(),
            metadata: Value::Null,
        };
        self.ctx.db.reactions.save(&record).await.unwrap();
        record
    }
}

pub fn message_event_from(sender: &str, event_id: &str, body: &str) -> MatrixEvent {
    MatrixEvent {
        id: Some(MatrixEventId::from(event_id)),
        room_id: MatrixRoomId::from(ROOM_ID),
        sender: MatrixUserId::from(sender),
        timestamp: Utc::now(),
        kind: MatrixEventKind::Message {
            event_type: event_type::MESSAGE.to_owned(),
            content: MessageContent::text(body),
        },
    }
}

pub fn room_name_event(event_id: &str, name: &str) -> MatrixEvent {
    MatrixEvent {
        id: Some(MatrixEventId::from(event_id)),
        room_id: MatrixRoomId::from(ROOM_ID),
        sender: MatrixUserId::from(USER_MXID),
        timestamp: Utc::now(),
        kind: MatrixEventKind::RoomName {
            name: name.to_owned(),
        },
    }
}

pub fn message_event(event_id: &str, body: &str) -> MatrixEvent {
    MatrixEvent {
        id: Some(MatrixEventId::from(event_id)),
        room_id: MatrixRoomId::from(ROOM_ID),
        sender: MatrixUserId::from(USER_MXID),
        timestamp: Utc::now(),
        kind: MatrixEventKind::Message {
            event_type: event_type::MESSAGE.to_owned(),
            content: MessageContent::text(body),
        },
    }
}

pub fn message_event_with_content(event_id: &str, content: MessageContent) -> MatrixEvent {
    MatrixEvent {
        id: Some(MatrixEventId::from(event_id)),
        room_id: MatrixRoomId::from(ROOM_ID),
        sender: MatrixUserId::from(USER_MXID),
        timestamp: Utc::now(),
        kind: MatrixEventKind::Message {
            event_type: event_type::MESSAGE.to_owned(),
            content,
        },
    }
}

pub fn reaction_event(event_id: &str, target: &str, key: &str) -> MatrixEvent {
    MatrixEvent {
        id: Some(MatrixEventId::from(event_id)),
        room_id: MatrixRoomId::from(ROOM_ID),
        sender: MatrixUserId::from(USER_MXID),
        timestamp: Utc::now(),
        kind: MatrixEventKind::Reaction {
            target: MatrixEventId::from(target),
            key: key.to_owned(),
        },
    }
}

pub fn redaction_event(event_id: &str, redacts: &str) -> MatrixEvent {
    MatrixEvent {
        id: Some(MatrixEventId::from(event_id)),
        room_id: MatrixRoomId::from(ROOM_ID),
        sender: MatrixUserId::from(USER_MXID),
        timestamp: Utc::now(),
        kind: MatrixEventKind::Redaction {
            redacts: MatrixEventId::from(redacts),
            reason: None,
        },
    }
}

pub fn typing_event(users: &[&str]) -> MatrixEvent {
    MatrixEvent {
        id: None,
        room_id: MatrixRoomId::from(ROOM_ID),
        sender: MatrixUserId::from(USER_MXID),
        timestamp: Utc::now(),
        kind: MatrixEventKind::Typing {
            user_ids: users.iter().map(|u| MatrixUserId::from(*u)).collect(),
        },
    }
}

/// Polls until the condition holds, failing the test after ~2 seconds.
pub async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {description}");
}
